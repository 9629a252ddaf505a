//! Notification rules: who sees what, and which events raise an alert.

use serde_json::{json, Value};

use crate::types::{
    BoxLot, Incident, IncidentPriority, Notification, NotificationKind, NotificationPriority,
};

/// Stock at or below which a lot raises a low-stock alert.
pub const LOW_STOCK_THRESHOLD: i64 = 10;
/// Stock at or below which the alert is high priority.
pub const LOW_STOCK_CRITICAL: i64 = 3;
/// Minimum days between two low-stock alerts for the same lot.
pub const LOW_STOCK_COOLDOWN_DAYS: i64 = 7;
/// Read notifications older than this are purged.
pub const READ_RETENTION_DAYS: i64 = 30;

/// Notification about to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewNotification {
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub recipient_user_id: Option<i64>,
    pub worker_id: Option<i64>,
    pub branch: Option<String>,
    pub extra: Value,
}

/// The reader a notification is filtered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: i64,
    pub branch: String,
}

impl Notification {
    /// Targeted at the viewer (or nobody) and scoped to the viewer's branch (or none).
    pub fn is_visible_to(&self, viewer: &Viewer) -> bool {
        let recipient_ok = self
            .recipient_user_id
            .map_or(true, |id| id == viewer.user_id);
        let branch_ok = self
            .branch
            .as_deref()
            .map_or(true, |branch| branch == viewer.branch);
        recipient_ok && branch_ok
    }
}

/// Builds the low-stock alert for a lot after a decrement, if the stock level warrants one.
///
/// The seven day cooldown is checked by the caller against stored notifications.
pub fn low_stock_alert(lot: &BoxLot, branch_name: &str) -> Option<NewNotification> {
    let stock = lot.available_quantity;
    if stock <= 0 || stock > LOW_STOCK_THRESHOLD {
        return None;
    }

    let priority = if stock <= LOW_STOCK_CRITICAL {
        NotificationPriority::High
    } else {
        NotificationPriority::Medium
    };
    let unit = if stock == 1 { "box" } else { "boxes" };

    Some(NewNotification {
        kind: NotificationKind::LowStock,
        title: format!("Low stock at {branch_name}"),
        message: format!(
            "Lot {} ({}) has {stock} {unit} left.",
            lot.code,
            lot.contract_type.label()
        ),
        priority,
        recipient_user_id: None,
        worker_id: None,
        branch: Some(lot.branch.clone()),
        extra: json!({
            "box_id": lot.id,
            "box_code": lot.code,
            "branch": lot.branch,
            "contract_type": lot.contract_type,
            "quantity": stock,
        }),
    })
}

/// Alert raised for supervisors of the reporter's branch when an incident is filed.
pub fn new_incident_alert(
    incident: &Incident,
    reporter_name: &str,
    branch: &str,
) -> NewNotification {
    let priority = match incident.priority {
        IncidentPriority::Critical | IncidentPriority::High => NotificationPriority::High,
        IncidentPriority::Medium => NotificationPriority::Medium,
        IncidentPriority::Low => NotificationPriority::Low,
    };

    let mut summary: String = incident.description.chars().take(100).collect();
    if incident.description.chars().count() > 100 {
        summary.push_str("...");
    }

    NewNotification {
        kind: NotificationKind::NewIncident,
        title: format!("New incident: {}", incident.kind.label()),
        message: format!("{reporter_name} reported: {summary}"),
        priority,
        recipient_user_id: None,
        worker_id: incident.worker_id,
        branch: Some(branch.to_string()),
        extra: json!({
            "incident_id": incident.id,
            "kind": incident.kind,
            "priority": incident.priority,
        }),
    }
}
