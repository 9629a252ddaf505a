use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

/// Error returned when a wire value does not match any known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} value '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Declares a string-backed enum persisted as TEXT and exchanged as JSON strings.
///
/// The first literal of each arm is the canonical representation; the optional
/// trailing literals are accepted as aliases when parsing.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident ($kind:literal) {
            $($variant:ident => $wire:literal, $label:literal $(| $alias:literal)*;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            /// Returns the canonical database and JSON representation.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $wire,)+
                }
            }

            /// Returns the human readable label.
            pub fn label(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim() {
                    $($wire $(| $alias)* => Ok(Self::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

wire_enum! {
    /// Staff role used for authorization.
    Role("role") {
        Guard => "guard", "Guard" | "guardia";
        Supervisor => "supervisor", "Supervisor";
        Hr => "hr", "Human Resources" | "rrhh";
    }
}

wire_enum! {
    /// Employment contract of a worker, also the contract a box lot is reserved for.
    ContractType("contract_type") {
        Indefinite => "indefinite", "Indefinite" | "indefinido";
        FixedTerm => "fixed_term", "Fixed Term" | "plazo_fijo";
    }
}

wire_enum! {
    /// Whether a worker already withdrew their box.
    WorkerStatus("worker_status") {
        Pending => "pending", "Pending" | "pendiente";
        Withdrawn => "withdrawn", "Withdrawn" | "retirado";
    }
}

wire_enum! {
    DeliveryStatus("delivery_status") {
        Delivered => "delivered", "Delivered" | "entregado";
        NotDelivered => "not_delivered", "Not Delivered" | "no_entregado";
        Pending => "pending", "Pending" | "pendiente";
    }
}

impl DeliveryStatus {
    /// Statuses that count as the worker already holding a delivery.
    pub const ACTIVE: &'static [DeliveryStatus] = &[Self::Delivered, Self::Pending];
}

wire_enum! {
    /// How a campaign selects the areas it serves.
    DeliveryMode("delivery_mode") {
        General => "general", "General (all areas)";
        Group => "group", "By group (selected areas)" | "grupo";
    }
}

wire_enum! {
    IncidentKind("incident_kind") {
        QrNotWorking => "qr_not_working", "QR not working" | "qr_no_funciona";
        WorkerNotRegistered => "worker_not_registered", "Worker not registered" | "trabajador_no_registrado";
        DamagedBox => "damaged_box", "Damaged box" | "caja_danada";
        InsufficientStock => "insufficient_stock", "Insufficient stock" | "stock_insuficiente";
        WorkerWithoutBenefit => "worker_without_benefit", "Worker without benefit" | "trabajador_sin_beneficio";
        ContractMismatch => "contract_mismatch", "Contract mismatch" | "incompatibilidad_contrato";
        SystemDown => "system_down", "System down" | "sistema_caido";
        Other => "other", "Other" | "otro";
    }
}

wire_enum! {
    IncidentStatus("incident_status") {
        Pending => "pending", "Pending" | "pendiente";
        InProgress => "in_progress", "In Progress" | "en_proceso";
        Resolved => "resolved", "Resolved" | "resuelto";
        Rejected => "rejected", "Rejected" | "rechazado";
    }
}

impl IncidentStatus {
    /// Returns `true` once no further supervisor work is expected.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Resolved | Self::Rejected)
    }
}

wire_enum! {
    IncidentPriority("incident_priority") {
        Low => "low", "Low" | "baja";
        Medium => "medium", "Medium" | "media";
        High => "high", "High" | "alta";
        Critical => "critical", "Critical" | "critica";
    }
}

wire_enum! {
    NotificationKind("notification_kind") {
        Info => "info", "Information";
        Warning => "warning", "Warning";
        Success => "success", "Success";
        Delivery => "delivery", "Delivery" | "entrega";
        LowStock => "low_stock", "Low stock" | "stock_bajo";
        NewIncident => "new_incident", "New incident" | "incidencia_nueva";
        DailySummary => "daily_summary", "Daily summary" | "resumen_diario";
    }
}

wire_enum! {
    NotificationPriority("notification_priority") {
        Low => "low", "Low" | "baja";
        Medium => "medium", "Medium" | "media";
        High => "high", "High" | "alta";
    }
}

wire_enum! {
    QrStatus("qr_status") {
        Generated => "generated", "Generated";
        Sent => "sent", "Sent";
    }
}

/// Staff account. Password material never leaves the storage layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
    pub branch: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Returns "first last", falling back to the username when both are blank.
    pub fn full_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let trimmed = name.trim();
        if trimmed.is_empty() {
            self.username.clone()
        } else {
            trimmed.to_string()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub address: Option<String>,
    pub active: bool,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Area {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub description: Option<String>,
    pub active: bool,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Employee entitled to a safety box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    pub rut: String,
    pub first_name: String,
    pub paternal_surname: String,
    pub maternal_surname: String,
    pub position: String,
    pub contract_type: ContractType,
    pub period: String,
    pub branch: String,
    pub area: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub status: WorkerStatus,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn full_name(&self) -> String {
        format!(
            "{} {} {}",
            self.first_name, self.paternal_surname, self.maternal_surname
        )
        .trim()
        .to_string()
    }

    pub fn surnames(&self) -> String {
        format!("{} {}", self.paternal_surname, self.maternal_surname)
            .trim()
            .to_string()
    }

    /// First name plus paternal surname, as printed on reports.
    pub fn short_name(&self) -> String {
        format!("{} {}", self.first_name, self.paternal_surname)
    }
}

/// Inventory lot: a count of boxes for one branch and contract type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxLot {
    pub id: i64,
    pub code: String,
    pub contract_type: ContractType,
    pub branch: String,
    pub available_quantity: i64,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub worker_id: i64,
    pub box_id: Option<i64>,
    pub guard_id: Option<i64>,
    pub delivered_at: DateTime<Utc>,
    pub status: DeliveryStatus,
    pub notes: String,
    pub worker_qr_code: String,
    pub box_qr_code: String,
    pub supervisor_validated: bool,
    pub supervisor_id: Option<i64>,
    pub validated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub branch: String,
    pub delivery_mode: DeliveryMode,
    pub selected_areas: Vec<String>,
    pub contract_types: Vec<ContractType>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub active: bool,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: i64,
    pub worker_id: Option<i64>,
    pub guard_id: Option<i64>,
    pub supervisor_id: Option<i64>,
    pub delivery_id: Option<i64>,
    pub kind: IncidentKind,
    pub description: String,
    pub priority: IncidentPriority,
    pub status: IncidentStatus,
    pub reported_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub solution: String,
    pub manual_worker_rut: String,
    pub notified: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub priority: NotificationPriority,
    pub recipient_user_id: Option<i64>,
    pub worker_id: Option<i64>,
    pub branch: Option<String>,
    pub extra: Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrRecord {
    pub id: i64,
    pub worker_id: i64,
    pub validation_hash: String,
    pub status: QrStatus,
    #[serde(skip_serializing)]
    pub svg: Option<String>,
    pub generated_at: Option<DateTime<Utc>>,
    pub email_sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_values_and_aliases() {
        assert_eq!("indefinite".parse::<ContractType>(), Ok(ContractType::Indefinite));
        assert_eq!("plazo_fijo".parse::<ContractType>(), Ok(ContractType::FixedTerm));
        assert_eq!("rrhh".parse::<Role>(), Ok(Role::Hr));
        assert_eq!(" guardia ".parse::<Role>(), Ok(Role::Guard));
        assert_eq!(
            "stock_insuficiente".parse::<IncidentKind>(),
            Ok(IncidentKind::InsufficientStock)
        );

        let err = "manager".parse::<Role>().unwrap_err();
        assert_eq!(err.kind, "role");
        assert_eq!(err.value, "manager");
    }

    #[test]
    fn serializes_to_canonical_strings() {
        let json = serde_json::to_string(&ContractType::FixedTerm).expect("serialize");
        assert_eq!(json, "\"fixed_term\"");

        let decoded: Vec<ContractType> =
            serde_json::from_str(r#"["indefinido", "fixed_term"]"#).expect("deserialize");
        assert_eq!(
            decoded,
            vec![ContractType::Indefinite, ContractType::FixedTerm]
        );

        assert!(serde_json::from_str::<IncidentStatus>("\"closed\"").is_err());
    }

    #[test]
    fn worker_names_are_composed() {
        let now = Utc::now();
        let worker = Worker {
            id: 1,
            rut: "12345678-9".into(),
            first_name: "Ana".into(),
            paternal_surname: "Rojas".into(),
            maternal_surname: "Soto".into(),
            position: "Operator".into(),
            contract_type: ContractType::Indefinite,
            period: "2025".into(),
            branch: "casablanca".into(),
            area: None,
            email: None,
            phone: None,
            status: WorkerStatus::Pending,
            active: true,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(worker.full_name(), "Ana Rojas Soto");
        assert_eq!(worker.surnames(), "Rojas Soto");
        assert_eq!(worker.short_name(), "Ana Rojas");
    }
}
