//! Incident priorities, SLA tracking and supervisor transitions.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::humanize::unresolved_for;
use crate::types::{Incident, IncidentKind, IncidentPriority, IncidentStatus};

pub const REJECTION_PREFIX: &str = "REJECTED: ";

/// Priority assigned when the reporter does not pick one.
pub fn default_priority(kind: IncidentKind) -> IncidentPriority {
    match kind {
        IncidentKind::InsufficientStock | IncidentKind::SystemDown => IncidentPriority::Critical,
        IncidentKind::WorkerWithoutBenefit
        | IncidentKind::DamagedBox
        | IncidentKind::ContractMismatch => IncidentPriority::High,
        _ => IncidentPriority::Medium,
    }
}

/// Maximum time an incident may stay open for its priority.
pub fn sla(priority: IncidentPriority) -> Duration {
    match priority {
        IncidentPriority::Critical => Duration::hours(2),
        IncidentPriority::High => Duration::hours(4),
        IncidentPriority::Medium => Duration::hours(24),
        IncidentPriority::Low => Duration::hours(48),
    }
}

/// Supervisor action on an incident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncidentAction {
    Take { note: Option<String> },
    Resolve { solution: String },
    Reject { reason: String },
    Reopen,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IncidentTransitionError {
    #[error("cannot move an incident from {from} to {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("a solution is required to resolve an incident")]
    MissingSolution,
    #[error("a reason is required to reject an incident")]
    MissingReason,
    #[error("the incident is already pending")]
    AlreadyPending,
}

impl IncidentTransitionError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::MissingSolution => "missing_solution",
            Self::MissingReason => "missing_reason",
            Self::AlreadyPending => "already_pending",
        }
    }
}

impl Incident {
    /// Time the incident has been open, or took to resolve. `None` for rejected incidents.
    pub fn open_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.status {
            IncidentStatus::Resolved => self.resolved_at.map(|at| at - self.reported_at),
            IncidentStatus::Rejected => None,
            _ => Some(now - self.reported_at),
        }
    }

    pub fn unresolved_for(&self, now: DateTime<Utc>) -> Option<String> {
        self.open_duration(now).map(unresolved_for)
    }

    /// Open past the SLA of its priority.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        if self.status.is_closed() {
            return false;
        }
        now - self.reported_at > sla(self.priority)
    }

    /// Applies a supervisor action in place.
    pub fn apply(
        &mut self,
        action: IncidentAction,
        supervisor_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), IncidentTransitionError> {
        match action {
            IncidentAction::Take { note } => {
                self.expect_status(&[IncidentStatus::Pending], IncidentStatus::InProgress)?;
                self.status = IncidentStatus::InProgress;
                self.supervisor_id = Some(supervisor_id);
                if let Some(note) = note.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()) {
                    self.solution = note;
                }
            }
            IncidentAction::Resolve { solution } => {
                let solution = solution.trim();
                if solution.is_empty() {
                    return Err(IncidentTransitionError::MissingSolution);
                }
                self.expect_status(
                    &[IncidentStatus::Pending, IncidentStatus::InProgress],
                    IncidentStatus::Resolved,
                )?;
                self.status = IncidentStatus::Resolved;
                self.supervisor_id = Some(supervisor_id);
                self.solution = solution.to_string();
                self.resolved_at = Some(now);
            }
            IncidentAction::Reject { reason } => {
                let reason = reason.trim();
                if reason.is_empty() {
                    return Err(IncidentTransitionError::MissingReason);
                }
                self.expect_status(
                    &[IncidentStatus::Pending, IncidentStatus::InProgress],
                    IncidentStatus::Rejected,
                )?;
                self.status = IncidentStatus::Rejected;
                self.supervisor_id = Some(supervisor_id);
                self.solution = format!("{REJECTION_PREFIX}{reason}");
                self.resolved_at = Some(now);
            }
            IncidentAction::Reopen => {
                if self.status == IncidentStatus::Pending {
                    return Err(IncidentTransitionError::AlreadyPending);
                }
                self.status = IncidentStatus::Pending;
                self.solution.clear();
                self.supervisor_id = None;
                self.resolved_at = None;
            }
        }
        Ok(())
    }

    fn expect_status(
        &self,
        allowed: &[IncidentStatus],
        to: IncidentStatus,
    ) -> Result<(), IncidentTransitionError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(IncidentTransitionError::InvalidTransition {
                from: self.status,
                to,
            })
        }
    }
}
