use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;

use safebox_core::incident::sla;
use safebox_core::notification::NewNotification;
use safebox_core::types::{Incident, IncidentKind, IncidentPriority, IncidentStatus, Notification};

use crate::notifications::insert_notification;
use crate::{decode_enum, like_pattern, to_rfc3339, violation, Violation};

const INCIDENT_COLUMNS: &str = "id, worker_id, guard_id, supervisor_id, delivery_id, kind, \
     description, priority, status, reported_at, resolved_at, solution, manual_worker_rut, notified";

const DETAIL_SELECT: &str = "SELECT i.id, i.worker_id, i.guard_id, i.supervisor_id, i.delivery_id, \
            i.kind, i.description, i.priority, i.status, i.reported_at, i.resolved_at, \
            i.solution, i.manual_worker_rut, i.notified, \
            w.rut AS worker_rut, \
            TRIM(w.first_name || ' ' || w.paternal_surname || ' ' || w.maternal_surname) AS worker_name, \
            g.username AS guard_username, \
            TRIM(g.first_name || ' ' || g.last_name) AS guard_name, \
            s.username AS supervisor_username, \
            TRIM(s.first_name || ' ' || s.last_name) AS supervisor_name \
       FROM incidents i \
       LEFT JOIN workers w ON w.id = i.worker_id \
       LEFT JOIN users g ON g.id = i.guard_id \
       LEFT JOIN users s ON s.id = i.supervisor_id";

/// Incident as filed by a guard.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub worker_id: Option<i64>,
    pub guard_id: Option<i64>,
    pub delivery_id: Option<i64>,
    pub kind: IncidentKind,
    pub description: String,
    pub priority: IncidentPriority,
    /// RUT typed by the guard when it matched no registered worker.
    pub manual_worker_rut: String,
}

/// Incident joined with the people it references.
#[derive(Debug, Clone, PartialEq)]
pub struct IncidentDetail {
    pub incident: Incident,
    pub worker_rut: Option<String>,
    pub worker_name: Option<String>,
    pub guard_username: Option<String>,
    pub guard_name: Option<String>,
    pub supervisor_username: Option<String>,
    pub supervisor_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub guard_id: Option<i64>,
    pub status: Option<IncidentStatus>,
    /// Matches description, kind, solution, and the worker's rut and names.
    pub search: Option<String>,
    pub limit: Option<i64>,
}

/// Incident totals per status for the supervisor dashboard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncidentStatusCounts {
    pub total: i64,
    pub pending: i64,
    pub in_progress: i64,
    pub resolved: i64,
    pub rejected: i64,
    /// Open incidents older than the SLA of their priority.
    pub overdue: i64,
}

#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("incident not found")]
    NotFound,
    #[error("referenced worker, user or delivery does not exist")]
    MissingReference,
    #[error("incident is now {current}, not {expected}")]
    StatusChanged {
        expected: IncidentStatus,
        current: IncidentStatus,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_write_error(err: sqlx::Error) -> IncidentError {
    match violation(&err) {
        Some((Violation::ForeignKey, _)) => IncidentError::MissingReference,
        _ => IncidentError::Database(err),
    }
}

fn map_incident(row: &SqliteRow) -> Result<Incident, sqlx::Error> {
    Ok(Incident {
        id: row.try_get("id")?,
        worker_id: row.try_get("worker_id")?,
        guard_id: row.try_get("guard_id")?,
        supervisor_id: row.try_get("supervisor_id")?,
        delivery_id: row.try_get("delivery_id")?,
        kind: decode_enum(row, "kind")?,
        description: row.try_get("description")?,
        priority: decode_enum(row, "priority")?,
        status: decode_enum(row, "status")?,
        reported_at: row.try_get("reported_at")?,
        resolved_at: row.try_get("resolved_at")?,
        solution: row.try_get("solution")?,
        manual_worker_rut: row.try_get("manual_worker_rut")?,
        notified: row.try_get("notified")?,
    })
}

/// Blank joined names (a user without first and last name) read as absent.
fn name_column(row: &SqliteRow, column: &str) -> Result<Option<String>, sqlx::Error> {
    let value: Option<String> = row.try_get(column)?;
    Ok(value.filter(|v| !v.is_empty()))
}

fn map_detail(row: &SqliteRow) -> Result<IncidentDetail, sqlx::Error> {
    Ok(IncidentDetail {
        incident: map_incident(row)?,
        worker_rut: row.try_get("worker_rut")?,
        worker_name: name_column(row, "worker_name")?,
        guard_username: row.try_get("guard_username")?,
        guard_name: name_column(row, "guard_name")?,
        supervisor_username: row.try_get("supervisor_username")?,
        supervisor_name: name_column(row, "supervisor_name")?,
    })
}

/// Repository for incidents reported at the gate.
#[derive(Clone)]
pub struct IncidentRepository {
    pool: SqlitePool,
}

impl IncidentRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stores an incident together with the alert built for it, flagging it as notified.
    pub async fn insert_with_alert<F>(
        &self,
        incident: &NewIncident,
        alert: F,
        now: DateTime<Utc>,
    ) -> Result<(Incident, Notification), IncidentError>
    where
        F: FnOnce(&Incident) -> NewNotification,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "INSERT INTO incidents \
             (worker_id, guard_id, delivery_id, kind, description, priority, status, reported_at, \
              manual_worker_rut, notified) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1) RETURNING {INCIDENT_COLUMNS}"
        ))
        .bind(incident.worker_id)
        .bind(incident.guard_id)
        .bind(incident.delivery_id)
        .bind(incident.kind.as_str())
        .bind(incident.description.trim())
        .bind(incident.priority.as_str())
        .bind(IncidentStatus::Pending.as_str())
        .bind(to_rfc3339(now))
        .bind(&incident.manual_worker_rut)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        let stored = map_incident(&row)?;

        let notification = insert_notification(&mut *tx, &alert(&stored), now).await?;
        tx.commit().await?;

        Ok((stored, notification))
    }

    pub async fn find(&self, id: i64) -> Result<Option<IncidentDetail>, IncidentError> {
        let row = sqlx::query(&format!("{DETAIL_SELECT} WHERE i.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_detail).transpose()?)
    }

    /// Newest first.
    pub async fn list(&self, filter: &IncidentFilter) -> Result<Vec<IncidentDetail>, IncidentError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(DETAIL_SELECT);
        builder.push(" WHERE 1 = 1");
        if let Some(guard_id) = filter.guard_id {
            builder.push(" AND i.guard_id = ").push_bind(guard_id);
        }
        if let Some(status) = filter.status {
            builder.push(" AND i.status = ").push_bind(status.as_str());
        }
        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let pattern = like_pattern(search);
            builder.push(" AND (");
            let mut separated = builder.separated(" OR ");
            for column in [
                "i.description",
                "i.kind",
                "i.solution",
                "i.manual_worker_rut",
                "w.rut",
                "w.first_name",
                "w.paternal_surname",
                "w.maternal_surname",
            ] {
                separated
                    .push(format!("{column} LIKE "))
                    .push_bind_unseparated(pattern.clone())
                    .push_unseparated(" ESCAPE '\\'");
            }
            builder.push(")");
        }
        builder.push(" ORDER BY i.reported_at DESC, i.id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit.max(0));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(map_detail).collect::<Result<_, _>>()?)
    }

    /// Persists the supervisor-managed fields of an incident whose stored status is still
    /// `expected`. A concurrent transition in between yields [`IncidentError::StatusChanged`].
    pub async fn save(
        &self,
        incident: &Incident,
        expected: IncidentStatus,
    ) -> Result<Incident, IncidentError> {
        let rows = sqlx::query(&format!(
            "UPDATE incidents SET status = ?, priority = ?, supervisor_id = ?, solution = ?, \
             resolved_at = ? WHERE id = ? AND status = ? RETURNING {INCIDENT_COLUMNS}"
        ))
        .bind(incident.status.as_str())
        .bind(incident.priority.as_str())
        .bind(incident.supervisor_id)
        .bind(&incident.solution)
        .bind(incident.resolved_at.map(to_rfc3339))
        .bind(incident.id)
        .bind(expected.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?;
        if let Some(row) = rows.first() {
            return Ok(map_incident(row)?);
        }

        let current = sqlx::query("SELECT status FROM incidents WHERE id = ?")
            .bind(incident.id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(IncidentError::NotFound)?;
        Err(IncidentError::StatusChanged {
            expected,
            current: decode_enum(&current, "status")?,
        })
    }

    pub async fn status_counts(
        &self,
        now: DateTime<Utc>,
    ) -> Result<IncidentStatusCounts, IncidentError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM incidents GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = IncidentStatusCounts::default();
        for row in &rows {
            let total: i64 = row.try_get("total")?;
            counts.total += total;
            match decode_enum::<IncidentStatus>(row, "status")? {
                IncidentStatus::Pending => counts.pending = total,
                IncidentStatus::InProgress => counts.in_progress = total,
                IncidentStatus::Resolved => counts.resolved = total,
                IncidentStatus::Rejected => counts.rejected = total,
            }
        }

        let open = sqlx::query(
            "SELECT priority, reported_at FROM incidents WHERE status IN ('pending', 'in_progress')",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &open {
            let priority: IncidentPriority = decode_enum(row, "priority")?;
            let reported_at: DateTime<Utc> = row.try_get("reported_at")?;
            if now - reported_at > sla(priority) {
                counts.overdue += 1;
            }
        }

        Ok(counts)
    }

    /// Pending incidents reported by one guard.
    pub async fn count_pending_for_guard(&self, guard_id: i64) -> Result<i64, IncidentError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM incidents WHERE guard_id = ? AND status = 'pending'",
        )
        .bind(guard_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }
}
