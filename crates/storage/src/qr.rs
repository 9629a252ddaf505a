use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

use safebox_core::types::{QrRecord, QrStatus};

use crate::{decode_enum, to_rfc3339, violation, Violation};

const QR_COLUMNS: &str =
    "id, worker_id, validation_hash, status, svg, generated_at, email_sent, sent_at";

/// QR record joined with its worker, without the rendered image.
#[derive(Debug, Clone, PartialEq)]
pub struct QrDetail {
    pub record: QrRecord,
    pub worker_rut: String,
    pub worker_name: String,
    pub worker_email: Option<String>,
    pub worker_active: bool,
}

#[derive(Debug, Error)]
pub enum QrError {
    #[error("no QR code has been generated for this worker")]
    NotGenerated,
    #[error("worker not found")]
    UnknownWorker,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_record(row: &SqliteRow) -> Result<QrRecord, sqlx::Error> {
    Ok(QrRecord {
        id: row.try_get("id")?,
        worker_id: row.try_get("worker_id")?,
        validation_hash: row.try_get("validation_hash")?,
        status: decode_enum(row, "status")?,
        svg: row.try_get("svg")?,
        generated_at: row.try_get("generated_at")?,
        email_sent: row.try_get("email_sent")?,
        sent_at: row.try_get("sent_at")?,
    })
}

/// Repository for worker QR codes. One record per worker.
#[derive(Clone)]
pub struct QrRepository {
    pool: SqlitePool,
}

impl QrRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records ordered by worker surname.
    pub async fn list(&self) -> Result<Vec<QrDetail>, QrError> {
        let rows = sqlx::query(
            "SELECT q.id, q.worker_id, q.validation_hash, q.status, NULL AS svg, q.generated_at, \
                    q.email_sent, q.sent_at, w.rut, w.email, w.active, \
                    TRIM(w.first_name || ' ' || w.paternal_surname || ' ' || w.maternal_surname) AS name \
               FROM qr_codes q JOIN workers w ON w.id = q.worker_id \
              ORDER BY w.paternal_surname, w.maternal_surname, w.first_name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut details = Vec::with_capacity(rows.len());
        for row in &rows {
            details.push(QrDetail {
                record: map_record(row)?,
                worker_rut: row.try_get("rut")?,
                worker_name: row.try_get("name")?,
                worker_email: row.try_get("email")?,
                worker_active: row.try_get("active")?,
            });
        }
        Ok(details)
    }

    pub async fn find_by_worker(&self, worker_id: i64) -> Result<Option<QrRecord>, QrError> {
        let row = sqlx::query(&format!("SELECT {QR_COLUMNS} FROM qr_codes WHERE worker_id = ?"))
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_record).transpose()?)
    }

    /// Creates the worker's record or replaces its hash and image, resetting the sent state.
    pub async fn upsert_generated(
        &self,
        worker_id: i64,
        hash: &str,
        svg: &str,
        now: DateTime<Utc>,
    ) -> Result<QrRecord, QrError> {
        let row = sqlx::query(&format!(
            "INSERT INTO qr_codes (worker_id, validation_hash, status, svg, generated_at, email_sent) \
             VALUES (?, ?, 'generated', ?, ?, 0) \
             ON CONFLICT (worker_id) DO UPDATE SET \
                 validation_hash = excluded.validation_hash, status = 'generated', svg = excluded.svg, \
                 generated_at = excluded.generated_at, email_sent = 0, sent_at = NULL \
             RETURNING {QR_COLUMNS}"
        ))
        .bind(worker_id)
        .bind(hash)
        .bind(svg)
        .bind(to_rfc3339(now))
        .fetch_all(&self.pool)
        .await
        .map_err(|err| match violation(&err) {
            Some((Violation::ForeignKey, _)) => QrError::UnknownWorker,
            _ => QrError::Database(err),
        })?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        Ok(map_record(&row)?)
    }

    pub async fn mark_sent(&self, worker_id: i64, now: DateTime<Utc>) -> Result<QrRecord, QrError> {
        let row = sqlx::query(&format!(
            "UPDATE qr_codes SET status = 'sent', email_sent = 1, sent_at = ? \
             WHERE worker_id = ? RETURNING {QR_COLUMNS}"
        ))
        .bind(to_rfc3339(now))
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .ok_or(QrError::NotGenerated)?;
        Ok(map_record(&row)?)
    }

    /// Records generated but not yet sent.
    pub async fn list_generated(&self) -> Result<Vec<QrRecord>, QrError> {
        let rows = sqlx::query(&format!(
            "SELECT {QR_COLUMNS} FROM qr_codes WHERE status = ? ORDER BY worker_id"
        ))
        .bind(QrStatus::Generated.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_record).collect::<Result<_, _>>()?)
    }
}
