use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use thiserror::Error;

use safebox_core::notification::{NewNotification, Viewer};
use safebox_core::types::{Notification, NotificationKind, NotificationPriority};

use crate::{decode_enum, decode_json, encode_json, to_rfc3339};

const NOTIFICATION_COLUMNS: &str = "id, kind, title, message, priority, recipient_user_id, \
     worker_id, branch, extra, read, created_at, read_at";

const VISIBLE: &str =
    "(recipient_user_id IS NULL OR recipient_user_id = ?) AND (branch IS NULL OR branch = ?)";

#[derive(Debug, Clone, Default)]
pub struct NotificationFilter {
    pub kind: Option<NotificationKind>,
    pub read: Option<bool>,
    pub priority: Option<NotificationPriority>,
    pub limit: Option<i64>,
}

/// Visible notification counts for one reader.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationStats {
    pub total: i64,
    pub unread: i64,
    /// `(kind, count, unread)` for kinds with at least one notification.
    pub by_kind: Vec<(NotificationKind, i64, i64)>,
    pub by_priority: Vec<(NotificationPriority, i64)>,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_notification(row: &SqliteRow) -> Result<Notification, sqlx::Error> {
    Ok(Notification {
        id: row.try_get("id")?,
        kind: decode_enum(row, "kind")?,
        title: row.try_get("title")?,
        message: row.try_get("message")?,
        priority: decode_enum(row, "priority")?,
        recipient_user_id: row.try_get("recipient_user_id")?,
        worker_id: row.try_get("worker_id")?,
        branch: row.try_get("branch")?,
        extra: decode_json(row, "extra")?,
        read: row.try_get("read")?,
        created_at: row.try_get("created_at")?,
        read_at: row.try_get("read_at")?,
    })
}

/// Inserts a notification on an existing connection, typically inside a transaction.
pub(crate) async fn insert_notification(
    conn: &mut SqliteConnection,
    notification: &NewNotification,
    now: DateTime<Utc>,
) -> Result<Notification, sqlx::Error> {
    let extra = encode_json(&notification.extra)?;
    let row = sqlx::query(&format!(
        "INSERT INTO notifications \
         (kind, title, message, priority, recipient_user_id, worker_id, branch, extra, read, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?) RETURNING {NOTIFICATION_COLUMNS}"
    ))
    .bind(notification.kind.as_str())
    .bind(&notification.title)
    .bind(&notification.message)
    .bind(notification.priority.as_str())
    .bind(notification.recipient_user_id)
    .bind(notification.worker_id)
    .bind(&notification.branch)
    .bind(extra)
    .bind(to_rfc3339(now))
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .next()
    .ok_or(sqlx::Error::RowNotFound)?;
    map_notification(&row)
}

/// Whether a low-stock alert for `box_id` was raised at or after `since`.
pub(crate) async fn recent_low_stock_exists(
    conn: &mut SqliteConnection,
    box_id: i64,
    since: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM notifications \
                         WHERE kind = ? AND json_extract(extra, '$.box_id') = ? \
                           AND created_at >= ?) AS found",
    )
    .bind(NotificationKind::LowStock.as_str())
    .bind(box_id)
    .bind(to_rfc3339(since))
    .fetch_one(&mut *conn)
    .await?;
    row.try_get("found")
}

/// Repository for in-app notifications.
#[derive(Clone)]
pub struct NotificationRepository {
    pool: SqlitePool,
}

impl NotificationRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        notification: &NewNotification,
        now: DateTime<Utc>,
    ) -> Result<Notification, NotificationError> {
        let mut conn = self.pool.acquire().await?;
        Ok(insert_notification(&mut conn, notification, now).await?)
    }

    pub async fn find_visible(
        &self,
        id: i64,
        viewer: &Viewer,
    ) -> Result<Notification, NotificationError> {
        let row = sqlx::query(&format!(
            "SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE id = ? AND {VISIBLE}"
        ))
        .bind(id)
        .bind(viewer.user_id)
        .bind(&viewer.branch)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(NotificationError::NotFound)?;
        Ok(map_notification(&row)?)
    }

    /// Newest first.
    pub async fn list(
        &self,
        viewer: &Viewer,
        filter: &NotificationFilter,
    ) -> Result<Vec<Notification>, NotificationError> {
        let mut builder = visible_query(
            format!("SELECT {NOTIFICATION_COLUMNS} FROM notifications WHERE "),
            viewer,
        );
        if let Some(kind) = filter.kind {
            builder.push(" AND kind = ").push_bind(kind.as_str());
        }
        if let Some(read) = filter.read {
            builder.push(" AND read = ").push_bind(read);
        }
        if let Some(priority) = filter.priority {
            builder.push(" AND priority = ").push_bind(priority.as_str());
        }
        builder.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit.max(0));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(map_notification).collect::<Result<_, _>>()?)
    }

    pub async fn stats(&self, viewer: &Viewer) -> Result<NotificationStats, NotificationError> {
        let rows = visible_query(
            "SELECT kind, COUNT(*) AS total, SUM(CASE WHEN read = 0 THEN 1 ELSE 0 END) AS unread \
               FROM notifications WHERE "
                .to_string(),
            viewer,
        )
        .push(" GROUP BY kind ORDER BY kind")
        .build()
        .fetch_all(&self.pool)
        .await?;

        let mut stats = NotificationStats {
            total: 0,
            unread: 0,
            by_kind: Vec::with_capacity(rows.len()),
            by_priority: Vec::new(),
        };
        for row in &rows {
            let total: i64 = row.try_get("total")?;
            let unread: i64 = row.try_get("unread")?;
            stats.total += total;
            stats.unread += unread;
            stats.by_kind.push((decode_enum(row, "kind")?, total, unread));
        }

        let rows = visible_query(
            "SELECT priority, COUNT(*) AS total FROM notifications WHERE ".to_string(),
            viewer,
        )
        .push(" GROUP BY priority ORDER BY priority")
        .build()
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            stats
                .by_priority
                .push((decode_enum(row, "priority")?, row.try_get("total")?));
        }

        Ok(stats)
    }

    pub async fn mark_read(
        &self,
        id: i64,
        viewer: &Viewer,
        now: DateTime<Utc>,
    ) -> Result<Notification, NotificationError> {
        let row = sqlx::query(&format!(
            "UPDATE notifications SET read = 1, read_at = COALESCE(read_at, ?) \
             WHERE id = ? AND {VISIBLE} RETURNING {NOTIFICATION_COLUMNS}"
        ))
        .bind(to_rfc3339(now))
        .bind(id)
        .bind(viewer.user_id)
        .bind(&viewer.branch)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .ok_or(NotificationError::NotFound)?;
        Ok(map_notification(&row)?)
    }

    /// Marks every visible unread notification as read, returning how many changed.
    pub async fn mark_all_read(
        &self,
        viewer: &Viewer,
        now: DateTime<Utc>,
    ) -> Result<u64, NotificationError> {
        let result = sqlx::query(&format!(
            "UPDATE notifications SET read = 1, read_at = ? WHERE read = 0 AND {VISIBLE}"
        ))
        .bind(to_rfc3339(now))
        .bind(viewer.user_id)
        .bind(&viewer.branch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete(&self, id: i64, viewer: &Viewer) -> Result<(), NotificationError> {
        let result = sqlx::query(&format!("DELETE FROM notifications WHERE id = ? AND {VISIBLE}"))
            .bind(id)
            .bind(viewer.user_id)
            .bind(&viewer.branch)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(NotificationError::NotFound);
        }
        Ok(())
    }

    /// Deletes visible read notifications created before `threshold`.
    pub async fn cleanup(
        &self,
        viewer: &Viewer,
        threshold: DateTime<Utc>,
    ) -> Result<u64, NotificationError> {
        let result = sqlx::query(&format!(
            "DELETE FROM notifications WHERE read = 1 AND created_at < ? AND {VISIBLE}"
        ))
        .bind(to_rfc3339(threshold))
        .bind(viewer.user_id)
        .bind(&viewer.branch)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes up to `limit` read notifications created before `threshold`, for every reader.
    pub async fn purge_read_before(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM notifications WHERE id IN ( \
                 SELECT id FROM notifications WHERE read = 1 AND created_at < ? \
                 ORDER BY created_at LIMIT ?)",
        )
        .bind(to_rfc3339(threshold))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn visible_query(prefix: String, viewer: &Viewer) -> QueryBuilder<'static, Sqlite> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(prefix);
    builder
        .push("(recipient_user_id IS NULL OR recipient_user_id = ")
        .push_bind(viewer.user_id)
        .push(") AND (branch IS NULL OR branch = ")
        .push_bind(viewer.branch.clone())
        .push(")");
    builder
}
