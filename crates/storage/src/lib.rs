use std::{str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
    },
    Row, SqlitePool,
};
use thiserror::Error;

mod boxes;
mod campaigns;
mod deliveries;
mod incidents;
mod notifications;
mod org;
mod qr;
mod users;
mod workers;

pub use boxes::{BoxError, BoxFilter, BoxRepository, NewBox, StockSummary};
pub use campaigns::{CampaignError, CampaignRepository, CampaignState, NewCampaign};
pub use deliveries::{
    DeliveryDetail, DeliveryError, DeliveryFilter, DeliveryRepository, NewDelivery,
    RecordedDelivery,
};
pub use incidents::{
    IncidentDetail, IncidentError, IncidentFilter, IncidentRepository, IncidentStatusCounts,
    NewIncident,
};
pub use notifications::{
    NotificationError, NotificationFilter, NotificationRepository, NotificationStats,
};
pub use org::{CatalogEntry, CatalogError, CatalogRepository, CatalogSummary, NewCatalogEntry};
pub use qr::{QrDetail, QrError, QrRepository};
pub use users::{NewUser, UserError, UserRepository};
pub use workers::{NewWorker, WorkerError, WorkerFilter, WorkerOrdering, WorkerRepository};

const SQLITE_UNIQUE: &str = "2067";
const SQLITE_PRIMARY_KEY: &str = "1555";
const SQLITE_FOREIGN_KEY: &str = "787";
const SQLITE_CHECK: &str = "275";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating when missing) the SQLite database behind `database_url`.
    ///
    /// Pragmas are part of the connect options so every pooled connection gets them.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    /// Branch catalog.
    pub fn branches(&self) -> CatalogRepository {
        CatalogRepository::branches(self.pool.clone())
    }

    /// Area catalog.
    pub fn areas(&self) -> CatalogRepository {
        CatalogRepository::areas(self.pool.clone())
    }

    pub fn workers(&self) -> WorkerRepository {
        WorkerRepository::new(self.pool.clone())
    }

    pub fn boxes(&self) -> BoxRepository {
        BoxRepository::new(self.pool.clone())
    }

    pub fn deliveries(&self) -> DeliveryRepository {
        DeliveryRepository::new(self.pool.clone())
    }

    pub fn campaigns(&self) -> CampaignRepository {
        CampaignRepository::new(self.pool.clone())
    }

    pub fn incidents(&self) -> IncidentRepository {
        IncidentRepository::new(self.pool.clone())
    }

    pub fn notifications(&self) -> NotificationRepository {
        NotificationRepository::new(self.pool.clone())
    }

    pub fn qr_codes(&self) -> QrRepository {
        QrRepository::new(self.pool.clone())
    }

    /// Runs `PRAGMA wal_checkpoint(TRUNCATE)` and reports the frame counters.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, sqlx::Error> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy_frames: row.try_get(0)?,
            log_frames: row.try_get(1)?,
            checkpointed_frames: row.try_get(2)?,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Counters returned by a WAL checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    pub busy_frames: i64,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Constraint family of a failed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Violation {
    Unique,
    ForeignKey,
    Check,
}

/// Classifies a SQLite constraint failure, returning the violated constraint kind and message.
pub(crate) fn violation(err: &sqlx::Error) -> Option<(Violation, String)> {
    let sqlx::Error::Database(db_err) = err else {
        return None;
    };
    let kind = match db_err.code().as_deref() {
        Some(SQLITE_UNIQUE) | Some(SQLITE_PRIMARY_KEY) => Violation::Unique,
        Some(SQLITE_FOREIGN_KEY) => Violation::ForeignKey,
        Some(SQLITE_CHECK) => Violation::Check,
        _ => return None,
    };
    Some((kind, db_err.message().to_string()))
}

pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Decodes a TEXT column holding one of the core wire enums.
pub(crate) fn decode_enum<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|err| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(err),
        })
}

/// Decodes a TEXT column holding a JSON document.
pub(crate) fn decode_json<T>(row: &SqliteRow, column: &str) -> Result<T, sqlx::Error>
where
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).map_err(|err| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(err),
    })
}

/// Serializes a value for a JSON TEXT column.
pub(crate) fn encode_json<T>(value: &T) -> Result<String, sqlx::Error>
where
    T: serde::Serialize + ?Sized,
{
    serde_json::to_string(value).map_err(|err| sqlx::Error::Protocol(format!("JSON encode: {err}")))
}

/// Escapes `%`, `_` and `\` so user input matches literally inside `LIKE ... ESCAPE '\'`.
pub(crate) fn like_pattern(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len() + 2);
    escaped.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}
