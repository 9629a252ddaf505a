use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::{counter, histogram};
use sqlx::Error as SqlxError;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use safebox_core::notification::READ_RETENTION_DAYS;
use safebox_storage::Database;

const BATCH_LIMIT: i64 = 1000;

/// Background worker that purges old read notifications and checkpoints the WAL.
#[derive(Clone)]
pub struct MaintenanceWorker {
    database: Database,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    interval: Duration,
}

impl MaintenanceWorker {
    pub fn new(database: Database, interval: Duration) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
            interval,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs the worker loop in the background.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = self.run_once().await {
                error!(stage = "storage", error = %err, "maintenance run failed");
            }
        }
    }

    /// One maintenance cycle: notification purge followed by a checkpoint.
    pub async fn run_once(&self) -> Result<MaintenanceReport, MaintenanceError> {
        let threshold = (self.clock)() - ChronoDuration::days(READ_RETENTION_DAYS);
        let (deleted, busy) = self.purge_notifications(threshold).await?;
        info!(
            stage = "storage",
            table = "notifications",
            deleted,
            busy,
            threshold = %threshold.to_rfc3339(),
            "read notification purge completed"
        );

        self.run_checkpoint().await?;
        Ok(MaintenanceReport { deleted, busy })
    }

    async fn purge_notifications(
        &self,
        threshold: DateTime<Utc>,
    ) -> Result<(u64, bool), MaintenanceError> {
        let repo = self.database.notifications();
        let mut total = 0u64;
        loop {
            match repo.purge_read_before(threshold, BATCH_LIMIT).await {
                Ok(0) => return Ok((total, false)),
                Ok(batch) => {
                    total += batch;
                    counter!("maintenance_deleted_total", "table" => "notifications")
                        .increment(batch);
                }
                Err(err) if is_sqlite_busy(&err) => {
                    counter!("db_busy_total", "op" => "purge").increment(1);
                    warn!(stage = "storage", error = %err, "notification purge hit busy timeout");
                    return Ok((total, true));
                }
                Err(err) => {
                    return Err(MaintenanceError::Purge {
                        table: "notifications",
                        source: err,
                    })
                }
            }
        }
    }

    async fn run_checkpoint(&self) -> Result<(), MaintenanceError> {
        let start = std::time::Instant::now();
        match self.database.wal_checkpoint_truncate().await {
            Ok(stats) => {
                let duration = start.elapsed().as_secs_f64();
                histogram!("db_checkpoint_seconds").record(duration);
                if stats.busy_frames > 0 {
                    counter!("db_busy_total", "op" => "checkpoint").increment(1);
                    warn!(
                        stage = "storage",
                        busy_frames = stats.busy_frames,
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed with busy frames"
                    );
                } else {
                    info!(
                        stage = "storage",
                        log_frames = stats.log_frames,
                        checkpointed_frames = stats.checkpointed_frames,
                        duration_secs = duration,
                        "WAL checkpoint completed"
                    );
                }
                Ok(())
            }
            Err(err) if is_sqlite_busy(&err) => {
                counter!("db_busy_total", "op" => "checkpoint").increment(1);
                warn!(stage = "storage", error = %err, "WAL checkpoint hit busy timeout");
                Ok(())
            }
            Err(err) => Err(MaintenanceError::Checkpoint { source: err }),
        }
    }
}

/// Outcome of one maintenance cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub deleted: u64,
    pub busy: bool,
}

#[derive(Debug, Error)]
pub enum MaintenanceError {
    #[error("failed to purge expired rows from {table}")]
    Purge {
        table: &'static str,
        #[source]
        source: SqlxError,
    },
    #[error("failed to run WAL checkpoint")]
    Checkpoint {
        #[source]
        source: SqlxError,
    },
}

fn is_sqlite_busy(err: &SqlxError) -> bool {
    match err {
        SqlxError::Database(db_err) => matches!(db_err.code().as_deref(), Some("5") | Some("6")),
        _ => false,
    }
}
