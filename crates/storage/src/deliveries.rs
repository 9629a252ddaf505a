use chrono::{DateTime, Duration, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use thiserror::Error;

use safebox_core::eligibility::{check_delivery, DeliveryRejection};
use safebox_core::notification::{low_stock_alert, LOW_STOCK_COOLDOWN_DAYS};
use safebox_core::types::{BoxLot, ContractType, Delivery, DeliveryStatus, Notification};

use crate::boxes::{map_box, BOX_COLUMNS};
use crate::notifications::{insert_notification, recent_low_stock_exists};
use crate::workers::{map_worker, WORKER_COLUMNS};
use crate::{decode_enum, like_pattern, to_rfc3339};

const DELIVERY_COLUMNS: &str = "id, worker_id, box_id, guard_id, delivered_at, status, notes, \
     worker_qr_code, box_qr_code, supervisor_validated, supervisor_id, validated_at";

const DETAIL_SELECT: &str = "SELECT d.id, d.worker_id, d.box_id, d.guard_id, d.delivered_at, d.status, \
            d.notes, d.worker_qr_code, d.box_qr_code, d.supervisor_validated, d.supervisor_id, \
            d.validated_at, \
            w.rut AS worker_rut, w.first_name AS worker_first_name, \
            w.paternal_surname AS worker_paternal_surname, \
            w.maternal_surname AS worker_maternal_surname, \
            w.branch AS worker_branch, w.contract_type AS worker_contract, \
            b.code AS box_code, b.branch AS box_branch, b.contract_type AS box_contract, \
            g.username AS guard_username, g.first_name AS guard_first_name, \
            g.last_name AS guard_last_name \
       FROM deliveries d \
       JOIN workers w ON w.id = d.worker_id \
       LEFT JOIN boxes b ON b.id = d.box_id \
       LEFT JOIN users g ON g.id = d.guard_id";

/// Delivery about to be recorded by a guard.
#[derive(Debug, Clone, Default)]
pub struct NewDelivery {
    pub worker_id: i64,
    pub box_id: i64,
    pub guard_id: Option<i64>,
    pub notes: String,
    pub worker_qr_code: String,
    pub box_qr_code: String,
}

/// Outcome of a successful delivery.
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    pub delivery: Delivery,
    /// Lot after the decrement.
    pub lot: BoxLot,
    pub low_stock: Option<Notification>,
}

/// Delivery joined with the worker, lot and guard it references.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryDetail {
    pub delivery: Delivery,
    pub worker_rut: String,
    pub worker_name: String,
    pub worker_branch: String,
    pub worker_contract: ContractType,
    pub box_code: Option<String>,
    pub box_branch: Option<String>,
    pub box_contract: Option<ContractType>,
    pub guard_username: Option<String>,
    pub guard_name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryFilter {
    pub status: Option<DeliveryStatus>,
    pub guard_id: Option<i64>,
    pub worker_id: Option<i64>,
    pub supervisor_validated: Option<bool>,
    /// Branch of the delivered lot.
    pub branch: Option<String>,
    /// Inclusive lower bound on `delivered_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `delivered_at`.
    pub to: Option<DateTime<Utc>>,
    /// Matches worker rut and names.
    pub search: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery not found")]
    NotFound,
    #[error("worker not found")]
    WorkerNotFound,
    #[error("box lot not found")]
    BoxNotFound,
    #[error("{0}")]
    Rejected(#[from] DeliveryRejection),
    #[error("delivery was already validated")]
    AlreadyValidated,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_delivery(row: &SqliteRow) -> Result<Delivery, sqlx::Error> {
    Ok(Delivery {
        id: row.try_get("id")?,
        worker_id: row.try_get("worker_id")?,
        box_id: row.try_get("box_id")?,
        guard_id: row.try_get("guard_id")?,
        delivered_at: row.try_get("delivered_at")?,
        status: decode_enum(row, "status")?,
        notes: row.try_get("notes")?,
        worker_qr_code: row.try_get("worker_qr_code")?,
        box_qr_code: row.try_get("box_qr_code")?,
        supervisor_validated: row.try_get("supervisor_validated")?,
        supervisor_id: row.try_get("supervisor_id")?,
        validated_at: row.try_get("validated_at")?,
    })
}

fn join_name(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| part.trim())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

fn map_detail(row: &SqliteRow) -> Result<DeliveryDetail, sqlx::Error> {
    let first: String = row.try_get("worker_first_name")?;
    let paternal: String = row.try_get("worker_paternal_surname")?;
    let maternal: String = row.try_get("worker_maternal_surname")?;

    let guard_username: Option<String> = row.try_get("guard_username")?;
    let guard_name = match &guard_username {
        Some(username) => {
            let first: String = row.try_get("guard_first_name")?;
            let last: String = row.try_get("guard_last_name")?;
            let name = join_name(&[&first, &last]);
            Some(if name.is_empty() { username.clone() } else { name })
        }
        None => None,
    };

    let box_contract: Option<String> = row.try_get("box_contract")?;
    let box_contract = box_contract
        .map(|raw| raw.parse::<ContractType>())
        .transpose()
        .map_err(|err| sqlx::Error::ColumnDecode {
            index: "box_contract".into(),
            source: Box::new(err),
        })?;

    Ok(DeliveryDetail {
        delivery: map_delivery(row)?,
        worker_rut: row.try_get("worker_rut")?,
        worker_name: join_name(&[&first, &paternal, &maternal]),
        worker_branch: row.try_get("worker_branch")?,
        worker_contract: decode_enum(row, "worker_contract")?,
        box_code: row.try_get("box_code")?,
        box_branch: row.try_get("box_branch")?,
        box_contract,
        guard_username,
        guard_name,
    })
}

async fn has_active_delivery(
    conn: &mut SqliteConnection,
    worker_id: i64,
) -> Result<bool, sqlx::Error> {
    let row = sqlx::query(
        "SELECT EXISTS (SELECT 1 FROM deliveries WHERE worker_id = ? AND status IN (?, ?)) AS found",
    )
    .bind(worker_id)
    .bind(DeliveryStatus::ACTIVE[0].as_str())
    .bind(DeliveryStatus::ACTIVE[1].as_str())
    .fetch_one(&mut *conn)
    .await?;
    row.try_get("found")
}

/// Repository for deliveries. Writes that touch stock run in a single transaction.
#[derive(Clone)]
pub struct DeliveryRepository {
    pool: SqlitePool,
}

impl DeliveryRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a delivery, decrementing stock and raising the low-stock alert when due.
    ///
    /// The guarded stock decrement is the first statement of the transaction so the
    /// write lock is taken before anything is read. The eligibility rules then run
    /// against the lot as it was before the decrement, and any rejection rolls the
    /// unit back. A lot emptied by a concurrent delivery is reported as out of stock.
    pub async fn record(
        &self,
        delivery: &NewDelivery,
        now: DateTime<Utc>,
    ) -> Result<RecordedDelivery, DeliveryError> {
        let stamp = to_rfc3339(now);
        let mut tx = self.pool.begin().await?;

        let decremented = sqlx::query(&format!(
            "UPDATE boxes SET available_quantity = available_quantity - 1 \
             WHERE id = ? AND available_quantity > 0 AND active = 1 RETURNING {BOX_COLUMNS}"
        ))
        .bind(delivery.box_id)
        .fetch_all(&mut *tx)
        .await?
        .first()
        .map(map_box)
        .transpose()?;

        let worker_row =
            sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?"))
                .bind(delivery.worker_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(DeliveryError::WorkerNotFound)?;
        let worker = map_worker(&worker_row)?;

        let (lot, before) = match decremented {
            Some(lot) => {
                let before = BoxLot {
                    available_quantity: lot.available_quantity + 1,
                    ..lot.clone()
                };
                (Some(lot), before)
            }
            None => {
                let row = sqlx::query(&format!("SELECT {BOX_COLUMNS} FROM boxes WHERE id = ?"))
                    .bind(delivery.box_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(DeliveryError::BoxNotFound)?;
                (None, map_box(&row)?)
            }
        };

        let has_active = has_active_delivery(&mut *tx, worker.id).await?;
        check_delivery(&worker, has_active, &before)?;
        let lot = lot.ok_or(DeliveryRejection::OutOfStock)?;

        let row = sqlx::query(&format!(
            "INSERT INTO deliveries \
             (worker_id, box_id, guard_id, delivered_at, status, notes, worker_qr_code, box_qr_code) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(worker.id)
        .bind(lot.id)
        .bind(delivery.guard_id)
        .bind(&stamp)
        .bind(DeliveryStatus::Delivered.as_str())
        .bind(delivery.notes.trim())
        .bind(&delivery.worker_qr_code)
        .bind(&delivery.box_qr_code)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        let recorded = map_delivery(&row)?;

        let updated = sqlx::query(
            "UPDATE workers SET status = 'withdrawn', updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(&stamp)
        .bind(worker.id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(DeliveryRejection::AlreadyWithdrawn.into());
        }

        let low_stock = match low_stock_alert(&lot, &branch_name(&mut *tx, &lot.branch).await?) {
            Some(alert) => {
                let since = now - Duration::days(LOW_STOCK_COOLDOWN_DAYS);
                if recent_low_stock_exists(&mut *tx, lot.id, since).await? {
                    None
                } else {
                    Some(insert_notification(&mut *tx, &alert, now).await?)
                }
            }
            None => None,
        };

        tx.commit().await?;

        Ok(RecordedDelivery {
            delivery: recorded,
            lot,
            low_stock,
        })
    }

    /// Removes a delivery, returning its unit to stock and reopening the worker when
    /// no other active delivery remains.
    ///
    /// The delete is the first statement so the transaction holds the write lock before
    /// it reads anything.
    pub async fn delete(&self, id: i64, now: DateTime<Utc>) -> Result<(), DeliveryError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("DELETE FROM deliveries WHERE id = ? RETURNING worker_id, box_id")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .next()
            .ok_or(DeliveryError::NotFound)?;
        let worker_id: i64 = row.try_get("worker_id")?;
        let box_id: Option<i64> = row.try_get("box_id")?;

        if let Some(box_id) = box_id {
            sqlx::query("UPDATE boxes SET available_quantity = available_quantity + 1 WHERE id = ?")
                .bind(box_id)
                .execute(&mut *tx)
                .await?;
        }

        if !has_active_delivery(&mut *tx, worker_id).await? {
            sqlx::query("UPDATE workers SET status = 'pending', updated_at = ? WHERE id = ?")
                .bind(to_rfc3339(now))
                .bind(worker_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn find(&self, id: i64) -> Result<Option<DeliveryDetail>, DeliveryError> {
        let row = sqlx::query(&format!("{DETAIL_SELECT} WHERE d.id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_detail).transpose()?)
    }

    /// Newest first.
    pub async fn list(&self, filter: &DeliveryFilter) -> Result<Vec<DeliveryDetail>, DeliveryError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(DETAIL_SELECT);
        builder.push(" WHERE 1 = 1");
        if let Some(status) = filter.status {
            builder.push(" AND d.status = ").push_bind(status.as_str());
        }
        if let Some(guard_id) = filter.guard_id {
            builder.push(" AND d.guard_id = ").push_bind(guard_id);
        }
        if let Some(worker_id) = filter.worker_id {
            builder.push(" AND d.worker_id = ").push_bind(worker_id);
        }
        if let Some(validated) = filter.supervisor_validated {
            builder
                .push(" AND d.supervisor_validated = ")
                .push_bind(validated);
        }
        if let Some(branch) = &filter.branch {
            builder.push(" AND b.branch = ").push_bind(branch.clone());
        }
        if let Some(from) = filter.from {
            builder.push(" AND d.delivered_at >= ").push_bind(to_rfc3339(from));
        }
        if let Some(to) = filter.to {
            builder.push(" AND d.delivered_at < ").push_bind(to_rfc3339(to));
        }
        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let pattern = like_pattern(search);
            builder.push(" AND (");
            let mut separated = builder.separated(" OR ");
            for column in [
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
        builder.push(" ORDER BY d.delivered_at DESC, d.id DESC");
        if let Some(limit) = filter.limit {
            builder.push(" LIMIT ").push_bind(limit.max(0));
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(map_detail).collect::<Result<_, _>>()?)
    }

    pub async fn has_active_for_worker(&self, worker_id: i64) -> Result<bool, DeliveryError> {
        let mut conn = self.pool.acquire().await?;
        Ok(has_active_delivery(&mut conn, worker_id).await?)
    }

    pub async fn latest_for_worker(
        &self,
        worker_id: i64,
    ) -> Result<Option<DeliveryDetail>, DeliveryError> {
        let mut rows = self
            .list(&DeliveryFilter {
                worker_id: Some(worker_id),
                limit: Some(1),
                ..DeliveryFilter::default()
            })
            .await?;
        Ok(rows.pop())
    }

    /// Deliveries in `[from, to)`, optionally only those handed out by `guard_id`.
    pub async fn count_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        guard_id: Option<i64>,
    ) -> Result<i64, DeliveryError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT COUNT(*) AS total FROM deliveries WHERE delivered_at >= ",
        );
        builder
            .push_bind(to_rfc3339(from))
            .push(" AND delivered_at < ")
            .push_bind(to_rfc3339(to));
        if let Some(guard_id) = guard_id {
            builder.push(" AND guard_id = ").push_bind(guard_id);
        }
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get("total")?)
    }

    /// Marks a delivery as validated by a supervisor, appending the comment to its notes.
    pub async fn validate(
        &self,
        id: i64,
        supervisor_id: i64,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Delivery, DeliveryError> {
        let suffix = comment
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| format!("\n\nSupervisor validation: {c}"))
            .unwrap_or_default();

        let rows = sqlx::query(&format!(
            "UPDATE deliveries SET supervisor_validated = 1, supervisor_id = ?, validated_at = ?, \
             notes = notes || ? WHERE id = ? AND supervisor_validated = 0 \
             RETURNING {DELIVERY_COLUMNS}"
        ))
        .bind(supervisor_id)
        .bind(to_rfc3339(now))
        .bind(suffix)
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        if let Some(row) = rows.first() {
            return Ok(map_delivery(row)?);
        }
        match self.find(id).await? {
            Some(_) => Err(DeliveryError::AlreadyValidated),
            None => Err(DeliveryError::NotFound),
        }
    }
}

async fn branch_name(conn: &mut SqliteConnection, code: &str) -> Result<String, sqlx::Error> {
    let row = sqlx::query("SELECT name FROM branches WHERE code = ?")
        .bind(code)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => row.try_get("name"),
        None => Ok(code.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{insert_box, insert_user, insert_worker, setup_db, ts};
    use safebox_core::types::{NotificationPriority, Role, WorkerStatus};

    #[tokio::test]
    async fn record_decrements_stock_and_withdraws_worker() {
        let (db, _dir) = setup_db().await;
        let guard = insert_user(&db, "gate", Role::Guard, "casablanca").await;
        let worker = insert_worker(&db, "11111111-1", "casablanca", ContractType::Indefinite).await;
        let lot = insert_box(&db, "CAS-01", "casablanca", ContractType::Indefinite, 20).await;
        let now = ts("2025-05-02T13:00:00Z");

        let recorded = db
            .deliveries()
            .record(
                &NewDelivery {
                    worker_id: worker.id,
                    box_id: lot.id,
                    guard_id: Some(guard.id),
                    notes: "  at gate  ".into(),
                    ..NewDelivery::default()
                },
                now,
            )
            .await
            .expect("record");
        assert_eq!(recorded.delivery.status, DeliveryStatus::Delivered);
        assert_eq!(recorded.delivery.notes, "at gate");
        assert_eq!(recorded.lot.available_quantity, 19);
        assert!(recorded.low_stock.is_none());

        let worker = db.workers().get(worker.id).await.expect("worker");
        assert_eq!(worker.status, WorkerStatus::Withdrawn);

        let detail = db
            .deliveries()
            .find(recorded.delivery.id)
            .await
            .expect("find")
            .expect("exists");
        assert_eq!(detail.worker_name, "Luis Pérez Mora");
        assert_eq!(detail.box_code.as_deref(), Some("CAS-01"));
        assert_eq!(detail.guard_name.as_deref(), Some("gate Staff"));

        let err = db
            .deliveries()
            .record(
                &NewDelivery {
                    worker_id: worker.id,
                    box_id: lot.id,
                    ..NewDelivery::default()
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Rejected(DeliveryRejection::AlreadyWithdrawn)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_deliveries_for_the_last_unit_never_oversell() {
        let (db, _dir) = setup_db().await;
        let now = ts("2025-05-02T13:00:00Z");

        for round in 0..10 {
            let lot = insert_box(
                &db,
                &format!("LAST-{round}"),
                "casablanca",
                ContractType::Indefinite,
                1,
            )
            .await;
            let first = insert_worker(
                &db,
                &format!("1000{round}-1"),
                "casablanca",
                ContractType::Indefinite,
            )
            .await;
            let second = insert_worker(
                &db,
                &format!("2000{round}-2"),
                "casablanca",
                ContractType::Indefinite,
            )
            .await;

            let box_id = lot.id;
            let tasks: Vec<_> = [first.id, second.id]
                .into_iter()
                .map(|worker_id| {
                    let repo = db.deliveries();
                    tokio::spawn(async move {
                        repo.record(
                            &NewDelivery {
                                worker_id,
                                box_id,
                                ..NewDelivery::default()
                            },
                            now,
                        )
                        .await
                    })
                })
                .collect();

            let mut delivered = 0;
            let mut out_of_stock = 0;
            for task in tasks {
                match task.await.expect("join") {
                    Ok(_) => delivered += 1,
                    Err(DeliveryError::Rejected(DeliveryRejection::OutOfStock)) => out_of_stock += 1,
                    Err(other) => panic!("round {round}: unexpected error {other}"),
                }
            }
            assert_eq!((delivered, out_of_stock), (1, 1), "round {round}");

            let lot = db.boxes().find(lot.id).await.expect("find").expect("lot");
            assert_eq!(lot.available_quantity, 0, "round {round}");
            let statuses = [
                db.workers().get(first.id).await.expect("first").status,
                db.workers().get(second.id).await.expect("second").status,
            ];
            assert_eq!(
                statuses.iter().filter(|s| **s == WorkerStatus::Withdrawn).count(),
                1,
                "round {round}"
            );
        }
    }

    #[tokio::test]
    async fn rejections_leave_no_trace() {
        let (db, _dir) = setup_db().await;
        let worker = insert_worker(&db, "11111111-1", "casablanca", ContractType::Indefinite).await;
        let fixed = insert_box(&db, "CAS-FT", "casablanca", ContractType::FixedTerm, 5).await;
        let empty = insert_box(&db, "CAS-00", "casablanca", ContractType::Indefinite, 0).await;
        let now = ts("2025-05-02T13:00:00Z");

        for (box_id, code) in [(fixed.id, "contract_mismatch"), (empty.id, "out_of_stock")] {
            let err = db
                .deliveries()
                .record(
                    &NewDelivery {
                        worker_id: worker.id,
                        box_id,
                        ..NewDelivery::default()
                    },
                    now,
                )
                .await
                .unwrap_err();
            match err {
                DeliveryError::Rejected(rejection) => assert_eq!(rejection.code(), code),
                other => panic!("unexpected error: {other}"),
            }
        }

        let all = db
            .deliveries()
            .list(&DeliveryFilter::default())
            .await
            .expect("list");
        assert!(all.is_empty());
        let worker = db.workers().get(worker.id).await.expect("worker");
        assert_eq!(worker.status, WorkerStatus::Pending);
        let fixed = db.boxes().find(fixed.id).await.expect("find").expect("lot");
        assert_eq!(fixed.available_quantity, 5, "reserved unit is rolled back");
    }

    #[tokio::test]
    async fn low_stock_alert_respects_cooldown() {
        let (db, _dir) = setup_db().await;
        let lot = insert_box(&db, "BIF-01", "valparaiso_bif", ContractType::Indefinite, 4).await;
        let first = insert_worker(&db, "11111111-1", "valparaiso_bif", ContractType::Indefinite).await;
        let second = insert_worker(&db, "22222222-2", "valparaiso_bif", ContractType::Indefinite).await;
        let now = ts("2025-05-02T13:00:00Z");

        let recorded = db
            .deliveries()
            .record(
                &NewDelivery {
                    worker_id: first.id,
                    box_id: lot.id,
                    ..NewDelivery::default()
                },
                now,
            )
            .await
            .expect("record");
        let alert = recorded.low_stock.expect("alert raised");
        assert_eq!(alert.priority, NotificationPriority::High);
        assert_eq!(alert.branch.as_deref(), Some("valparaiso_bif"));
        assert_eq!(alert.title, "Low stock at Valparaíso – Planta BIF");
        assert_eq!(alert.extra["box_id"], lot.id);

        let recorded = db
            .deliveries()
            .record(
                &NewDelivery {
                    worker_id: second.id,
                    box_id: lot.id,
                    ..NewDelivery::default()
                },
                now + Duration::hours(1),
            )
            .await
            .expect("record");
        assert_eq!(recorded.lot.available_quantity, 2);
        assert!(recorded.low_stock.is_none());
    }

    #[tokio::test]
    async fn delete_restores_stock_and_status() {
        let (db, _dir) = setup_db().await;
        let worker = insert_worker(&db, "11111111-1", "casablanca", ContractType::Indefinite).await;
        let lot = insert_box(&db, "CAS-01", "casablanca", ContractType::Indefinite, 20).await;
        let now = ts("2025-05-02T13:00:00Z");
        let recorded = db
            .deliveries()
            .record(
                &NewDelivery {
                    worker_id: worker.id,
                    box_id: lot.id,
                    ..NewDelivery::default()
                },
                now,
            )
            .await
            .expect("record");

        db.deliveries()
            .delete(recorded.delivery.id, now)
            .await
            .expect("delete");
        let lot = db.boxes().find(lot.id).await.expect("find").expect("exists");
        assert_eq!(lot.available_quantity, 20);
        let worker = db.workers().get(worker.id).await.expect("worker");
        assert_eq!(worker.status, WorkerStatus::Pending);

        assert!(matches!(
            db.deliveries().delete(recorded.delivery.id, now).await,
            Err(DeliveryError::NotFound)
        ));
    }

    #[tokio::test]
    async fn validation_appends_comment_once() {
        let (db, _dir) = setup_db().await;
        let supervisor = insert_user(&db, "boss", Role::Supervisor, "casablanca").await;
        let worker = insert_worker(&db, "11111111-1", "casablanca", ContractType::Indefinite).await;
        let lot = insert_box(&db, "CAS-01", "casablanca", ContractType::Indefinite, 20).await;
        let now = ts("2025-05-02T13:00:00Z");
        let recorded = db
            .deliveries()
            .record(
                &NewDelivery {
                    worker_id: worker.id,
                    box_id: lot.id,
                    notes: "ok".into(),
                    ..NewDelivery::default()
                },
                now,
            )
            .await
            .expect("record");

        let pending = db
            .deliveries()
            .list(&DeliveryFilter {
                status: Some(DeliveryStatus::Delivered),
                supervisor_validated: Some(false),
                ..DeliveryFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(pending.len(), 1);

        let validated = db
            .deliveries()
            .validate(recorded.delivery.id, supervisor.id, Some("checked"), now)
            .await
            .expect("validate");
        assert!(validated.supervisor_validated);
        assert_eq!(validated.notes, "ok\n\nSupervisor validation: checked");
        assert_eq!(validated.validated_at, Some(now));

        assert!(matches!(
            db.deliveries()
                .validate(recorded.delivery.id, supervisor.id, None, now)
                .await,
            Err(DeliveryError::AlreadyValidated)
        ));
        assert!(matches!(
            db.deliveries().validate(999, supervisor.id, None, now).await,
            Err(DeliveryError::NotFound)
        ));

        let today = db
            .deliveries()
            .count_between(now - Duration::hours(1), now + Duration::hours(1), None)
            .await
            .expect("count");
        assert_eq!(today, 1);
        let searched = db
            .deliveries()
            .list(&DeliveryFilter {
                search: Some("pérez".into()),
                ..DeliveryFilter::default()
            })
            .await
            .expect("search");
        assert_eq!(searched.len(), 1);
    }
}
