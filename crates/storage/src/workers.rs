use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;

use safebox_core::types::{ContractType, Worker, WorkerStatus};

use crate::{decode_enum, like_pattern, to_rfc3339, violation, Violation};

pub(crate) const WORKER_COLUMNS: &str = "id, rut, first_name, paternal_surname, maternal_surname, position, \
     contract_type, period, branch, area, email, phone, status, active, created_at, updated_at";

/// Writable worker fields, used for inserts, updates and imports.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorker {
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
}

impl From<&Worker> for NewWorker {
    fn from(worker: &Worker) -> Self {
        Self {
            rut: worker.rut.clone(),
            first_name: worker.first_name.clone(),
            paternal_surname: worker.paternal_surname.clone(),
            maternal_surname: worker.maternal_surname.clone(),
            position: worker.position.clone(),
            contract_type: worker.contract_type,
            period: worker.period.clone(),
            branch: worker.branch.clone(),
            area: worker.area.clone(),
            email: worker.email.clone(),
            phone: worker.phone.clone(),
            status: worker.status,
            active: worker.active,
        }
    }
}

/// Sort orders accepted by the worker listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerOrdering {
    #[default]
    Surnames,
    PaternalSurname,
    PaternalSurnameDesc,
    FirstName,
    FirstNameDesc,
}

impl WorkerOrdering {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "paternal_surname" => Some(Self::PaternalSurname),
            "-paternal_surname" => Some(Self::PaternalSurnameDesc),
            "first_name" => Some(Self::FirstName),
            "-first_name" => Some(Self::FirstNameDesc),
            _ => None,
        }
    }

    fn sql(self) -> &'static str {
        match self {
            Self::Surnames => "paternal_surname, maternal_surname, first_name",
            Self::PaternalSurname => "paternal_surname, id",
            Self::PaternalSurnameDesc => "paternal_surname DESC, id",
            Self::FirstName => "first_name, id",
            Self::FirstNameDesc => "first_name DESC, id",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub branch: Option<String>,
    pub contract_type: Option<ContractType>,
    pub active: Option<bool>,
    pub status: Option<WorkerStatus>,
    pub area: Option<String>,
    pub search: Option<String>,
    pub ordering: WorkerOrdering,
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker not found")]
    NotFound,
    #[error("a worker with this RUT already exists")]
    DuplicateRut,
    #[error("branch or area does not exist")]
    MissingReference,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_write_error(err: sqlx::Error) -> WorkerError {
    match violation(&err) {
        Some((Violation::Unique, _)) => WorkerError::DuplicateRut,
        Some((Violation::ForeignKey, _)) => WorkerError::MissingReference,
        _ => WorkerError::Database(err),
    }
}

pub(crate) fn map_worker(row: &SqliteRow) -> Result<Worker, sqlx::Error> {
    Ok(Worker {
        id: row.try_get("id")?,
        rut: row.try_get("rut")?,
        first_name: row.try_get("first_name")?,
        paternal_surname: row.try_get("paternal_surname")?,
        maternal_surname: row.try_get("maternal_surname")?,
        position: row.try_get("position")?,
        contract_type: decode_enum(row, "contract_type")?,
        period: row.try_get("period")?,
        branch: row.try_get("branch")?,
        area: row.try_get("area")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        status: decode_enum(row, "status")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Repository for the worker registry.
#[derive(Clone)]
pub struct WorkerRepository {
    pool: SqlitePool,
}

impl WorkerRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, filter: &WorkerFilter) -> Result<Vec<Worker>, WorkerError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {WORKER_COLUMNS} FROM workers WHERE 1 = 1"));

        if let Some(branch) = &filter.branch {
            builder.push(" AND branch = ").push_bind(branch.clone());
        }
        if let Some(contract) = filter.contract_type {
            builder.push(" AND contract_type = ").push_bind(contract.as_str());
        }
        if let Some(active) = filter.active {
            builder.push(" AND active = ").push_bind(active);
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(area) = &filter.area {
            builder.push(" AND area = ").push_bind(area.clone());
        }
        if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            let pattern = like_pattern(term);
            builder.push(" AND (");
            let mut separated = builder.separated(" OR ");
            for column in ["rut", "first_name", "paternal_surname", "maternal_surname"] {
                separated
                    .push(format!("{column} LIKE "))
                    .push_bind_unseparated(pattern.clone())
                    .push_unseparated(" ESCAPE '\\'");
            }
            builder.push(")");
        }
        builder.push(" ORDER BY ").push(filter.ordering.sql());

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(map_worker).collect::<Result<_, _>>()?)
    }

    pub async fn find(&self, id: i64) -> Result<Option<Worker>, WorkerError> {
        let row = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_worker).transpose()?)
    }

    pub async fn get(&self, id: i64) -> Result<Worker, WorkerError> {
        self.find(id).await?.ok_or(WorkerError::NotFound)
    }

    /// Looks a worker up by an already normalized RUT.
    pub async fn find_by_rut(&self, rut: &str) -> Result<Option<Worker>, WorkerError> {
        let row = sqlx::query(&format!("SELECT {WORKER_COLUMNS} FROM workers WHERE rut = ?"))
            .bind(rut)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_worker).transpose()?)
    }

    pub async fn insert(
        &self,
        worker: &NewWorker,
        now: DateTime<Utc>,
    ) -> Result<Worker, WorkerError> {
        let stamp = to_rfc3339(now);
        let row = sqlx::query(&format!(
            "INSERT INTO workers \
             (rut, first_name, paternal_surname, maternal_surname, position, contract_type, period, \
              branch, area, email, phone, status, active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {WORKER_COLUMNS}"
        ))
        .bind(&worker.rut)
        .bind(&worker.first_name)
        .bind(&worker.paternal_surname)
        .bind(&worker.maternal_surname)
        .bind(&worker.position)
        .bind(worker.contract_type.as_str())
        .bind(&worker.period)
        .bind(&worker.branch)
        .bind(&worker.area)
        .bind(&worker.email)
        .bind(&worker.phone)
        .bind(worker.status.as_str())
        .bind(worker.active)
        .bind(&stamp)
        .bind(&stamp)
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;

        Ok(map_worker(&row)?)
    }

    pub async fn update(
        &self,
        id: i64,
        worker: &NewWorker,
        now: DateTime<Utc>,
    ) -> Result<Worker, WorkerError> {
        let row = sqlx::query(&format!(
            "UPDATE workers SET rut = ?, first_name = ?, paternal_surname = ?, maternal_surname = ?, \
             position = ?, contract_type = ?, period = ?, branch = ?, area = ?, email = ?, phone = ?, \
             status = ?, active = ?, updated_at = ? \
             WHERE id = ? RETURNING {WORKER_COLUMNS}"
        ))
        .bind(&worker.rut)
        .bind(&worker.first_name)
        .bind(&worker.paternal_surname)
        .bind(&worker.maternal_surname)
        .bind(&worker.position)
        .bind(worker.contract_type.as_str())
        .bind(&worker.period)
        .bind(&worker.branch)
        .bind(&worker.area)
        .bind(&worker.email)
        .bind(&worker.phone)
        .bind(worker.status.as_str())
        .bind(worker.active)
        .bind(to_rfc3339(now))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(WorkerError::NotFound)?;

        Ok(map_worker(&row)?)
    }

    /// Inserts or updates by RUT, returning the row and whether it was created.
    ///
    /// Delivery status is preserved for existing workers.
    pub async fn upsert_by_rut(
        &self,
        worker: &NewWorker,
        now: DateTime<Utc>,
    ) -> Result<(Worker, bool), WorkerError> {
        match self.find_by_rut(&worker.rut).await? {
            Some(existing) => {
                let merged = NewWorker {
                    status: existing.status,
                    ..worker.clone()
                };
                let updated = self.update(existing.id, &merged, now).await?;
                Ok((updated, false))
            }
            None => Ok((self.insert(worker, now).await?, true)),
        }
    }

    /// Deletes a worker together with its deliveries, incidents and QR record.
    pub async fn delete(&self, id: i64) -> Result<(), WorkerError> {
        let result = sqlx::query("DELETE FROM workers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(WorkerError::NotFound);
        }
        Ok(())
    }
}

/// Appends ` AND <column> IN (?, ...)` to a builder.
pub(crate) fn push_in(
    builder: &mut QueryBuilder<'_, Sqlite>,
    column: &str,
    values: impl Iterator<Item = String>,
) {
    builder.push(format!(" AND {column} IN ("));
    let mut separated = builder.separated(", ");
    for value in values {
        separated.push_bind(value);
    }
    separated.push_unseparated(")");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{setup_db, ts};

    fn new_worker(rut: &str, first: &str, paternal: &str) -> NewWorker {
        NewWorker {
            rut: rut.to_string(),
            first_name: first.to_string(),
            paternal_surname: paternal.to_string(),
            maternal_surname: "Soto".into(),
            position: "Operator".into(),
            contract_type: ContractType::Indefinite,
            period: "2025".into(),
            branch: "casablanca".into(),
            area: Some("administracion".into()),
            email: None,
            phone: None,
            status: WorkerStatus::Pending,
            active: true,
        }
    }

    #[tokio::test]
    async fn list_filters_searches_and_orders() {
        let (db, _dir) = setup_db().await;
        let repo = db.workers();
        let now = ts("2025-04-01T08:00:00Z");
        repo.insert(&new_worker("11111111-1", "Ana", "Zúñiga"), now)
            .await
            .expect("insert");
        repo.insert(&new_worker("22222222-2", "Bruno", "Araya"), now)
            .await
            .expect("insert");
        let mut fixed = new_worker("33333333-3", "Carla", "Muñoz");
        fixed.contract_type = ContractType::FixedTerm;
        fixed.branch = "valparaiso_bif".into();
        repo.insert(&fixed, now).await.expect("insert");

        let all = repo.list(&WorkerFilter::default()).await.expect("list");
        let names: Vec<_> = all.iter().map(|w| w.first_name.as_str()).collect();
        assert_eq!(names, vec!["Bruno", "Carla", "Ana"]);

        let filtered = repo
            .list(&WorkerFilter {
                branch: Some("casablanca".into()),
                ordering: WorkerOrdering::FirstNameDesc,
                ..WorkerFilter::default()
            })
            .await
            .expect("list");
        let names: Vec<_> = filtered.iter().map(|w| w.first_name.as_str()).collect();
        assert_eq!(names, vec!["Bruno", "Ana"]);

        let fixed_only = repo
            .list(&WorkerFilter {
                contract_type: Some(ContractType::FixedTerm),
                ..WorkerFilter::default()
            })
            .await
            .expect("list");
        assert_eq!(fixed_only.len(), 1);

        let searched = repo
            .list(&WorkerFilter {
                search: Some("bru".into()),
                ..WorkerFilter::default()
            })
            .await
            .expect("search");
        assert_eq!(searched.len(), 1);
        assert_eq!(searched[0].rut, "22222222-2");

        let by_rut = repo
            .list(&WorkerFilter {
                search: Some("3333".into()),
                ..WorkerFilter::default()
            })
            .await
            .expect("search");
        assert_eq!(by_rut[0].first_name, "Carla");
    }

    #[tokio::test]
    async fn duplicate_rut_and_unknown_area_are_mapped() {
        let (db, _dir) = setup_db().await;
        let repo = db.workers();
        let now = ts("2025-04-01T08:00:00Z");
        repo.insert(&new_worker("11111111-1", "Ana", "Rojas"), now)
            .await
            .expect("insert");

        let err = repo
            .insert(&new_worker("11111111-1", "Otra", "Persona"), now)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::DuplicateRut));

        let mut orphan = new_worker("44444444-4", "Dan", "Paz");
        orphan.area = Some("marketing".into());
        let err = repo.insert(&orphan, now).await.unwrap_err();
        assert!(matches!(err, WorkerError::MissingReference));
    }

    #[tokio::test]
    async fn upsert_keeps_delivery_status() {
        let (db, _dir) = setup_db().await;
        let repo = db.workers();
        let now = ts("2025-04-01T08:00:00Z");
        let mut withdrawn = new_worker("11111111-1", "Ana", "Rojas");
        withdrawn.status = WorkerStatus::Withdrawn;
        repo.insert(&withdrawn, now).await.expect("insert");

        let (updated, created) = repo
            .upsert_by_rut(&new_worker("11111111-1", "Ana María", "Rojas"), now)
            .await
            .expect("upsert");
        assert!(!created);
        assert_eq!(updated.first_name, "Ana María");
        assert_eq!(updated.status, WorkerStatus::Withdrawn);

        let (_, created) = repo
            .upsert_by_rut(&new_worker("55555555-5", "Eva", "Luna"), now)
            .await
            .expect("upsert");
        assert!(created);
    }
}
