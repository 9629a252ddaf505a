use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;

use safebox_core::types::{BoxLot, ContractType};

use crate::{decode_enum, to_rfc3339, violation, Violation};

pub(crate) const BOX_COLUMNS: &str =
    "id, code, contract_type, branch, available_quantity, active, created_at";

/// Writable lot fields.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBox {
    pub code: String,
    pub contract_type: ContractType,
    pub branch: String,
    pub available_quantity: i64,
    pub active: bool,
}

impl From<&BoxLot> for NewBox {
    fn from(lot: &BoxLot) -> Self {
        Self {
            code: lot.code.clone(),
            contract_type: lot.contract_type,
            branch: lot.branch.clone(),
            available_quantity: lot.available_quantity,
            active: lot.active,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BoxFilter {
    pub branch: Option<String>,
    pub contract_type: Option<ContractType>,
    pub active: Option<bool>,
}

/// Active stock overall and per catalog branch.
#[derive(Debug, Clone, PartialEq)]
pub struct StockSummary {
    pub total: i64,
    /// `(branch code, branch name, stock)` for every branch, including empty ones.
    pub by_branch: Vec<(String, String, i64)>,
}

#[derive(Debug, Error)]
pub enum BoxError {
    #[error("box lot not found")]
    NotFound,
    #[error("a box lot with this code already exists")]
    DuplicateCode,
    #[error("branch does not exist")]
    UnknownBranch,
    #[error("available quantity cannot be negative")]
    NegativeStock,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_write_error(err: sqlx::Error) -> BoxError {
    match violation(&err) {
        Some((Violation::Unique, _)) => BoxError::DuplicateCode,
        Some((Violation::ForeignKey, _)) => BoxError::UnknownBranch,
        Some((Violation::Check, _)) => BoxError::NegativeStock,
        _ => BoxError::Database(err),
    }
}

pub(crate) fn map_box(row: &SqliteRow) -> Result<BoxLot, sqlx::Error> {
    Ok(BoxLot {
        id: row.try_get("id")?,
        code: row.try_get("code")?,
        contract_type: decode_enum(row, "contract_type")?,
        branch: row.try_get("branch")?,
        available_quantity: row.try_get("available_quantity")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Repository for inventory lots.
#[derive(Clone)]
pub struct BoxRepository {
    pool: SqlitePool,
}

impl BoxRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn list(&self, filter: &BoxFilter) -> Result<Vec<BoxLot>, BoxError> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {BOX_COLUMNS} FROM boxes WHERE 1 = 1"));
        if let Some(branch) = &filter.branch {
            builder.push(" AND branch = ").push_bind(branch.clone());
        }
        if let Some(contract) = filter.contract_type {
            builder.push(" AND contract_type = ").push_bind(contract.as_str());
        }
        if let Some(active) = filter.active {
            builder.push(" AND active = ").push_bind(active);
        }
        builder.push(" ORDER BY branch, code");

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(map_box).collect::<Result<_, _>>()?)
    }

    pub async fn find(&self, id: i64) -> Result<Option<BoxLot>, BoxError> {
        let row = sqlx::query(&format!("SELECT {BOX_COLUMNS} FROM boxes WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_box).transpose()?)
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<BoxLot>, BoxError> {
        let row = sqlx::query(&format!("SELECT {BOX_COLUMNS} FROM boxes WHERE code = ?"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_box).transpose()?)
    }

    pub async fn insert(&self, lot: &NewBox, now: DateTime<Utc>) -> Result<BoxLot, BoxError> {
        if lot.available_quantity < 0 {
            return Err(BoxError::NegativeStock);
        }
        let row = sqlx::query(&format!(
            "INSERT INTO boxes (code, contract_type, branch, available_quantity, active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING {BOX_COLUMNS}"
        ))
        .bind(&lot.code)
        .bind(lot.contract_type.as_str())
        .bind(&lot.branch)
        .bind(lot.available_quantity)
        .bind(lot.active)
        .bind(to_rfc3339(now))
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        Ok(map_box(&row)?)
    }

    pub async fn update(&self, id: i64, lot: &NewBox) -> Result<BoxLot, BoxError> {
        if lot.available_quantity < 0 {
            return Err(BoxError::NegativeStock);
        }
        let row = sqlx::query(&format!(
            "UPDATE boxes SET code = ?, contract_type = ?, branch = ?, available_quantity = ?, active = ? \
             WHERE id = ? RETURNING {BOX_COLUMNS}"
        ))
        .bind(&lot.code)
        .bind(lot.contract_type.as_str())
        .bind(&lot.branch)
        .bind(lot.available_quantity)
        .bind(lot.active)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(BoxError::NotFound)?;
        Ok(map_box(&row)?)
    }

    /// Deletes a lot. Deliveries keep their history with the box reference cleared.
    pub async fn delete(&self, id: i64) -> Result<(), BoxError> {
        let result = sqlx::query("DELETE FROM boxes WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(BoxError::NotFound);
        }
        Ok(())
    }

    /// Adds `quantity` units to a lot.
    pub async fn restock(&self, id: i64, quantity: i64) -> Result<BoxLot, BoxError> {
        let row = sqlx::query(&format!(
            "UPDATE boxes SET available_quantity = available_quantity + ? \
             WHERE id = ? RETURNING {BOX_COLUMNS}"
        ))
        .bind(quantity)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(BoxError::NotFound)?;
        Ok(map_box(&row)?)
    }

    pub async fn stock_summary(&self) -> Result<StockSummary, BoxError> {
        let rows = sqlx::query(
            "SELECT b.code, b.name, \
                    COALESCE((SELECT SUM(available_quantity) FROM boxes x \
                               WHERE x.branch = b.code AND x.active = 1), 0) AS stock \
               FROM branches b ORDER BY b.name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut by_branch = Vec::with_capacity(rows.len());
        for row in &rows {
            by_branch.push((
                row.try_get::<String, _>("code")?,
                row.try_get::<String, _>("name")?,
                row.try_get::<i64, _>("stock")?,
            ));
        }

        let total_row = sqlx::query(
            "SELECT COALESCE(SUM(available_quantity), 0) AS total FROM boxes WHERE active = 1",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StockSummary {
            total: total_row.try_get("total")?,
            by_branch,
        })
    }

    /// Active stock for one branch and contract type.
    pub async fn available_for(
        &self,
        branch: &str,
        contract_type: ContractType,
    ) -> Result<i64, BoxError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(available_quantity), 0) AS total FROM boxes \
             WHERE active = 1 AND branch = ? AND contract_type = ?",
        )
        .bind(branch)
        .bind(contract_type.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("total")?)
    }
}
