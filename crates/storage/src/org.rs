use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use thiserror::Error;

use safebox_core::types::{Area, Branch};

use crate::{to_rfc3339, violation, Violation};

/// Which catalog table a repository handle targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Catalog {
    Branches,
    Areas,
}

impl Catalog {
    fn table(self) -> &'static str {
        match self {
            Self::Branches => "branches",
            Self::Areas => "areas",
        }
    }

    /// Free-text column: `address` for branches, `description` for areas.
    fn detail_column(self) -> &'static str {
        match self {
            Self::Branches => "address",
            Self::Areas => "description",
        }
    }

    /// Column on `workers` pointing at this catalog.
    fn worker_column(self) -> &'static str {
        match self {
            Self::Branches => "branch",
            Self::Areas => "area",
        }
    }
}

/// Row shared by the branch and area catalogs.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub detail: Option<String>,
    pub active: bool,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CatalogEntry {
    pub fn into_branch(self) -> Branch {
        Branch {
            id: self.id,
            name: self.name,
            code: self.code,
            address: self.detail,
            active: self.active,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn into_area(self) -> Area {
        Area {
            id: self.id,
            name: self.name,
            code: self.code,
            description: self.detail,
            active: self.active,
            created_by: self.created_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Catalog entry with the usage counts shown in listings.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSummary {
    pub entry: CatalogEntry,
    pub total_workers: i64,
    pub total_inactive_workers: i64,
    pub active_campaigns: i64,
}

/// Writable catalog fields.
#[derive(Debug, Clone)]
pub struct NewCatalogEntry {
    pub name: String,
    pub code: String,
    pub detail: Option<String>,
    pub active: bool,
    pub created_by: Option<i64>,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog entry not found")]
    NotFound,
    #[error("an entry with this name already exists")]
    DuplicateName,
    #[error("an entry with this code already exists")]
    DuplicateCode,
    #[error("entry is still referenced by other records")]
    InUse,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the branch and area catalogs.
#[derive(Clone)]
pub struct CatalogRepository {
    pool: SqlitePool,
    catalog: Catalog,
}

impl CatalogRepository {
    pub(crate) fn branches(pool: SqlitePool) -> Self {
        Self {
            pool,
            catalog: Catalog::Branches,
        }
    }

    pub(crate) fn areas(pool: SqlitePool) -> Self {
        Self {
            pool,
            catalog: Catalog::Areas,
        }
    }

    fn columns(&self) -> String {
        format!(
            "id, name, code, {} AS detail, active, created_by, created_at, updated_at",
            self.catalog.detail_column()
        )
    }

    fn map_write_error(&self, err: sqlx::Error) -> CatalogError {
        match violation(&err) {
            Some((Violation::Unique, message)) if message.ends_with(".name") => {
                CatalogError::DuplicateName
            }
            Some((Violation::Unique, _)) => CatalogError::DuplicateCode,
            Some((Violation::ForeignKey, _)) => CatalogError::InUse,
            _ => CatalogError::Database(err),
        }
    }

    /// Lists entries ordered by name with worker and campaign counts.
    pub async fn list(&self, active: Option<bool>) -> Result<Vec<CatalogSummary>, CatalogError> {
        let table = self.catalog.table();
        let column = self.catalog.worker_column();
        let campaigns = match self.catalog {
            Catalog::Branches => {
                "(SELECT COUNT(*) FROM campaigns c WHERE c.branch = t.code AND c.active = 1)"
            }
            Catalog::Areas => "0",
        };

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT t.id, t.name, t.code, t.{detail} AS detail, t.active, t.created_by, \
                    t.created_at, t.updated_at, \
                    (SELECT COUNT(*) FROM workers w WHERE w.{column} = t.code AND w.active = 1) AS total_workers, \
                    (SELECT COUNT(*) FROM workers w WHERE w.{column} = t.code AND w.active = 0) AS total_inactive_workers, \
                    {campaigns} AS active_campaigns \
               FROM {table} t",
            detail = self.catalog.detail_column(),
        ));
        if let Some(active) = active {
            builder.push(" WHERE t.active = ").push_bind(active);
        }
        builder.push(" ORDER BY t.name");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<CatalogSummary, sqlx::Error> {
                Ok(CatalogSummary {
                    entry: map_entry(row)?,
                    total_workers: row.try_get("total_workers")?,
                    total_inactive_workers: row.try_get("total_inactive_workers")?,
                    active_campaigns: row.try_get("active_campaigns")?,
                })
            })
            .collect::<Result<_, _>>()
            .map_err(CatalogError::from)
    }

    pub async fn find(&self, id: i64) -> Result<Option<CatalogEntry>, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE id = ?",
            self.columns(),
            self.catalog.table()
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(map_entry).transpose()?)
    }

    pub async fn find_by_code(&self, code: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE code = ?",
            self.columns(),
            self.catalog.table()
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(map_entry).transpose()?)
    }

    /// Looks up an entry by code, falling back to a case-insensitive name match.
    pub async fn resolve(&self, code_or_name: &str) -> Result<Option<CatalogEntry>, CatalogError> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM {} WHERE code = ? OR name = ? ORDER BY code = ? DESC LIMIT 1",
            self.columns(),
            self.catalog.table()
        ))
        .bind(code_or_name)
        .bind(code_or_name)
        .bind(code_or_name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(map_entry).transpose()?)
    }

    pub async fn insert(
        &self,
        entry: &NewCatalogEntry,
        now: DateTime<Utc>,
    ) -> Result<CatalogEntry, CatalogError> {
        let stamp = to_rfc3339(now);
        let row = sqlx::query(&format!(
            "INSERT INTO {} (name, code, {}, active, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING {}",
            self.catalog.table(),
            self.catalog.detail_column(),
            self.columns()
        ))
        .bind(&entry.name)
        .bind(&entry.code)
        .bind(&entry.detail)
        .bind(entry.active)
        .bind(entry.created_by)
        .bind(&stamp)
        .bind(&stamp)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| self.map_write_error(err))?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;
        Ok(map_entry(&row)?)
    }

    /// Rewrites name, code, detail and active flag. Code changes cascade to referencing rows.
    pub async fn update(
        &self,
        id: i64,
        entry: &NewCatalogEntry,
        now: DateTime<Utc>,
    ) -> Result<CatalogEntry, CatalogError> {
        let row = sqlx::query(&format!(
            "UPDATE {} SET name = ?, code = ?, {} = ?, active = ?, updated_at = ? \
             WHERE id = ? RETURNING {}",
            self.catalog.table(),
            self.catalog.detail_column(),
            self.columns()
        ))
        .bind(&entry.name)
        .bind(&entry.code)
        .bind(&entry.detail)
        .bind(entry.active)
        .bind(to_rfc3339(now))
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| self.map_write_error(err))?
        .into_iter()
        .next()
        .ok_or(CatalogError::NotFound)?;
        Ok(map_entry(&row)?)
    }

    pub async fn set_active(
        &self,
        id: i64,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<CatalogEntry, CatalogError> {
        let row = sqlx::query(&format!(
            "UPDATE {} SET active = ?, updated_at = ? WHERE id = ? RETURNING {}",
            self.catalog.table(),
            self.columns()
        ))
        .bind(active)
        .bind(to_rfc3339(now))
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .next()
        .ok_or(CatalogError::NotFound)?;
        Ok(map_entry(&row)?)
    }

    /// Deletes an entry. Rows that still reference it make this fail with [`CatalogError::InUse`].
    pub async fn delete(&self, id: i64) -> Result<(), CatalogError> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.catalog.table()))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|err| self.map_write_error(err))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::NotFound);
        }
        Ok(())
    }

    /// Active workers and (for branches) active campaigns referencing `code`.
    pub async fn usage(&self, code: &str) -> Result<(i64, i64), CatalogError> {
        let column = self.catalog.worker_column();
        let campaigns = match self.catalog {
            Catalog::Branches => "(SELECT COUNT(*) FROM campaigns WHERE branch = ?1 AND active = 1)",
            Catalog::Areas => "0",
        };
        let row = sqlx::query(&format!(
            "SELECT (SELECT COUNT(*) FROM workers WHERE {column} = ?1 AND active = 1) AS workers, \
                    {campaigns} AS campaigns"
        ))
        .bind(code)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.try_get("workers")?, row.try_get("campaigns")?))
    }
}

fn map_entry(row: &SqliteRow) -> Result<CatalogEntry, sqlx::Error> {
    Ok(CatalogEntry {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        code: row.try_get("code")?,
        detail: row.try_get("detail")?,
        active: row.try_get("active")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}
