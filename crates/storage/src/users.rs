use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use thiserror::Error;

use safebox_core::types::{Role, User};

use crate::{decode_enum, to_rfc3339, violation, Violation};

const USER_COLUMNS: &str =
    "id, username, first_name, last_name, email, phone, role, branch, active, created_at";

/// Repository for staff accounts.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

/// Fields written when creating or updating an account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
    pub role: Role,
    pub branch: String,
    pub active: bool,
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("user not found")]
    NotFound,
    #[error("username is already taken")]
    DuplicateUsername,
    #[error("branch does not exist")]
    UnknownBranch,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn map_write_error(err: sqlx::Error) -> UserError {
    match violation(&err) {
        Some((Violation::Unique, _)) => UserError::DuplicateUsername,
        Some((Violation::ForeignKey, _)) => UserError::UnknownBranch,
        _ => UserError::Database(err),
    }
}

fn map_user(row: &SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        role: decode_enum(row, "role")?,
        branch: row.try_get("branch")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

impl UserRepository {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn count(&self) -> Result<i64, UserError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    pub async fn insert(&self, user: &NewUser, now: DateTime<Utc>) -> Result<User, UserError> {
        let row = sqlx::query(&format!(
            "INSERT INTO users \
             (username, password_hash, first_name, last_name, email, phone, role, branch, active, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             RETURNING {USER_COLUMNS}"
        ))
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.role.as_str())
        .bind(&user.branch)
        .bind(user.active)
        .bind(to_rfc3339(now))
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(sqlx::Error::RowNotFound)?;

        Ok(map_user(&row)?)
    }

    /// Overwrites every writable field of the account.
    pub async fn update(&self, id: i64, user: &NewUser) -> Result<User, UserError> {
        let row = sqlx::query(&format!(
            "UPDATE users SET username = ?, password_hash = ?, first_name = ?, last_name = ?, \
             email = ?, phone = ?, role = ?, branch = ?, active = ? \
             WHERE id = ? RETURNING {USER_COLUMNS}"
        ))
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(user.role.as_str())
        .bind(&user.branch)
        .bind(user.active)
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_write_error)?
        .into_iter()
        .next()
        .ok_or(UserError::NotFound)?;

        Ok(map_user(&row)?)
    }

    pub async fn find(&self, id: i64) -> Result<Option<User>, UserError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(map_user).transpose()?)
    }

    /// Loads the account and its stored password hash for login.
    pub async fn find_credentials(
        &self,
        username: &str,
    ) -> Result<Option<(User, String)>, UserError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS}, password_hash FROM users WHERE username = ?"
        ))
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let hash: String = row.try_get("password_hash")?;
        Ok(Some((map_user(&row)?, hash)))
    }

    /// Stored password hash for an account, used when rewriting it without a password change.
    pub async fn password_hash(&self, id: i64) -> Result<String, UserError> {
        let row = sqlx::query("SELECT password_hash FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(UserError::NotFound)?;
        Ok(row.try_get("password_hash")?)
    }

    pub async fn list(&self) -> Result<Vec<User>, UserError> {
        let rows = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY username"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(map_user).collect::<Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{setup_db, ts};

    fn new_user(username: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            password_hash: "v1$1$00$00".into(),
            first_name: "Rosa".into(),
            last_name: "Díaz".into(),
            email: "rosa@example.com".into(),
            phone: String::new(),
            role: Role::Guard,
            branch: "casablanca".into(),
            active: true,
        }
    }

    #[tokio::test]
    async fn insert_and_load_credentials() {
        let (db, _dir) = setup_db().await;
        let repo = db.users();
        let now = ts("2025-06-01T10:00:00Z");

        let user = repo.insert(&new_user("rosa"), now).await.expect("insert");
        assert_eq!(user.role, Role::Guard);
        assert_eq!(user.created_at, now);
        assert_eq!(repo.count().await.expect("count"), 1);

        let (found, hash) = repo
            .find_credentials("rosa")
            .await
            .expect("query")
            .expect("user exists");
        assert_eq!(found.id, user.id);
        assert_eq!(hash, "v1$1$00$00");
        assert!(repo.find_credentials("nobody").await.expect("query").is_none());
    }

    #[tokio::test]
    async fn maps_constraint_failures() {
        let (db, _dir) = setup_db().await;
        let repo = db.users();
        let now = ts("2025-06-01T10:00:00Z");
        repo.insert(&new_user("rosa"), now).await.expect("insert");

        let err = repo.insert(&new_user("rosa"), now).await.unwrap_err();
        assert!(matches!(err, UserError::DuplicateUsername));

        let mut elsewhere = new_user("pablo");
        elsewhere.branch = "atlantis".into();
        let err = repo.insert(&elsewhere, now).await.unwrap_err();
        assert!(matches!(err, UserError::UnknownBranch));
    }

    #[tokio::test]
    async fn update_rewrites_fields() {
        let (db, _dir) = setup_db().await;
        let repo = db.users();
        let user = repo
            .insert(&new_user("rosa"), ts("2025-06-01T10:00:00Z"))
            .await
            .expect("insert");

        let mut changes = new_user("rosa");
        changes.role = Role::Supervisor;
        changes.active = false;
        let updated = repo.update(user.id, &changes).await.expect("update");
        assert_eq!(updated.role, Role::Supervisor);
        assert!(!updated.active);

        let err = repo.update(999, &changes).await.unwrap_err();
        assert!(matches!(err, UserError::NotFound));
    }
}
