use std::time::Duration;

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{header, request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use metrics::counter;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{info, warn};

use safebox_core::notification::Viewer;
use safebox_core::types::{Role, User};
use safebox_storage::{Database, NewUser, UserError};
use safebox_util::BootstrapUser;

use crate::problem::{bad_request, ProblemResponse};
use crate::router::AppState;

type HmacSha256 = Hmac<Sha256>;

const HASH_SCHEME: &str = "v1";
const HASH_ITERATIONS: u32 = 20_000;
const SALT_LEN: usize = 16;
const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("stored password hash is malformed")]
    Malformed,
    #[error("invalid HMAC key length")]
    Key(#[from] hmac::digest::InvalidLength),
}

/// Hashes a password as `v1$<iterations>$<salt hex>$<digest hex>`.
pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = derive(password.as_bytes(), &salt, HASH_ITERATIONS)?;
    Ok(format!(
        "{HASH_SCHEME}${HASH_ITERATIONS}${}${}",
        hex::encode(salt),
        hex::encode(digest)
    ))
}

pub fn verify_password(password: &str, stored: &str) -> Result<bool, PasswordError> {
    let mut parts = stored.split('$');
    let (Some(HASH_SCHEME), Some(iterations), Some(salt), Some(expected), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(PasswordError::Malformed);
    };
    let iterations: u32 = iterations.parse().map_err(|_| PasswordError::Malformed)?;
    if iterations == 0 {
        return Err(PasswordError::Malformed);
    }
    let salt = hex::decode(salt).map_err(|_| PasswordError::Malformed)?;
    let expected = hex::decode(expected).map_err(|_| PasswordError::Malformed)?;

    let actual = derive(password.as_bytes(), &salt, iterations)?;
    Ok(actual.as_slice().ct_eq(expected.as_slice()).into())
}

/// Single-block PBKDF2 over HMAC-SHA256.
fn derive(password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32], PasswordError> {
    let mut mac = HmacSha256::new_from_slice(password)?;
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut block = [0u8; 32];
    block.copy_from_slice(&mac.finalize().into_bytes());
    let mut output = block;

    for _ in 1..iterations {
        let mut mac = HmacSha256::new_from_slice(password)?;
        mac.update(&block);
        block.copy_from_slice(&mac.finalize().into_bytes());
        for (out, byte) in output.iter_mut().zip(block.iter()) {
            *out ^= byte;
        }
    }
    Ok(output)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub branch: String,
    pub exp: usize,
    pub iat: usize,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("token expired")]
    Expired,
    #[error("failed to sign token: {0}")]
    Sign(jsonwebtoken::errors::Error),
}

/// HS256 signing and validation of access tokens.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl: Duration,
}

impl TokenKeys {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the application clock instead.
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            ttl,
        }
    }

    pub fn issue(&self, user: &User, now: DateTime<Utc>) -> Result<(String, DateTime<Utc>), TokenError> {
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|err| TokenError::Invalid(err.to_string()))?;
        let expires_at = now + ttl;
        let claims = Claims {
            sub: user.id.to_string(),
            role: user.role,
            branch: user.branch.clone(),
            exp: expires_at.timestamp().max(0) as usize,
            iat: now.timestamp().max(0) as usize,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Sign)?;
        Ok((token, expires_at))
    }

    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|err| TokenError::Invalid(err.to_string()))?
            .claims;
        if now.timestamp() >= claims.exp as i64 {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

fn unauthorized(detail: &str) -> ProblemResponse {
    ProblemResponse::new(StatusCode::UNAUTHORIZED, "unauthorized", detail)
}

/// The authenticated staff member behind a request.
#[derive(Debug, Clone)]
pub struct AuthUser(pub User);

impl AuthUser {
    pub fn id(&self) -> i64 {
        self.0.id
    }

    pub fn role(&self) -> Role {
        self.0.role
    }

    pub fn user(&self) -> &User {
        &self.0
    }

    pub fn viewer(&self) -> Viewer {
        Viewer {
            user_id: self.0.id,
            branch: self.0.branch.clone(),
        }
    }

    /// Fails with 403 unless the caller holds one of `roles`.
    pub fn require(&self, roles: &[Role]) -> Result<(), ProblemResponse> {
        if roles.contains(&self.0.role) {
            Ok(())
        } else {
            Err(ProblemResponse::new(
                StatusCode::FORBIDDEN,
                "forbidden",
                format!("role '{}' may not perform this action", self.0.role),
            ))
        }
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ProblemResponse;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| unauthorized("missing bearer token"))?;

        let claims = state.tokens().validate(token, state.now()).map_err(|err| {
            warn!(stage = "auth", error = %err, "rejected access token");
            unauthorized("invalid or expired token")
        })?;
        let user_id: i64 = claims
            .sub
            .parse()
            .map_err(|_| unauthorized("invalid or expired token"))?;

        let user = state
            .storage()
            .users()
            .find(user_id)
            .await?
            .filter(|user| user.active)
            .ok_or_else(|| unauthorized("account is unknown or inactive"))?;

        Ok(AuthUser(user))
    }
}

/// User as returned by the API, with the composed display name.
#[derive(Debug, Serialize)]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    pub full_name: String,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        let full_name = user.full_name();
        Self { user, full_name }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/me", get(me))
        .route("/users", get(list_users).post(create_user))
        .route("/users/:id", get(get_user).patch(update_user))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    access_token: String,
    token_type: &'static str,
    expires_at: DateTime<Utc>,
    user: UserView,
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ProblemResponse> {
    let username = request.username.trim();
    let credentials = state.storage().users().find_credentials(username).await?;

    let user = match credentials {
        Some((user, hash)) if user.active => {
            let valid = verify_password(&request.password, &hash).unwrap_or_else(|err| {
                warn!(stage = "auth", user_id = user.id, error = %err, "unreadable password hash");
                false
            });
            valid.then_some(user)
        }
        _ => None,
    };
    let Some(user) = user else {
        counter!("auth_login_total", "result" => "failure").increment(1);
        warn!(stage = "auth", %username, "login failed");
        return Err(unauthorized("invalid credentials"));
    };

    let (access_token, expires_at) = state.tokens().issue(&user, state.now()).map_err(|err| {
        tracing::error!(stage = "auth", error = %err, "failed to issue token");
        crate::problem::internal_error("failed to issue token")
    })?;
    counter!("auth_login_total", "result" => "success").increment(1);
    info!(stage = "auth", user_id = user.id, role = %user.role, "login succeeded");

    Ok(Json(LoginResponse {
        access_token,
        token_type: "Bearer",
        expires_at,
        user: user.into(),
    }))
}

async fn me(auth: AuthUser) -> Json<UserView> {
    Json(auth.0.into())
}

async fn list_users(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<UserView>>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let users = state.storage().users().list().await?;
    Ok(Json(users.into_iter().map(UserView::from).collect()))
}

async fn get_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
) -> Result<Json<UserView>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let user = state
        .storage()
        .users()
        .find(id)
        .await?
        .ok_or(UserError::NotFound)?;
    Ok(Json(user.into()))
}

#[derive(Debug, Deserialize)]
struct CreateUserRequest {
    username: String,
    password: String,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    phone: String,
    role: Role,
    branch: String,
    active: Option<bool>,
}

fn checked_password(password: &str) -> Result<String, ProblemResponse> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(bad_request(
            "weak_password",
            format!("password must have at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    hash_password(password).map_err(|err| {
        tracing::error!(stage = "auth", error = %err, "failed to hash password");
        crate::problem::internal_error("failed to hash password")
    })
}

async fn create_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(request): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<UserView>), ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let username = request.username.trim().to_string();
    if username.is_empty() {
        return Err(bad_request("invalid_username", "username is required"));
    }
    let password_hash = checked_password(&request.password)?;

    let user = state
        .storage()
        .users()
        .insert(
            &NewUser {
                username,
                password_hash,
                first_name: request.first_name.trim().to_string(),
                last_name: request.last_name.trim().to_string(),
                email: request.email.trim().to_string(),
                phone: request.phone.trim().to_string(),
                role: request.role,
                branch: request.branch.trim().to_string(),
                active: request.active.unwrap_or(true),
            },
            state.now(),
        )
        .await?;
    info!(stage = "auth", user_id = user.id, role = %user.role, created_by = auth.id(), "user created");
    Ok((StatusCode::CREATED, Json(user.into())))
}

#[derive(Debug, Default, Deserialize)]
struct UpdateUserRequest {
    username: Option<String>,
    password: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    role: Option<Role>,
    branch: Option<String>,
    active: Option<bool>,
}

async fn update_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(id): Path<i64>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<Json<UserView>, ProblemResponse> {
    auth.require(&[Role::Hr])?;
    let users = state.storage().users();
    let current = users.find(id).await?.ok_or(UserError::NotFound)?;

    let password_hash = match request.password.as_deref() {
        Some(password) => checked_password(password)?,
        None => users.password_hash(id).await?,
    };
    let username = match request.username {
        Some(name) if name.trim().is_empty() => {
            return Err(bad_request("invalid_username", "username is required"))
        }
        Some(name) => name.trim().to_string(),
        None => current.username,
    };

    let updated = users
        .update(
            id,
            &NewUser {
                username,
                password_hash,
                first_name: request.first_name.map_or(current.first_name, |v| v.trim().to_string()),
                last_name: request.last_name.map_or(current.last_name, |v| v.trim().to_string()),
                email: request.email.map_or(current.email, |v| v.trim().to_string()),
                phone: request.phone.map_or(current.phone, |v| v.trim().to_string()),
                role: request.role.unwrap_or(current.role),
                branch: request.branch.map_or(current.branch, |v| v.trim().to_string()),
                active: request.active.unwrap_or(current.active),
            },
        )
        .await?;
    Ok(Json(updated.into()))
}

/// Creates the first `hr` account when the user table is empty.
pub async fn ensure_bootstrap_user(
    database: &Database,
    bootstrap: &BootstrapUser,
    branch: &str,
    now: DateTime<Utc>,
) -> Result<bool, Box<dyn std::error::Error>> {
    let users = database.users();
    if users.count().await? > 0 {
        return Ok(false);
    }
    let user = users
        .insert(
            &NewUser {
                username: bootstrap.username.clone(),
                password_hash: hash_password(&bootstrap.password)?,
                first_name: String::new(),
                last_name: String::new(),
                email: String::new(),
                phone: String::new(),
                role: Role::Hr,
                branch: branch.to_string(),
                active: true,
            },
            now,
        )
        .await?;
    info!(stage = "auth", user_id = user.id, username = %user.username, "bootstrap hr account created");
    Ok(true)
}
