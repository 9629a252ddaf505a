use std::{env, fmt, net::SocketAddr, time::Duration};

use chrono_tz::Tz;

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://safebox.db";
pub const DEFAULT_TIMEZONE: &str = "America/Santiago";
const DEFAULT_TOKEN_TTL_SECS: u64 = 8 * 60 * 60;
const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 60 * 60;
const DEVELOPMENT_JWT_SECRET: &str = "safebox-development-secret";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns `true` when the current environment should behave as development.
    pub fn is_development(self) -> bool {
        matches!(self, Self::Development)
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Credentials for the first `hr` account, created when the user table is empty.
#[derive(Clone)]
pub struct BootstrapUser {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for BootstrapUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapUser")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub jwt_secret: Vec<u8>,
    pub token_ttl: Duration,
    pub timezone: Tz,
    pub maintenance_interval: Duration,
    pub bootstrap_user: Option<BootstrapUser>,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let jwt_secret = match env::var("APP_JWT_SECRET") {
            Ok(value) if !value.trim().is_empty() => value.into_bytes(),
            _ if environment == Environment::Production => {
                return Err(ConfigError::MissingVar("APP_JWT_SECRET"))
            }
            _ => DEVELOPMENT_JWT_SECRET.as_bytes().to_vec(),
        };

        let token_ttl = Duration::from_secs(positive_secs(
            "APP_TOKEN_TTL_SECS",
            DEFAULT_TOKEN_TTL_SECS,
        )?);
        let maintenance_interval = Duration::from_secs(positive_secs(
            "APP_MAINTENANCE_INTERVAL_SECS",
            DEFAULT_MAINTENANCE_INTERVAL_SECS,
        )?);

        let tz_value = env::var("APP_TIMEZONE").unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string());
        let timezone = tz_value
            .parse::<Tz>()
            .map_err(|_| ConfigError::InvalidTimezone(tz_value.clone()))?;

        let bootstrap_user = match (
            env::var("APP_BOOTSTRAP_USERNAME"),
            env::var("APP_BOOTSTRAP_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) if !username.is_empty() && !password.is_empty() => {
                Some(BootstrapUser { username, password })
            }
            _ => None,
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url,
            jwt_secret,
            token_ttl,
            timezone,
            maintenance_interval,
            bootstrap_user,
        })
    }
}

fn positive_secs(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(default);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(ConfigError::InvalidNumber { name, value: raw }),
    }
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    MissingVar(&'static str),
    InvalidNumber { name: &'static str, value: String },
    InvalidTimezone(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::MissingVar(name) => write!(f, "{name} must be set in this environment"),
            Self::InvalidNumber { name, value } => {
                write!(f, "{name} must be a positive integer (got {value})")
            }
            Self::InvalidTimezone(value) => {
                write!(f, "APP_TIMEZONE must be an IANA timezone name (got {value})")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_env::ENV_GUARD;
    use crate::DEFAULT_BIND_ADDR;

    const VARS: &[&str] = &[
        "APP_ENV",
        "APP_BIND_ADDR",
        "DATABASE_URL",
        "APP_JWT_SECRET",
        "APP_TOKEN_TTL_SECS",
        "APP_TIMEZONE",
        "APP_MAINTENANCE_INTERVAL_SECS",
        "APP_BOOTSTRAP_USERNAME",
        "APP_BOOTSTRAP_PASSWORD",
    ];

    fn clear_env() {
        for name in VARS {
            env::remove_var(name);
        }
    }

    #[test]
    fn loads_defaults_in_development() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();

        let config = AppConfig::from_env().expect("config should load with defaults");
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.bind_addr.to_string(), DEFAULT_BIND_ADDR);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.timezone, chrono_tz::America::Santiago);
        assert_eq!(config.token_ttl, Duration::from_secs(8 * 60 * 60));
        assert!(config.bootstrap_user.is_none());
        assert!(!config.jwt_secret.is_empty());
    }

    #[test]
    fn rejects_invalid_environment() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("APP_ENV", "invalid");

        let err = AppConfig::from_env().expect_err("invalid env should error");
        assert!(matches!(err, ConfigError::InvalidEnvironment(value) if value == "invalid"));

        clear_env();
    }

    #[test]
    fn production_requires_jwt_secret() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("APP_ENV", "production");

        let err = AppConfig::from_env().expect_err("missing secret should error");
        assert!(matches!(err, ConfigError::MissingVar("APP_JWT_SECRET")));

        env::set_var("APP_JWT_SECRET", "prod-secret");
        env::set_var("APP_BIND_ADDR", "0.0.0.0:9000");
        let config = AppConfig::from_env().expect("config should load");
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.jwt_secret, b"prod-secret".to_vec());

        clear_env();
    }

    #[test]
    fn rejects_unknown_timezone_and_zero_ttl() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("APP_TIMEZONE", "Mars/Olympus");
        let err = AppConfig::from_env().expect_err("bad timezone should error");
        assert!(matches!(err, ConfigError::InvalidTimezone(_)));

        clear_env();
        env::set_var("APP_TOKEN_TTL_SECS", "0");
        let err = AppConfig::from_env().expect_err("zero ttl should error");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                name: "APP_TOKEN_TTL_SECS",
                ..
            }
        ));

        clear_env();
    }

    #[test]
    fn reads_bootstrap_credentials() {
        let _guard = ENV_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("APP_BOOTSTRAP_USERNAME", "admin");
        env::set_var("APP_BOOTSTRAP_PASSWORD", "s3cret");

        let config = AppConfig::from_env().expect("config should load");
        let bootstrap = config.bootstrap_user.expect("bootstrap user");
        assert_eq!(bootstrap.username, "admin");
        assert!(!format!("{bootstrap:?}").contains("s3cret"));

        clear_env();
    }
}
