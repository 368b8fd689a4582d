//! Environment-driven application configuration.
//!
//! All configuration is read from the environment at startup. `validate()`
//! reports issues with a severity; errors are startup-fatal (the gateway
//! refuses to boot), warnings are logged and tolerated.

use std::fmt;
use std::time::Duration;

use crate::operation::OperationType;

/// Development fallback secrets. Production startup refuses both.
pub const DEV_ENCRYPTION_KEY: &str = "dev-only-encryption-key-change-me";
pub const DEV_SESSION_SECRET: &str = "dev-only-session-secret-change-me";

const MIN_SECRET_LEN: usize = 32;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Enums
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "development" => Some(Self::Development),
            "production" => Some(Self::Production),
            _ => None,
        }
    }
}

/// Recognised database drivers. This build ships the SQLite store; the
/// other spec'd drivers are rejected at startup with a clear message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseDriver {
    Sqlite,
    Postgres,
    Mysql,
    Sqlserver,
}

impl DatabaseDriver {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "sqlite" => Some(Self::Sqlite),
            "postgres" => Some(Self::Postgres),
            "mysql" => Some(Self::Mysql),
            "sqlserver" => Some(Self::Sqlserver),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Sqlserver => "sqlserver",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-configs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Operations pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Interval between claim attempts when the queue is idle.
    pub poll_interval: Duration,
    /// Deadline for handlers without a per-type override.
    pub default_timeout: Duration,
    /// `safe_provision` runs longer than other operations.
    pub safe_provision_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_multiplier: f64,
    pub backoff_jitter: f64,
    pub backoff_max: Duration,
    /// How long shutdown waits for an in-flight handler to drain.
    pub shutdown_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            default_timeout: Duration::from_secs(300),
            safe_provision_timeout: Duration::from_secs(600),
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            backoff_jitter: 0.2,
            backoff_max: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Deadline for an operation of the given type.
    pub fn timeout_for(&self, op_type: OperationType) -> Duration {
        match op_type {
            OperationType::SafeProvision => self.safe_provision_timeout,
            _ => self.default_timeout,
        }
    }
}

/// Sync scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Concurrent sync runs across all (instance, sync_type) keys.
    pub parallelism: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            parallelism: 4,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AppConfig
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub database_driver: DatabaseDriver,
    pub encryption_key: String,
    pub session_secret: String,
    pub initial_admin_username: String,
    /// When None, a random password is generated and logged exactly once.
    pub initial_admin_password: Option<String>,
    pub app_env: AppEnv,
    pub log_level: String,
    pub http_addr: String,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    pub trust_refresh_interval: Duration,
    pub session_ttl: Duration,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through a lookup function (testable variant).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let database_url = get("DATABASE_URL")
            .ok_or_else(|| crate::Error::Config("DATABASE_URL is required".into()))?;

        let driver_raw = get("DATABASE_DRIVER").unwrap_or_else(|| "sqlite".into());
        let database_driver = DatabaseDriver::parse(&driver_raw).ok_or_else(|| {
            crate::Error::Config(format!(
                "DATABASE_DRIVER must be one of postgres|mysql|sqlite|sqlserver, got {driver_raw:?}"
            ))
        })?;

        let app_env_raw = get("APP_ENV").unwrap_or_else(|| "development".into());
        let app_env = AppEnv::parse(&app_env_raw).ok_or_else(|| {
            crate::Error::Config(format!(
                "APP_ENV must be development or production, got {app_env_raw:?}"
            ))
        })?;

        let mut pipeline = PipelineConfig::default();
        if let Some(secs) = parse_secs(&get, "PIPELINE_POLL_INTERVAL_SECONDS")? {
            pipeline.poll_interval = secs;
        }
        if let Some(secs) = parse_secs(&get, "OPERATION_DEFAULT_TIMEOUT_SECONDS")? {
            pipeline.default_timeout = secs;
        }
        if let Some(secs) = parse_secs(&get, "SAFE_PROVISION_TIMEOUT_SECONDS")? {
            pipeline.safe_provision_timeout = secs;
        }
        if let Some(secs) = parse_secs(&get, "SHUTDOWN_GRACE_SECONDS")? {
            pipeline.shutdown_grace = secs;
        }

        let mut scheduler = SchedulerConfig::default();
        if let Some(secs) = parse_secs(&get, "SCHEDULER_TICK_SECONDS")? {
            scheduler.tick_interval = secs;
        }
        if let Some(raw) = get("SYNC_PARALLELISM") {
            scheduler.parallelism = raw
                .parse::<usize>()
                .map_err(|_| crate::Error::Config(format!("SYNC_PARALLELISM: invalid value {raw:?}")))?
                .clamp(1, 32);
        }

        let trust_refresh_interval = parse_secs(&get, "TRUST_REFRESH_SECONDS")?
            .unwrap_or(Duration::from_secs(300));
        let session_ttl =
            parse_secs(&get, "SESSION_TTL_SECONDS")?.unwrap_or(Duration::from_secs(86_400));

        Ok(Self {
            database_url,
            database_driver,
            encryption_key: get("ENCRYPTION_KEY").unwrap_or_else(|| DEV_ENCRYPTION_KEY.into()),
            session_secret: get("SESSION_SECRET").unwrap_or_else(|| DEV_SESSION_SECRET.into()),
            initial_admin_username: get("INITIAL_ADMIN_USERNAME").unwrap_or_else(|| "admin".into()),
            initial_admin_password: get("INITIAL_ADMIN_PASSWORD").filter(|p| !p.is_empty()),
            app_env,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            http_addr: get("HTTP_ADDR").unwrap_or_else(|| "127.0.0.1:8080".into()),
            pipeline,
            scheduler,
            trust_refresh_interval,
            session_ttl,
        })
    }

    pub fn is_production(&self) -> bool {
        self.app_env == AppEnv::Production
    }

    /// Validate the configuration. Errors are startup-fatal.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.database_driver != DatabaseDriver::Sqlite {
            issues.push(error(format!(
                "DATABASE_DRIVER {:?} is not supported by this build (sqlite only)",
                self.database_driver.as_str()
            )));
        }

        for (name, value, dev_default) in [
            ("ENCRYPTION_KEY", &self.encryption_key, DEV_ENCRYPTION_KEY),
            ("SESSION_SECRET", &self.session_secret, DEV_SESSION_SECRET),
        ] {
            let is_default = value == dev_default;
            let too_short = value.len() < MIN_SECRET_LEN;
            if self.is_production() {
                if is_default {
                    issues.push(error(format!(
                        "{name} must not be the development default in production"
                    )));
                } else if too_short {
                    issues.push(error(format!(
                        "{name} must be at least {MIN_SECRET_LEN} characters in production"
                    )));
                }
            } else if is_default {
                issues.push(warning(format!("{name} is using the development default")));
            } else if too_short {
                issues.push(warning(format!(
                    "{name} is shorter than {MIN_SECRET_LEN} characters"
                )));
            }
        }

        if self.initial_admin_username.trim().is_empty() {
            issues.push(error("INITIAL_ADMIN_USERNAME must not be empty".into()));
        }

        if self.pipeline.backoff_multiplier < 1.0 {
            issues.push(error("backoff multiplier must be >= 1.0".into()));
        }
        if !(0.0..1.0).contains(&self.pipeline.backoff_jitter) {
            issues.push(error("backoff jitter must be in [0, 1)".into()));
        }

        issues
    }

    pub fn has_errors(issues: &[ConfigIssue]) -> bool {
        issues.iter().any(|i| i.severity == ConfigSeverity::Error)
    }
}

fn parse_secs(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> crate::Result<Option<Duration>> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<u64>()
            .map(|s| Some(Duration::from_secs(s)))
            .map_err(|_| crate::Error::Config(format!("{key}: invalid value {raw:?}"))),
    }
}

fn error(message: String) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Error,
        message,
    }
}

fn warning(message: String) -> ConfigIssue {
    ConfigIssue {
        severity: ConfigSeverity::Warning,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn requires_database_url() {
        let result = AppConfig::from_lookup(env(&[]));
        assert!(result.is_err());
    }

    #[test]
    fn development_defaults() {
        let cfg = AppConfig::from_lookup(env(&[("DATABASE_URL", "vaultpilot.db")])).unwrap();
        assert_eq!(cfg.app_env, AppEnv::Development);
        assert_eq!(cfg.database_driver, DatabaseDriver::Sqlite);
        assert_eq!(cfg.initial_admin_username, "admin");
        assert_eq!(cfg.pipeline.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.scheduler.tick_interval, Duration::from_secs(30));

        // Dev defaults produce warnings, not errors.
        let issues = cfg.validate();
        assert!(!AppConfig::has_errors(&issues));
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Warning));
    }

    #[test]
    fn production_rejects_dev_secrets() {
        let cfg = AppConfig::from_lookup(env(&[
            ("DATABASE_URL", "vaultpilot.db"),
            ("APP_ENV", "production"),
        ]))
        .unwrap();
        let issues = cfg.validate();
        assert!(AppConfig::has_errors(&issues));
    }

    #[test]
    fn production_rejects_short_secrets() {
        let cfg = AppConfig::from_lookup(env(&[
            ("DATABASE_URL", "vaultpilot.db"),
            ("APP_ENV", "production"),
            ("ENCRYPTION_KEY", "short"),
            ("SESSION_SECRET", "also-short"),
        ]))
        .unwrap();
        let issues = cfg.validate();
        let errors: Vec<_> = issues
            .iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .collect();
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn production_accepts_long_secrets() {
        let key = "k".repeat(48);
        let secret = "s".repeat(48);
        let cfg = AppConfig::from_lookup(env(&[
            ("DATABASE_URL", "vaultpilot.db"),
            ("APP_ENV", "production"),
            ("ENCRYPTION_KEY", &key),
            ("SESSION_SECRET", &secret),
        ]))
        .unwrap();
        assert!(!AppConfig::has_errors(&cfg.validate()));
    }

    #[test]
    fn rejects_unknown_driver_value() {
        let result = AppConfig::from_lookup(env(&[
            ("DATABASE_URL", "db"),
            ("DATABASE_DRIVER", "oracle"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn unsupported_driver_is_a_validation_error() {
        let cfg = AppConfig::from_lookup(env(&[
            ("DATABASE_URL", "db"),
            ("DATABASE_DRIVER", "postgres"),
        ]))
        .unwrap();
        assert!(AppConfig::has_errors(&cfg.validate()));
    }

    #[test]
    fn timeout_overrides() {
        let cfg = AppConfig::from_lookup(env(&[
            ("DATABASE_URL", "db"),
            ("OPERATION_DEFAULT_TIMEOUT_SECONDS", "60"),
            ("SAFE_PROVISION_TIMEOUT_SECONDS", "90"),
        ]))
        .unwrap();
        assert_eq!(
            cfg.pipeline.timeout_for(OperationType::AccessGrant),
            Duration::from_secs(60)
        );
        assert_eq!(
            cfg.pipeline.timeout_for(OperationType::SafeProvision),
            Duration::from_secs(90)
        );
    }

    #[test]
    fn blank_admin_password_treated_as_absent() {
        let cfg = AppConfig::from_lookup(env(&[
            ("DATABASE_URL", "db"),
            ("INITIAL_ADMIN_PASSWORD", ""),
        ]))
        .unwrap();
        assert!(cfg.initial_admin_password.is_none());
    }
}
