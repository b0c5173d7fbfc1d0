//! Process configuration from `COURTSIDE_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::clock::RegionalZone;
use crate::mail::{MailConfig, MailTransportConfig};
use crate::model::normalize_handle;
use crate::retry::RetryPolicy;

const PREFIX: &str = "COURTSIDE_";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub zone: RegionalZone,
    /// Normalised handles that register with the Admin role.
    pub admins: Vec<String>,
    pub catalog: Option<PathBuf>,
    pub slot_policy: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub notify_timeout: Duration,
    pub mail: MailConfig,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: String, value: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid {var}: {value:?}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// `lookup` receives full variable names (`COURTSIDE_PORT`, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw = |name: &str| lookup(&format!("{PREFIX}{name}")).filter(|v| !v.trim().is_empty());

        let data_dir = PathBuf::from(raw("DATA_DIR").unwrap_or_else(|| "./data".into()));
        let offset: i32 = parsed(&raw, "UTC_OFFSET_MINUTES")?.unwrap_or(330);
        let zone = RegionalZone::from_offset_minutes(offset).ok_or_else(|| ConfigError::Invalid {
            var: format!("{PREFIX}UTC_OFFSET_MINUTES"),
            value: offset.to_string(),
        })?;

        let defaults = RetryPolicy::default();
        let retry = RetryPolicy {
            max_attempts: parsed(&raw, "RETRY_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            base_backoff: millis(&raw, "RETRY_BACKOFF_MS")?.unwrap_or(defaults.base_backoff),
            factor: parsed(&raw, "RETRY_BACKOFF_FACTOR")?.unwrap_or(defaults.factor),
            max_backoff: millis(&raw, "RETRY_MAX_BACKOFF_MS")?.unwrap_or(defaults.max_backoff),
            op_timeout: millis(&raw, "STORE_TIMEOUT_MS")?.unwrap_or(defaults.op_timeout),
        };

        let admins = raw("ADMINS")
            .map(|list| {
                list.split(',')
                    .map(normalize_handle)
                    .filter(|h| !h.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        // An SMTP host selects SMTP delivery; otherwise mail lands in files.
        let transport = match raw("SMTP_HOST") {
            Some(host) => MailTransportConfig::Smtp {
                host,
                port: parsed(&raw, "SMTP_PORT")?.unwrap_or(587),
                username: raw("SMTP_USERNAME"),
                password: raw("SMTP_PASSWORD"),
                use_tls: parsed(&raw, "SMTP_TLS")?.unwrap_or(true),
            },
            None => MailTransportConfig::File {
                path: raw("MAIL_SPOOL_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| data_dir.join("outbox")),
            },
        };
        let mail = MailConfig {
            sender: raw("MAIL_SENDER").unwrap_or_else(|| "noreply@jitsports.com".into()),
            transport,
        };

        Ok(Self {
            port: parsed(&raw, "PORT")?.unwrap_or(7878),
            bind: raw("BIND").unwrap_or_else(|| "0.0.0.0".into()),
            max_connections: parsed(&raw, "MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&raw, "COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&raw, "METRICS_PORT")?,
            zone,
            admins,
            catalog: raw("CATALOG").map(PathBuf::from),
            slot_policy: raw("SLOT_POLICY").map(PathBuf::from),
            retry,
            notify_timeout: millis(&raw, "NOTIFY_TIMEOUT_MS")?.unwrap_or(Duration::from_secs(10)),
            mail,
            data_dir,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("courtside.wal")
    }

    pub fn is_admin(&self, handle: &str) -> bool {
        let handle = normalize_handle(handle);
        self.admins.iter().any(|a| *a == handle)
    }
}

fn parsed<T: FromStr>(
    raw: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>, ConfigError> {
    match raw(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var: format!("{PREFIX}{name}"),
                value,
            }),
    }
}

fn millis(
    raw: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parsed::<u64>(raw, name)?.map(Duration::from_millis))
}
