//! Configuration loading and parsing.
//!
//! Defines the TOML schema and resolves it into validated settings. Keys are
//! snake_case; the CamelCase names and `[Uploader]` section used by older
//! deployments are accepted as aliases.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::engine::EngineSettings;
use crate::escalation::{BanMode, EscalationPolicy};
use crate::policy::QuotaPolicy;
use crate::probe::DurationBackend;
use crate::sources::inbound::ReadinessProbe;

const DEFAULT_AUTH_LOG: &str = "/var/log/auth.log";
const DEFAULT_LEDGER_DB: &str = "userstats.db";
const DEFAULT_QUOTA_PERIOD_SECS: i64 = 86_400;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_READINESS_ATTEMPTS: u32 = 5;
const DEFAULT_READINESS_DELAY_MS: u64 = 2_000;
const DEFAULT_INBOUND_RETRY_SECS: u64 = 60;
const DEFAULT_FFPROBE: &str = "ffprobe";

/// Top-level configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct IntakeConfig {
    /// Upload intake settings.
    #[serde(alias = "Uploader")]
    pub uploader: Option<UploaderConfig>,
}

/// `[uploader]` table.
#[derive(Debug, Default, Deserialize)]
pub struct UploaderConfig {
    /// Per-identity upload ceiling per quota period, in MB.
    #[serde(alias = "MaxUserUploadSize")]
    pub max_user_upload_mb: Option<u64>,
    /// Per-identity airtime ceiling per quota period, in seconds.
    #[serde(alias = "MaxUserAirtime")]
    pub max_user_airtime_secs: Option<u64>,
    /// Accepted file extensions.
    #[serde(alias = "AcceptedUploadFileTypes")]
    pub accepted_upload_file_types: Option<Vec<String>>,
    /// Directory of contributors' OpenSSH public keys.
    #[serde(alias = "SSHKeyDir")]
    pub ssh_key_dir: Option<String>,
    /// Directory receiving the audit file.
    #[serde(alias = "AccessLog")]
    pub access_log_dir: Option<String>,
    /// Drop directory for uploads.
    #[serde(alias = "InboundDirectory")]
    pub inbound_dir: Option<String>,
    /// Handoff directory read by the converter.
    #[serde(alias = "StorageDirectory")]
    pub storage_dir: Option<String>,
    #[serde(alias = "StrikesBeforeTimeOut")]
    pub strikes_before_timeout: Option<u32>,
    #[serde(alias = "TimeOutsBeforeBan")]
    pub timeouts_before_ban: Option<u32>,
    /// Authentication log to tail (default /var/log/auth.log, empty disables).
    pub auth_log: Option<String>,
    /// Read the auth log from the beginning instead of its current end.
    pub tail_from_start: Option<bool>,
    /// SQLite ledger path (default userstats.db).
    pub ledger_db_path: Option<String>,
    /// Quota period length in seconds (default 86400, 0 never resets).
    pub quota_period_secs: Option<i64>,
    /// `soft` or `permanent`.
    pub ban_mode: Option<String>,
    /// Poll cadence for the auth log and inbound rescans.
    pub poll_interval_ms: Option<u64>,
    pub readiness_attempts: Option<u32>,
    pub readiness_delay_ms: Option<u64>,
    /// Re-offer unchanged inbound files after this many seconds (default 60, 0 never).
    pub inbound_retry_secs: Option<u64>,
    /// `symphonia` or `ffprobe`.
    pub duration_probe: Option<String>,
    pub ffprobe_path: Option<String>,
    /// Accept `<key-path> <file-path>` lines on stdin (default true).
    pub read_control_stdin: Option<bool>,
}

impl IntakeConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<IntakeConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }
}

/// Validated settings with defaults applied.
#[derive(Clone, Debug)]
pub struct IntakeSettings {
    pub quota: QuotaPolicy,
    pub escalation: EscalationPolicy,
    pub ban_mode: BanMode,
    pub quota_period_secs: i64,
    pub ssh_key_dir: PathBuf,
    pub access_log_dir: PathBuf,
    pub inbound_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub ledger_db_path: PathBuf,
    pub auth_log: Option<PathBuf>,
    pub tail_from_start: bool,
    pub poll_interval: Duration,
    pub readiness: ReadinessProbe,
    pub inbound_retry: Option<Duration>,
    pub duration_backend: DurationBackend,
    pub read_control_stdin: bool,
}

impl IntakeSettings {
    pub fn from_config(cfg: &IntakeConfig) -> Result<Self> {
        let up = cfg
            .uploader
            .as_ref()
            .ok_or_else(|| anyhow!("[uploader] section is required in config"))?;

        let max_upload_mb = positive(up.max_user_upload_mb, "max_user_upload_mb")?;
        let max_airtime_secs = positive(up.max_user_airtime_secs, "max_user_airtime_secs")?;
        let types = required(up.accepted_upload_file_types.as_ref(), "accepted_upload_file_types")?;
        let quota = QuotaPolicy::new(types, max_upload_mb, max_airtime_secs);
        if quota.accepted_types().is_empty() {
            return Err(anyhow!("accepted_upload_file_types must list at least one extension"));
        }

        let escalation = EscalationPolicy {
            strike_threshold: positive(up.strikes_before_timeout, "strikes_before_timeout")?,
            timeout_threshold: positive(up.timeouts_before_ban, "timeouts_before_ban")?,
        };

        let ban_mode = match up.ban_mode.as_deref().map(str::trim) {
            None | Some("") | Some("soft") => BanMode::Soft,
            Some("permanent") => BanMode::Permanent,
            Some(other) => {
                return Err(anyhow!(
                    "ban_mode must be \"soft\" or \"permanent\", got {other:?}"
                ));
            }
        };

        let quota_period_secs = up.quota_period_secs.unwrap_or(DEFAULT_QUOTA_PERIOD_SECS);
        if quota_period_secs < 0 {
            return Err(anyhow!("quota_period_secs must not be negative"));
        }

        let inbound_dir = required_path(up.inbound_dir.as_deref(), "inbound_dir")?;
        let auth_log = match up.auth_log.as_deref().map(str::trim) {
            None => Some(PathBuf::from(DEFAULT_AUTH_LOG)),
            Some("") => None,
            Some(path) => Some(PathBuf::from(path)),
        };

        let duration_backend = match up.duration_probe.as_deref().map(str::trim) {
            None | Some("") | Some("symphonia") => DurationBackend::Symphonia,
            Some("ffprobe") => DurationBackend::Ffprobe {
                program: up
                    .ffprobe_path
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .unwrap_or(DEFAULT_FFPROBE)
                    .into(),
            },
            Some(other) => {
                return Err(anyhow!(
                    "duration_probe must be \"symphonia\" or \"ffprobe\", got {other:?}"
                ));
            }
        };

        let poll_interval_ms = up.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
        if poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than zero"));
        }

        Ok(Self {
            quota,
            escalation,
            ban_mode,
            quota_period_secs,
            ssh_key_dir: required_path(up.ssh_key_dir.as_deref(), "ssh_key_dir")?,
            access_log_dir: required_path(up.access_log_dir.as_deref(), "access_log_dir")?,
            storage_dir: required_path(up.storage_dir.as_deref(), "storage_dir")?,
            inbound_dir,
            ledger_db_path: up
                .ledger_db_path
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .unwrap_or(DEFAULT_LEDGER_DB)
                .into(),
            auth_log,
            tail_from_start: up.tail_from_start.unwrap_or(false),
            poll_interval: Duration::from_millis(poll_interval_ms),
            readiness: ReadinessProbe {
                attempts: up
                    .readiness_attempts
                    .unwrap_or(DEFAULT_READINESS_ATTEMPTS)
                    .max(1),
                delay: Duration::from_millis(
                    up.readiness_delay_ms.unwrap_or(DEFAULT_READINESS_DELAY_MS),
                ),
            },
            inbound_retry: match up.inbound_retry_secs.unwrap_or(DEFAULT_INBOUND_RETRY_SECS) {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            duration_backend,
            read_control_stdin: up.read_control_stdin.unwrap_or(true),
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            quota: self.quota.clone(),
            escalation: self.escalation,
            ban_mode: self.ban_mode,
            quota_period_secs: self.quota_period_secs,
        }
    }
}

fn required<T>(value: Option<T>, key: &str) -> Result<T> {
    value.ok_or_else(|| anyhow!("{key} is required in config"))
}

fn positive<T: Default + PartialEq>(value: Option<T>, key: &str) -> Result<T> {
    let value = required(value, key)?;
    if value == T::default() {
        return Err(anyhow!("{key} must be greater than zero"));
    }
    Ok(value)
}

fn required_path(value: Option<&str>, key: &str) -> Result<PathBuf> {
    let raw = required(value, key)?.trim();
    if raw.is_empty() {
        return Err(anyhow!("{key} must not be empty"));
    }
    Ok(PathBuf::from(raw))
}
