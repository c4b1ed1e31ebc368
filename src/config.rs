//! Configuration for admission-gate.

use crate::gateway::{ChannelId, RoleId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Longest accepted snapshot time-to-live (one week).
pub const MAX_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted cooldown (one day).
pub const MAX_COOLDOWN_SECS: u64 = 24 * 60 * 60;

/// Longest accepted single fetch timeout.
pub const MAX_FETCH_TIMEOUT_SECS: u64 = 300;

/// Where the roster is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RosterSourceKind {
    /// One column of a Google Sheets worksheet.
    #[default]
    Sheets,
    /// A local newline-delimited file.
    File,
}

/// Gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Root directory for gate data (audit trail).
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Label format.
    #[serde(default)]
    pub format: FormatConfig,

    /// Roster source and cache policy.
    #[serde(default)]
    pub roster: RosterConfig,

    /// Claimant response timing.
    #[serde(default)]
    pub response: ResponseConfig,

    /// Rate-limit retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Human review routing.
    #[serde(default)]
    pub escalation: EscalationConfig,

    /// Audit trail.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Channel that receives a welcome message on each grant.
    #[serde(default)]
    pub welcome_channel: Option<ChannelId>,

    /// Channel that receives the operator event stream.
    #[serde(default)]
    pub log_channel: Option<ChannelId>,
}

/// Label format configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormatConfig {
    /// Literal prefix before the first `_`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Whether the prefix must match case exactly.
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

/// Roster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RosterConfig {
    /// Source kind.
    #[serde(default)]
    pub source: RosterSourceKind,

    /// Spreadsheet id (sheets source).
    #[serde(default)]
    pub spreadsheet_id: String,

    /// Worksheet name (sheets source).
    #[serde(default = "default_worksheet")]
    pub worksheet: String,

    /// Column letter holding application ids (sheets source).
    #[serde(default = "default_column")]
    pub column: String,

    /// Environment variable holding the Sheets API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Environment variable holding an OAuth access token, needed for
    /// sheets that are not publicly readable.
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Roster file (file source).
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Snapshot time-to-live in seconds.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Timeout for a single fetch in seconds.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Fetch attempts per refresh cycle.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Consecutive transient failures that start a cooldown.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Cooldown length in seconds.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

/// Claimant response timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Time allowed before a provisional acknowledgment is sent, in milliseconds.
    #[serde(default = "default_ack_budget")]
    pub ack_budget_ms: u64,
}

/// Rate-limit retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Longest provider-requested wait that is honoured, in milliseconds.
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,
}

/// Human review configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Channel reviewers watch.
    #[serde(default)]
    pub review_channel: Option<ChannelId>,

    /// Role mentioned in review requests.
    #[serde(default)]
    pub helper_role: Option<RoleId>,
}

/// Audit trail configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Audit file; defaults to `<root_dir>/verification_audit.jsonl`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            log_level: default_log_level(),
            format: FormatConfig::default(),
            roster: RosterConfig::default(),
            response: ResponseConfig::default(),
            retry: RetryConfig::default(),
            escalation: EscalationConfig::default(),
            audit: AuditConfig::default(),
            welcome_channel: None,
            log_channel: None,
        }
    }
}

impl Default for FormatConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            case_sensitive: true,
        }
    }
}

impl Default for RosterConfig {
    fn default() -> Self {
        Self {
            source: RosterSourceKind::default(),
            spreadsheet_id: String::new(),
            worksheet: default_worksheet(),
            column: default_column(),
            api_key_env: default_api_key_env(),
            token_env: default_token_env(),
            file_path: None,
            ttl_secs: default_ttl(),
            fetch_timeout_secs: default_fetch_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            ack_budget_ms: default_ack_budget(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: default_max_wait(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "admission-gate")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".admission-gate"))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_prefix() -> String {
    "RA".to_string()
}

const fn default_true() -> bool {
    true
}

fn default_worksheet() -> String {
    "Form Responses 1".to_string()
}

fn default_column() -> String {
    "AA".to_string()
}

fn default_api_key_env() -> String {
    "SHEETS_API_KEY".to_string()
}

fn default_token_env() -> String {
    "SHEETS_ACCESS_TOKEN".to_string()
}

const fn default_ttl() -> u64 {
    300
}

const fn default_fetch_timeout() -> u64 {
    10
}

const fn default_max_attempts() -> u32 {
    4
}

const fn default_initial_backoff() -> u64 {
    500
}

const fn default_max_backoff() -> u64 {
    8_000
}

const fn default_failure_threshold() -> u32 {
    4
}

const fn default_cooldown() -> u64 {
    60
}

const fn default_ack_budget() -> u64 {
    2_500 // provider tokens are valid for ~3s
}

const fn default_max_wait() -> u64 {
    10_000
}

impl RosterConfig {
    /// Snapshot time-to-live.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Per-fetch timeout.
    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Cooldown length.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl GateConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Save configuration to a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn to_file(&self, path: &std::path::Path) -> crate::Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| crate::Error::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid value.
    pub fn validate(&self) -> crate::Result<()> {
        if self.format.prefix.is_empty() {
            return Err(crate::Error::Config("format.prefix must not be empty".to_string()));
        }
        if self.format.prefix.contains('_') {
            return Err(crate::Error::Config(
                "format.prefix must not contain '_'".to_string(),
            ));
        }
        if self.roster.max_attempts == 0 {
            return Err(crate::Error::Config(
                "roster.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_TTL_SECS).contains(&self.roster.ttl_secs) {
            return Err(crate::Error::Config(format!(
                "roster.ttl_secs must be between 1 and {MAX_TTL_SECS}"
            )));
        }
        if self.roster.cooldown_secs > MAX_COOLDOWN_SECS {
            return Err(crate::Error::Config(format!(
                "roster.cooldown_secs must be at most {MAX_COOLDOWN_SECS}"
            )));
        }
        if !(1..=MAX_FETCH_TIMEOUT_SECS).contains(&self.roster.fetch_timeout_secs) {
            return Err(crate::Error::Config(format!(
                "roster.fetch_timeout_secs must be between 1 and {MAX_FETCH_TIMEOUT_SECS}"
            )));
        }
        if self.roster.max_backoff_ms < self.roster.initial_backoff_ms {
            return Err(crate::Error::Config(
                "roster.max_backoff_ms must not be below roster.initial_backoff_ms".to_string(),
            ));
        }
        if self.roster.source == RosterSourceKind::File && self.roster.file_path.is_none() {
            return Err(crate::Error::Config(
                "roster.file_path is required for the file source".to_string(),
            ));
        }
        Ok(())
    }

    /// Audit trail location.
    #[must_use]
    pub fn audit_path(&self) -> PathBuf {
        self.audit
            .path
            .clone()
            .unwrap_or_else(|| self.root_dir.join("verification_audit.jsonl"))
    }

    /// Time allowed before a provisional acknowledgment.
    #[must_use]
    pub fn ack_budget(&self) -> Duration {
        Duration::from_millis(self.response.ack_budget_ms)
    }

    /// Longest honoured rate-limit wait.
    #[must_use]
    pub fn max_retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry.max_wait_ms)
    }
}
