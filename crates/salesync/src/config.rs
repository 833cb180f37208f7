//! Configuration loading for the sync engine
//!
//! OAuth credentials load from (in order of priority):
//! 1. Compile-time embedded credentials (for production builds)
//! 2. JSON file (Google Cloud Console format)
//! 3. Runtime environment variables (fallback)
//!
//! Engine tuning ([`SyncConfig`]) loads from `sync.json` in the config
//! directory, then `SALESYNC_*` environment variables override single fields.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Credentials filename in the salesync config directory
const CREDENTIALS_FILE: &str = "google-credentials.json";

/// Engine settings filename in the salesync config directory
const SYNC_CONFIG_FILE: &str = "sync.json";

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials using the following priority:
    /// 1. Compile-time embedded credentials
    /// 2. JSON file (~/.config/salesync/google-credentials.json)
    /// 3. Runtime environment variables
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if config::config_exists(CREDENTIALS_FILE) {
            let creds: GoogleCredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Load credentials embedded at compile time via environment variables.
    /// Build with: GOOGLE_CLIENT_ID=xxx GOOGLE_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;

        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }

        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    /// Load credentials from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Support both "installed" (desktop) and "web" credential types
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    /// Load credentials from environment variables
    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }

    /// Get the default credentials file path
    pub fn default_credentials_path() -> Option<PathBuf> {
        config::config_path(CREDENTIALS_FILE)
    }
}

/// Tuning for the sync engine and the daemon around it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Minimum time between scheduled cycles of one account
    pub sync_interval_secs: u64,
    /// Wall-clock budget of one account's full cycle
    pub cycle_timeout_secs: u64,
    /// Age after which a held lock is considered abandoned
    pub stale_lock_secs: u64,
    /// Worker pool size: accounts syncing at the same time
    pub max_concurrent_accounts: usize,
    /// Messages fetched per classifier batch
    pub batch_size: usize,
    /// Attempts per external call before giving up
    pub max_retry_attempts: u32,
    /// Delay before each retry; the last value repeats
    pub retry_backoff_ms: Vec<u64>,
    pub max_history_page_size: usize,
    /// Pause between history pages
    pub history_page_delay_ms: u64,
    pub max_messages_per_fallback: usize,
    /// How far back the full-window fallback searches
    pub fallback_window_days: u32,
    pub min_parser_confidence: f32,
    /// Consecutive failed cycles before the account cools down
    pub max_consecutive_errors: u32,
    pub cooldown_secs: u64,
    /// Quota units available per UTC day across all accounts
    pub daily_quota_units: u64,
    /// Minimum spacing between two provider calls
    pub min_call_spacing_ms: u64,
    /// Treat pending sales past their ship-by date as completed
    pub infer_completion_from_deadline: bool,
    /// Shared secret expected in `x-sync-secret` on scheduled triggers
    pub trigger_secret: Option<String>,
    /// SQLite database; defaults to `sales.sqlite` in the config directory
    pub database_path: Option<PathBuf>,
    pub listen_addr: String,
    /// Callback URL registered with Google for the consent flow
    pub oauth_redirect_uri: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 15 * 60,
            cycle_timeout_secs: 4 * 60,
            stale_lock_secs: 10 * 60,
            max_concurrent_accounts: 4,
            batch_size: 10,
            max_retry_attempts: 3,
            retry_backoff_ms: vec![500, 2_000, 5_000],
            max_history_page_size: 500,
            history_page_delay_ms: 100,
            max_messages_per_fallback: 200,
            fallback_window_days: 30,
            min_parser_confidence: 0.6,
            max_consecutive_errors: 5,
            cooldown_secs: 60 * 60,
            daily_quota_units: 1_000_000_000,
            min_call_spacing_ms: 20,
            infer_completion_from_deadline: true,
            trigger_secret: None,
            database_path: None,
            listen_addr: "127.0.0.1:8787".to_string(),
            oauth_redirect_uri: "http://127.0.0.1:8787/oauth/callback".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load `sync.json` if present, apply environment overrides, validate
    pub fn load() -> Result<Self> {
        let mut cfg = if config::config_exists(SYNC_CONFIG_FILE) {
            config::load_json(SYNC_CONFIG_FILE)?
        } else {
            Self::default()
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Override fields from `SALESYNC_<FIELD>` variables.
    ///
    /// `lookup` abstracts the environment so tests need not mutate it.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "SALESYNC_SYNC_INTERVAL_SECS", &mut self.sync_interval_secs)?;
        override_parsed(&lookup, "SALESYNC_CYCLE_TIMEOUT_SECS", &mut self.cycle_timeout_secs)?;
        override_parsed(&lookup, "SALESYNC_STALE_LOCK_SECS", &mut self.stale_lock_secs)?;
        override_parsed(
            &lookup,
            "SALESYNC_MAX_CONCURRENT_ACCOUNTS",
            &mut self.max_concurrent_accounts,
        )?;
        override_parsed(&lookup, "SALESYNC_BATCH_SIZE", &mut self.batch_size)?;
        override_parsed(&lookup, "SALESYNC_MAX_RETRY_ATTEMPTS", &mut self.max_retry_attempts)?;
        override_parsed(
            &lookup,
            "SALESYNC_MAX_HISTORY_PAGE_SIZE",
            &mut self.max_history_page_size,
        )?;
        override_parsed(
            &lookup,
            "SALESYNC_HISTORY_PAGE_DELAY_MS",
            &mut self.history_page_delay_ms,
        )?;
        override_parsed(
            &lookup,
            "SALESYNC_MAX_MESSAGES_PER_FALLBACK",
            &mut self.max_messages_per_fallback,
        )?;
        override_parsed(
            &lookup,
            "SALESYNC_FALLBACK_WINDOW_DAYS",
            &mut self.fallback_window_days,
        )?;
        override_parsed(
            &lookup,
            "SALESYNC_MIN_PARSER_CONFIDENCE",
            &mut self.min_parser_confidence,
        )?;
        override_parsed(
            &lookup,
            "SALESYNC_MAX_CONSECUTIVE_ERRORS",
            &mut self.max_consecutive_errors,
        )?;
        override_parsed(&lookup, "SALESYNC_COOLDOWN_SECS", &mut self.cooldown_secs)?;
        override_parsed(&lookup, "SALESYNC_DAILY_QUOTA_UNITS", &mut self.daily_quota_units)?;
        override_parsed(&lookup, "SALESYNC_MIN_CALL_SPACING_MS", &mut self.min_call_spacing_ms)?;
        override_parsed(
            &lookup,
            "SALESYNC_INFER_COMPLETION_FROM_DEADLINE",
            &mut self.infer_completion_from_deadline,
        )?;

        if let Some(raw) = lookup("SALESYNC_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = raw
                .split(',')
                .map(|part| part.trim().parse::<u64>())
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("Invalid SALESYNC_RETRY_BACKOFF_MS: {raw}"))?;
        }
        if let Some(secret) = lookup("SALESYNC_TRIGGER_SECRET") {
            self.trigger_secret = Some(secret);
        }
        if let Some(path) = lookup("SALESYNC_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(addr) = lookup("SALESYNC_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(uri) = lookup("SALESYNC_OAUTH_REDIRECT_URI") {
            self.oauth_redirect_uri = uri;
        }
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.max_concurrent_accounts == 0 {
            bail!("max_concurrent_accounts must be at least 1");
        }
        if self.max_retry_attempts == 0 {
            bail!("max_retry_attempts must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.min_parser_confidence) {
            bail!("min_parser_confidence must be within 0..=1");
        }
        if self.max_history_page_size == 0 || self.max_history_page_size > 500 {
            bail!("max_history_page_size must be within 1..=500");
        }
        Ok(())
    }

    /// Database location, falling back to the config directory
    pub fn resolved_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => config::config_path("sales.sqlite").context("Could not determine config directory"),
        }
    }

    pub fn sync_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sync_interval_secs as i64)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn stale_lock_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_lock_secs as i64)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    pub fn history_page_delay(&self) -> Duration {
        Duration::from_millis(self.history_page_delay_ms)
    }

    pub fn min_call_spacing(&self) -> Duration {
        Duration::from_millis(self.min_call_spacing_ms)
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .retry_backoff_ms
            .get(attempt as usize)
            .or(self.retry_backoff_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {key}={raw}: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_installed_credentials() {
        let json = r#"{
            "installed": {
                "client_id": "test-client-id.apps.googleusercontent.com",
                "client_secret": "test-secret",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;

        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "test-client-id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "test-secret");
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "web-id");
    }

    #[test]
    fn test_invalid_credentials_json() {
        assert!(GmailCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }

    #[test]
    fn test_defaults_are_valid() {
        SyncConfig::default().validate().unwrap();
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: SyncConfig = serde_json::from_str(r#"{ "batch_size": 25 }"#).unwrap();
        assert_eq!(cfg.batch_size, 25);
        assert_eq!(cfg.max_consecutive_errors, 5);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SALESYNC_BATCH_SIZE", "3"),
            ("SALESYNC_RETRY_BACKOFF_MS", "10, 20,40"),
            ("SALESYNC_TRIGGER_SECRET", "s3cret"),
            ("SALESYNC_INFER_COMPLETION_FROM_DEADLINE", "false"),
        ]);
        let mut cfg = SyncConfig::default();
        cfg.apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(cfg.batch_size, 3);
        assert_eq!(cfg.retry_backoff_ms, vec![10, 20, 40]);
        assert_eq!(cfg.trigger_secret.as_deref(), Some("s3cret"));
        assert!(!cfg.infer_completion_from_deadline);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut cfg = SyncConfig::default();
        let result = cfg.apply_env(|key| {
            (key == "SALESYNC_BATCH_SIZE").then(|| "lots".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let cfg = SyncConfig {
            max_concurrent_accounts: 0,
            ..SyncConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retry_delay_repeats_last() {
        let cfg = SyncConfig {
            retry_backoff_ms: vec![100, 300],
            ..SyncConfig::default()
        };
        assert_eq!(cfg.retry_delay(0), Duration::from_millis(100));
        assert_eq!(cfg.retry_delay(1), Duration::from_millis(300));
        assert_eq!(cfg.retry_delay(7), Duration::from_millis(300));
    }
}
