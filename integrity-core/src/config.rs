//! Configuration for the integrity engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Log output format: "text" or "json"
    pub log_format: String,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Idempotency guard configuration
    pub idempotency: IdempotencyConfig,

    /// Maker-checker configuration
    pub governance: GovernanceConfig,

    /// Wallet journal configuration
    pub journal: JournalConfig,

    /// State machine configuration
    pub transitions: TransitionsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/integrity"),
            service_name: "integrity-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_format: "text".to_string(),
            rocksdb: RocksDBConfig::default(),
            idempotency: IdempotencyConfig::default(),
            governance: GovernanceConfig::default(),
            journal: JournalConfig::default(),
            transitions: TransitionsConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,

    /// How long a writer waits for a row lock before giving up (ms)
    pub lock_timeout_ms: i64,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_background_jobs: 4,
            enable_statistics: false,
            lock_timeout_ms: 5_000,
        }
    }
}

/// Idempotency guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// A job processing longer than this is reported as stuck
    pub stuck_after_secs: i64,

    /// Sweep period for the stuck-operation sweeper
    pub sweep_interval_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            stuck_after_secs: 300,    // 5 minutes
            sweep_interval_secs: 60,
        }
    }
}

/// Maker-checker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Approval requests left undecided this long expire
    pub approval_ttl_secs: i64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            approval_ttl_secs: 86_400, // 24 hours
        }
    }
}

/// Wallet journal configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Balance an ordinary debit must leave behind (minor units).
    /// The admin-override path may go down to zero.
    pub minimum_reserve_minor: i64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self { minimum_reserve_minor: 0 }
    }
}

/// State machine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionsConfig {
    /// TOML file with extra or replacement transition tables
    pub table_file: Option<PathBuf>,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("INTEGRITY_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(format) = std::env::var("INTEGRITY_LOG_FORMAT") {
            config.log_format = format;
        }

        if let Ok(secs) = std::env::var("INTEGRITY_STUCK_AFTER_SECS") {
            config.idempotency.stuck_after_secs = secs
                .parse()
                .map_err(|e| crate::Error::Config(format!("INTEGRITY_STUCK_AFTER_SECS: {}", e)))?;
        }

        if let Ok(secs) = std::env::var("INTEGRITY_APPROVAL_TTL_SECS") {
            config.governance.approval_ttl_secs = secs
                .parse()
                .map_err(|e| crate::Error::Config(format!("INTEGRITY_APPROVAL_TTL_SECS: {}", e)))?;
        }

        if let Ok(path) = std::env::var("INTEGRITY_TRANSITIONS_FILE") {
            config.transitions.table_file = Some(PathBuf::from(path));
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.idempotency.stuck_after_secs <= 0 {
            return Err(crate::Error::Config(
                "idempotency.stuck_after_secs must be positive".to_string(),
            ));
        }
        if self.idempotency.sweep_interval_secs == 0 {
            return Err(crate::Error::Config(
                "idempotency.sweep_interval_secs must be positive".to_string(),
            ));
        }
        if self.governance.approval_ttl_secs <= 0 {
            return Err(crate::Error::Config(
                "governance.approval_ttl_secs must be positive".to_string(),
            ));
        }
        if self.journal.minimum_reserve_minor < 0 {
            return Err(crate::Error::Config(
                "journal.minimum_reserve_minor cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "integrity-core");
        assert_eq!(config.idempotency.stuck_after_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            data_dir = "/var/lib/integrity"

            [journal]
            minimum_reserve_minor = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/integrity"));
        assert_eq!(config.journal.minimum_reserve_minor, 500);
        assert_eq!(config.governance.approval_ttl_secs, 86_400);
    }

    #[test]
    fn test_negative_reserve_rejected() {
        let mut config = Config::default();
        config.journal.minimum_reserve_minor = -1;
        assert!(config.validate().is_err());
    }
}
