// # Server Options
//
// The configuration surface of the storage and replication core, with
// declarative validation: every violation names the offending field and
// carries a rendered message. CLI parsing lives in the server binary;
// the library never reads the environment.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FerriteError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerOptions {
    pub port: u16,
    pub bind: String,
    pub checkpoint_dir: PathBuf,
    pub log_dir: PathBuf,

    pub enable_aof: bool,
    /// 0 commits on every write; -1 disables scheduled commits.
    pub commit_frequency_ms: i64,
    pub aof_memory_size: usize,
    pub main_memory_replication: bool,
    pub fast_commit: bool,
    pub on_demand_checkpoint: bool,
    pub enable_incremental_snapshots: bool,

    /// Bytes of in-memory log ring per store.
    pub memory_size: usize,
    pub page_size: usize,
    pub segment_size: u64,
    pub index_size: usize,

    pub cluster: bool,
    pub cluster_timeout: Duration,
    pub gossip_delay: Duration,

    pub tls: bool,
    pub cert_file: Option<PathBuf>,
    pub cert_password: Option<String>,
    pub auth_username: Option<String>,
    pub auth_password: Option<String>,
    pub acl_file: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            port: 6379,
            bind: "127.0.0.1".to_string(),
            checkpoint_dir: PathBuf::from("./data/checkpoints"),
            log_dir: PathBuf::from("./data/log"),
            enable_aof: true,
            commit_frequency_ms: 0,
            aof_memory_size: 16 << 20,
            main_memory_replication: false,
            fast_commit: false,
            on_demand_checkpoint: false,
            enable_incremental_snapshots: false,
            memory_size: 64 << 20,
            page_size: 1 << 22,
            segment_size: 1 << 26,
            index_size: 1 << 16,
            cluster: false,
            cluster_timeout: Duration::from_secs(60),
            gossip_delay: Duration::from_secs(5),
            tls: false,
            cert_file: None,
            cert_password: None,
            auth_username: None,
            auth_password: None,
            acl_file: None,
        }
    }
}

/// One failed validation rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigViolation {
    pub field: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl ServerOptions {
    /// Every violated rule, empty when the options are usable.
    pub fn violations(&self) -> Vec<ConfigViolation> {
        let mut out = Vec::new();
        let mut fail = |field: &'static str, message: String| {
            out.push(ConfigViolation { field, message });
        };

        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            fail(
                "page-size",
                format!("{} must be a power of two of at least 512", self.page_size),
            );
        }
        if self.memory_size < self.page_size * 2 {
            fail(
                "memory-size",
                format!(
                    "{} must hold at least two pages of {}",
                    self.memory_size, self.page_size
                ),
            );
        }
        if !self.index_size.is_power_of_two() {
            fail(
                "index-size",
                format!("{} must be a power of two", self.index_size),
            );
        }
        if self.segment_size < self.page_size as u64 {
            fail(
                "segment-size",
                format!(
                    "{} must be at least the page size {}",
                    self.segment_size, self.page_size
                ),
            );
        }
        if self.enable_aof && self.aof_memory_size < (64 << 10) {
            fail(
                "aof-memory-size",
                format!("{} must be at least 64KiB", self.aof_memory_size),
            );
        }
        if self.commit_frequency_ms < -1 {
            fail(
                "commit-frequency-ms",
                format!("{} must be -1, 0, or positive", self.commit_frequency_ms),
            );
        }
        if self.tls && self.cert_file.is_none() {
            fail("cert-file", "required when --tls is enabled".to_string());
        }
        if self.auth_password.is_some() && self.auth_username.is_none() {
            fail(
                "auth-username",
                "required when --auth-password is set".to_string(),
            );
        }
        if self.bind.is_empty() {
            fail("bind", "must not be empty".to_string());
        }
        out
    }

    pub fn validate(&self) -> Result<()> {
        let violations = self.violations();
        if violations.is_empty() {
            return Ok(());
        }
        let rendered = violations
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Err(FerriteError::Configuration(rendered))
    }

    // -- derived geometry ---------------------------------------------------

    pub fn page_bits(&self) -> u32 {
        self.page_size.trailing_zeros()
    }

    /// Frames in each store's in-memory ring.
    pub fn memory_pages(&self) -> usize {
        (self.memory_size / self.page_size).max(2)
    }

    pub fn aof_page_bits(&self) -> u32 {
        16
    }

    pub fn aof_memory_pages(&self) -> usize {
        (self.aof_memory_size >> self.aof_page_bits()).max(4)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.checkpoint_dir.join("Store").join("checkpoints")
    }

    pub fn object_store_dir(&self) -> PathBuf {
        self.checkpoint_dir.join("ObjectStore").join("checkpoints")
    }

    pub fn cluster_dir(&self) -> PathBuf {
        self.checkpoint_dir.join("cluster")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ServerOptions::default().validate().is_ok());
    }

    #[test]
    fn violations_name_the_field() {
        let mut options = ServerOptions::default();
        options.page_size = 1000;
        options.tls = true;
        let violations = options.violations();
        let fields: Vec<&str> = violations.iter().map(|v| v.field).collect();
        assert!(fields.contains(&"page-size"));
        assert!(fields.contains(&"cert-file"));
        assert!(options.validate().is_err());
    }

    #[test]
    fn derived_geometry() {
        let mut options = ServerOptions::default();
        options.page_size = 4096;
        options.memory_size = 4096 * 8;
        assert_eq!(options.page_bits(), 12);
        assert_eq!(options.memory_pages(), 8);
    }
}
