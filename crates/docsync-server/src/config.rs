use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

/// Backing store for the distributed lock.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStoreKind {
    /// In-process map. Locks only exclude within this instance.
    Memory,
    /// Shared directory. Locks exclude across every instance using it.
    File,
}

/// Configuration for the docsync-server.
#[derive(Parser, Debug, Clone)]
#[command(name = "docsync-server")]
#[command(about = "WebSocket sync server for collaborative documents")]
pub struct Config {
    /// TCP host to bind to
    #[arg(long, default_value = "0.0.0.0", env = "SYNC_HOST")]
    pub host: String,

    /// TCP port to bind to
    #[arg(long, default_value = "3010", env = "SYNC_PORT")]
    pub port: u16,

    /// Lock store backend
    #[arg(long, value_enum, default_value = "memory", env = "LOCK_STORE")]
    pub lock_store: LockStoreKind,

    /// Directory shared by all instances when using the file lock store
    /// (defaults to <data-dir>/locks)
    #[arg(long, env = "LOCK_DIR")]
    pub lock_dir: Option<PathBuf>,

    /// Directory for persisted documents
    /// (defaults to the platform local data directory + /docsync)
    #[arg(long, env = "DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Lock TTL in seconds
    #[arg(
        long,
        default_value = "30",
        env = "LOCK_TTL_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub lock_ttl_secs: u64,

    /// Maximum time to wait for a document lock (milliseconds)
    #[arg(long, default_value = "5000", env = "LOCK_MAX_WAIT_MS")]
    pub max_wait_ms: u64,

    /// Grace period for in-flight operations on shutdown (seconds)
    #[arg(long, default_value = "10", env = "SHUTDOWN_GRACE_SECS")]
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// Resolved document directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("docsync")
        })
    }

    /// Resolved lock directory.
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("locks"))
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["docsync-server"]).unwrap();
        assert_eq!(config.port, 3010);
        assert_eq!(config.lock_store, LockStoreKind::Memory);
        assert_eq!(config.max_wait(), Duration::from_millis(5000));
        assert_eq!(config.lock_ttl(), Duration::from_secs(30));
    }

    #[test]
    fn test_lock_dir_follows_data_dir() {
        let config = Config::try_parse_from([
            "docsync-server",
            "--lock-store",
            "file",
            "--data-dir",
            "/srv/docsync",
        ])
        .unwrap();
        assert_eq!(config.lock_store, LockStoreKind::File);
        assert_eq!(config.lock_dir(), PathBuf::from("/srv/docsync/locks"));
    }

    #[test]
    fn test_zero_lock_ttl_is_rejected() {
        let result = Config::try_parse_from(["docsync-server", "--lock-ttl-secs", "0"]);
        assert!(result.is_err());

        let config = Config::try_parse_from(["docsync-server", "--lock-ttl-secs", "1"]).unwrap();
        assert_eq!(config.lock_ttl(), Duration::from_secs(1));
    }
}
