//! Storage configuration and path management for flowd.
//!
//! `StorageConfig` is the one place that decides where flows, the journal,
//! the socket and logs live. Tests inject a temp root with
//! [`StorageConfig::with_root`].

use std::path::{Path, PathBuf};

/// Environment override for the storage root.
pub const HOME_ENV: &str = "FLOWD_HOME";

/// Environment override for the daemon socket.
pub const SOCKET_ENV: &str = "FLOWD_SOCKET";

/// Central configuration for all flowd storage paths.
///
/// Production code uses `StorageConfig::default()`, which honors `FLOWD_HOME`
/// and otherwise points to `~/.flowd/`.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Self::with_root(PathBuf::from(root));
        }
        let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
        Self::with_root(home.join(".flowd"))
    }
}

impl StorageConfig {
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Directories
    // ─────────────────────────────────────────────────────────────────────────────

    /// One `<slug>.flow.json` per trigger.
    pub fn flows_dir(&self) -> PathBuf {
        self.root.join("flows")
    }

    pub fn daemon_dir(&self) -> PathBuf {
        self.root.join("daemon")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Daemon Files
    // ─────────────────────────────────────────────────────────────────────────────

    /// SQLite journal holding durable execution histories.
    pub fn journal_db(&self) -> PathBuf {
        self.daemon_dir().join("journal.db")
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon_dir().join("flowd.sock")
    }

    /// `FLOWD_SOCKET` when set, otherwise [`StorageConfig::socket_path`].
    pub fn resolve_socket_path(&self) -> PathBuf {
        std::env::var_os(SOCKET_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.socket_path())
    }

    pub fn settings_file(&self) -> PathBuf {
        self.daemon_dir().join("settings.toml")
    }

    /// Ensures the root and standard subdirectories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs_err::create_dir_all(self.flows_dir())?;
        fs_err::create_dir_all(self.daemon_dir())?;
        fs_err::create_dir_all(self.logs_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn paths_hang_off_root() {
        let temp = TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().to_path_buf());
        assert_eq!(storage.flows_dir(), temp.path().join("flows"));
        assert_eq!(
            storage.journal_db(),
            temp.path().join("daemon").join("journal.db")
        );
        assert_eq!(
            storage.socket_path(),
            temp.path().join("daemon").join("flowd.sock")
        );
        assert_eq!(
            storage.settings_file(),
            temp.path().join("daemon").join("settings.toml")
        );
    }

    #[test]
    fn ensure_dirs_creates_layout() {
        let temp = TempDir::new().unwrap();
        let storage = StorageConfig::with_root(temp.path().join("root"));
        storage.ensure_dirs().unwrap();
        assert!(storage.flows_dir().is_dir());
        assert!(storage.daemon_dir().is_dir());
        assert!(storage.logs_dir().is_dir());
    }
}
