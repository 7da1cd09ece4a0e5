// SPDX-FileCopyrightText: 2026 The zb Authors
// SPDX-License-Identifier: MIT

//! Daemon configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, ServerError};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Path to bind the daemon socket
    pub socket_path: PathBuf,

    /// Logical store directory, as seen in store paths (e.g. `/zb/store`)
    pub store_dir: PathBuf,

    /// Directory where store objects physically live. Usually equal to
    /// `store_dir`; differs when serving a store mounted elsewhere.
    pub real_store_dir: Option<PathBuf>,

    /// Path to the metadata database
    pub db_path: PathBuf,

    /// Directory for per-build log files
    pub log_dir: PathBuf,

    /// Parent directory for temporary build directories
    pub build_dir: PathBuf,

    /// Number of CPU cores advertised to builders (0 = all)
    pub cores: usize,

    /// Host paths a derivation may request via `__buildSystemDeps`
    pub sandbox_paths: Vec<PathBuf>,

    /// Unix UIDs used to run builders. Empty means builders run with the
    /// daemon's own credentials.
    pub build_users: Vec<u32>,

    /// Whether clients may keep failed build directories for inspection
    pub allow_keep_failed: bool,

    /// Log level filter (overridden by ZB_LOG)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/zb-daemon.sock"),
            store_dir: PathBuf::from("/zb/store"),
            real_store_dir: None,
            db_path: PathBuf::from("/zb/var/zb/db.sqlite"),
            log_dir: PathBuf::from("/zb/var/log/zb"),
            build_dir: PathBuf::from("/zb/var/zb/builds"),
            cores: 0,
            sandbox_paths: vec![PathBuf::from("/bin/sh"), PathBuf::from("/usr/bin/env")],
            build_users: Vec::new(),
            allow_keep_failed: true,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path)
            .io_context(|| format!("Failed to read config file at {}", path.display()))?;
        let config: Config =
            toml::from_str(&contents).map_err(|e| ServerError::InvalidParams(e.to_string()))?;
        Ok(config)
    }

    /// The physical directory holding store objects.
    pub fn real_store_dir(&self) -> &Path {
        self.real_store_dir.as_deref().unwrap_or(&self.store_dir)
    }

    /// Cores advertised to builders.
    pub fn effective_cores(&self) -> usize {
        if self.cores > 0 {
            self.cores
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.store_dir, PathBuf::from("/zb/store"));
        assert_eq!(config.real_store_dir(), Path::new("/zb/store"));
        assert!(config.effective_cores() >= 1);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            store_dir = "/tmp/test-store"
            build_users = [30001, 30002]
            "#,
        )
        .unwrap();
        assert_eq!(config.store_dir, PathBuf::from("/tmp/test-store"));
        assert_eq!(config.build_users, vec![30001, 30002]);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.log_level, "info");
    }
}
