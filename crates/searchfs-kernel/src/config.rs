//! Server configuration.
//!
//! Defaults, overlaid by a TOML file, overlaid by command-line flags (the
//! binaries apply the last layer).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::vfs::path::NamespaceLayout;

/// Default SFTP listen port.
pub const DEFAULT_PORT: u16 = 9999;

/// Default config file location, tilde-expanded at load time.
pub const DEFAULT_CONFIG_PATH: &str = "~/.config/searchfs/server.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{0}")]
    Invalid(String),
}

/// SFTP server and housekeeping settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Backing instances: SQLite database paths.
    pub instances: Vec<String>,
    /// Unix user whose permissions frame file access.
    pub unix_username: Option<String>,
    /// OpenSSH private key; an ephemeral key is generated when unset.
    pub host_key: Option<String>,
    pub passphrase: Option<String>,
    /// Real directory masked by every search directory.
    pub base_dir: String,
    pub port: u16,
    pub bind_address: String,
    pub default_expiration_days: u32,
    pub start_user_fuse: bool,
    /// Root under which `home/<login>/rql_download/<instance>` mounts live.
    pub fuse_mount_base: String,
    pub fuse_binary: String,
    pub cleanup_interval_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            instances: Vec::new(),
            unix_username: None,
            host_key: None,
            passphrase: None,
            base_dir: "/".into(),
            port: DEFAULT_PORT,
            bind_address: "127.0.0.1".into(),
            default_expiration_days: 30,
            start_user_fuse: false,
            fuse_mount_base: "/var/lib/searchfs".into(),
            fuse_binary: "searchfs-fuse".into(),
            cleanup_interval_secs: 12 * 60 * 60,
            reap_interval_secs: 60,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load a TOML file. A missing file yields the defaults.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let path = expand(path);
        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    /// Check the settings the server cannot start without.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instances.is_empty() {
            return Err(ConfigError::Invalid("no backing instance configured".into()));
        }
        if !self.base_dir.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "base_dir must be absolute: {}",
                self.base_dir
            )));
        }
        if self.cleanup_interval_secs == 0 || self.reap_interval_secs == 0 {
            return Err(ConfigError::Invalid("intervals must be positive".into()));
        }
        Ok(())
    }

    /// Instance paths with `~` expanded.
    pub fn instance_paths(&self) -> Vec<PathBuf> {
        self.instances.iter().map(|i| expand(i)).collect()
    }

    /// Namespace names of the instances, in configuration order.
    pub fn instance_names(&self) -> Vec<String> {
        self.instances
            .iter()
            .enumerate()
            .map(|(i, path)| instance_display_name(i, path))
            .collect()
    }

    /// One instance is served at the root; several get a directory each.
    pub fn layout(&self) -> NamespaceLayout {
        if self.instances.len() > 1 {
            NamespaceLayout::Multi {
                instances: self.instance_names(),
            }
        } else {
            NamespaceLayout::Single
        }
    }
}

/// Split a colon-separated instance list, dropping empty items.
pub fn parse_instance_list(value: &str) -> Vec<String> {
    value
        .split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// `<n>_<file stem>`, 1-based.
pub fn instance_display_name(index: usize, path: &str) -> String {
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_owned());
    format!("{}_{}", index + 1, stem)
}

/// Tilde-expand a path.
pub fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}
