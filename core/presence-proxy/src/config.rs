//! Proxy configuration.
//!
//! Everything has a default, so running without a config file is the normal
//! case. The file only exists to point the proxy at a different socket name
//! or directory.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::{ProxyError, Result};

pub const CONFIG_ENV: &str = "PRESENCE_PROXY_CONFIG";
pub const RUNTIME_DIR_ENV: &str = "XDG_RUNTIME_DIR";

const DEFAULT_SOCKET_NAME: &str = "discord-ipc-0";
const DEFAULT_RELOCATED_NAME: &str = "discord-ipc-original";
const DEFAULT_MAX_BUFFERED_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// Overrides `$XDG_RUNTIME_DIR` when set.
    pub runtime_dir: Option<PathBuf>,
    pub socket_name: String,
    pub relocated_name: String,
    pub max_buffered_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            runtime_dir: None,
            socket_name: DEFAULT_SOCKET_NAME.to_string(),
            relocated_name: DEFAULT_RELOCATED_NAME.to_string(),
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
        }
    }
}

impl ProxyConfig {
    /// Loads the config file at `path`, or the default location when `None`.
    ///
    /// A missing file yields the defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path,
            None => match default_config_path() {
                Some(path) => path,
                None => return Ok(Self::default()),
            },
        };

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content =
            fs_err::read_to_string(&config_path).map_err(|source| ProxyError::ConfigRead {
                path: config_path.clone(),
                source,
            })?;
        let config: ProxyConfig =
            toml::from_str(&content).map_err(|err| ProxyError::ConfigMalformed {
                path: config_path.clone(),
                details: err.to_string(),
            })?;
        config.validate(&config_path)?;
        Ok(config)
    }

    /// Loads from `$PRESENCE_PROXY_CONFIG` if set, else the default location.
    pub fn from_env() -> Result<Self> {
        Self::load(env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    /// The directory both sockets live in.
    pub fn resolve_runtime_dir(&self) -> PathBuf {
        if let Some(dir) = &self.runtime_dir {
            return dir.clone();
        }
        match env::var_os(RUNTIME_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => fallback_runtime_dir(),
        }
    }

    fn validate(&self, path: &Path) -> Result<()> {
        for (field, name) in [
            ("socket_name", &self.socket_name),
            ("relocated_name", &self.relocated_name),
        ] {
            if !is_plain_file_name(name) {
                return Err(ProxyError::ConfigMalformed {
                    path: path.to_path_buf(),
                    details: format!("{} must be a plain file name, got {:?}", field, name),
                });
            }
        }
        if self.socket_name == self.relocated_name {
            return Err(ProxyError::ConfigMalformed {
                path: path.to_path_buf(),
                details: "socket_name and relocated_name must differ".to_string(),
            });
        }
        if self.max_buffered_bytes == 0 {
            return Err(ProxyError::ConfigMalformed {
                path: path.to_path_buf(),
                details: "max_buffered_bytes must be positive".to_string(),
            });
        }
        Ok(())
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("presence-proxy").join("config.toml"))
}

fn fallback_runtime_dir() -> PathBuf {
    // SAFETY: getuid has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    PathBuf::from("/run/user").join(uid.to_string())
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/') && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_defaults_when_file_missing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("missing.toml");
        let config = ProxyConfig::load(Some(path)).expect("load config");
        assert_eq!(config, ProxyConfig::default());
        assert_eq!(config.socket_name, "discord-ipc-0");
        assert_eq!(config.relocated_name, "discord-ipc-original");
    }

    #[test]
    fn load_parses_overrides() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            r#"
runtime_dir = "/tmp/presence-runtime"
socket_name = "discord-ipc-1"
max_buffered_bytes = 4096
"#,
        )
        .expect("write config");

        let config = ProxyConfig::load(Some(path)).expect("load config");
        assert_eq!(
            config.runtime_dir.as_deref(),
            Some(Path::new("/tmp/presence-runtime"))
        );
        assert_eq!(config.socket_name, "discord-ipc-1");
        assert_eq!(config.relocated_name, "discord-ipc-original");
        assert_eq!(config.max_buffered_bytes, 4096);
        assert_eq!(
            config.resolve_runtime_dir(),
            PathBuf::from("/tmp/presence-runtime")
        );
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "sokcet_name = \"typo\"\n").expect("write config");

        let err = ProxyConfig::load(Some(path)).expect_err("should reject");
        assert!(matches!(err, ProxyError::ConfigMalformed { .. }));
    }

    #[test]
    fn load_rejects_socket_names_with_separators() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "relocated_name = \"../elsewhere\"\n").expect("write config");

        let err = ProxyConfig::load(Some(path)).expect_err("should reject");
        assert!(matches!(err, ProxyError::ConfigMalformed { .. }));
    }

    #[test]
    fn load_rejects_identical_names() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(
            &path,
            "socket_name = \"same\"\nrelocated_name = \"same\"\n",
        )
        .expect("write config");

        assert!(ProxyConfig::load(Some(path)).is_err());
    }

    #[test]
    fn load_rejects_zero_buffer_cap() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let path = temp_dir.path().join("config.toml");
        fs_err::write(&path, "max_buffered_bytes = 0\n").expect("write config");

        let err = ProxyConfig::load(Some(path)).expect_err("should reject");
        assert!(matches!(err, ProxyError::ConfigMalformed { .. }));
    }

    #[test]
    fn socket_paths_are_siblings_in_runtime_dir() {
        let config = ProxyConfig {
            runtime_dir: Some(PathBuf::from("/tmp/presence-runtime")),
            ..ProxyConfig::default()
        };
        let paths = crate::hijack::SocketPaths::from_config(&config);
        assert_eq!(
            paths.canonical,
            PathBuf::from("/tmp/presence-runtime/discord-ipc-0")
        );
        assert_eq!(
            paths.relocated,
            PathBuf::from("/tmp/presence-runtime/discord-ipc-original")
        );
    }
}
