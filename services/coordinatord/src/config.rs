//! Coordinator configuration loading.
//!
//! TOML is the sole config source, with defaults for every field so a
//! missing file (or a sparse one) still produces a runnable config — a
//! raw-with-`Option`s struct resolved into a defaults-filled one.
//!
//! Default config path: `./coordinatord.toml`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },
    #[error("invalid semaphore regex {pattern:?}: {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub trusted_stream_bind: String,
    pub status_bind: String,
    pub udp_trusted_bind: String,
    pub udp_untrusted_bind: String,
    pub semaphore_dir: PathBuf,
    pub semaphore_regex: String,
    pub store_path: PathBuf,
    pub sync_window_lo_minutes: f64,
    pub sync_window_hi_minutes: f64,
    pub ssh: SshConfig,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub identity_file: PathBuf,
    pub control_path_template: String,
    pub remote_user: String,
    pub remote_sync_dir: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    trusted_stream_bind: Option<String>,
    status_bind: Option<String>,
    udp_trusted_bind: Option<String>,
    udp_untrusted_bind: Option<String>,
    semaphore_dir: Option<String>,
    semaphore_regex: Option<String>,
    store_path: Option<String>,
    sync_window_lo_minutes: Option<f64>,
    sync_window_hi_minutes: Option<f64>,
    ssh: Option<RawSshConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSshConfig {
    identity_file: Option<String>,
    control_path_template: Option<String>,
    remote_user: Option<String>,
    remote_sync_dir: Option<String>,
}

impl Config {
    /// Loads config from `path`, falling back to compiled-in defaults for
    /// any field the file omits. A missing file is treated as an empty
    /// config (all defaults), while still letting an operator override
    /// any of them.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str::<RawConfig>(&text).map_err(|source| ConfigError::Parse {
                path: path.to_owned(),
                source: Box::new(source),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RawConfig::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_owned(),
                    source,
                })
            }
        };
        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Result<Self, ConfigError> {
        let semaphore_regex = raw
            .semaphore_regex
            .unwrap_or_else(|| DEFAULT_SEMAPHORE_REGEX.to_owned());
        // Validated eagerly so a bad pattern is a config-time error, not a
        // silent "never matches anything" at watcher startup.
        regex::Regex::new(&semaphore_regex).map_err(|source| ConfigError::BadRegex {
            pattern: semaphore_regex.clone(),
            source,
        })?;

        let ssh = raw.ssh.unwrap_or_default();
        Ok(Config {
            trusted_stream_bind: raw
                .trusted_stream_bind
                .unwrap_or_else(|| "127.0.0.1:59054".to_owned()),
            status_bind: raw.status_bind.unwrap_or_else(|| "127.0.0.1:59055".to_owned()),
            udp_trusted_bind: raw
                .udp_trusted_bind
                .unwrap_or_else(|| "0.0.0.0:59053".to_owned()),
            udp_untrusted_bind: raw
                .udp_untrusted_bind
                .unwrap_or_else(|| "0.0.0.0:59052".to_owned()),
            semaphore_dir: raw
                .semaphore_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/dev/shm")),
            semaphore_regex,
            store_path: raw
                .store_path
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sgm.sqlite3")),
            sync_window_lo_minutes: raw.sync_window_lo_minutes.unwrap_or(30.0),
            sync_window_hi_minutes: raw.sync_window_hi_minutes.unwrap_or(90.0),
            ssh: SshConfig {
                identity_file: ssh
                    .identity_file
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/etc/sgm/tunnel_identity")),
                control_path_template: ssh
                    .control_path_template
                    .unwrap_or_else(|| "/tmp/sgm-ctrl-%h-%p-%r".to_owned()),
                remote_user: ssh.remote_user.unwrap_or_else(|| "sgm".to_owned()),
                remote_sync_dir: ssh
                    .remote_sync_dir
                    .unwrap_or_else(|| "/sgm_local/sync".to_owned()),
            },
        })
    }
}

/// First capture group is the Serno.
pub const DEFAULT_SEMAPHORE_REGEX: &str = r"^sem\.(SG-[0-9A-Za-z]{12})$";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/coordinatord.toml")).unwrap();
        assert_eq!(cfg.trusted_stream_bind, "127.0.0.1:59054");
        assert_eq!(cfg.sync_window_lo_minutes, 30.0);
        assert_eq!(cfg.sync_window_hi_minutes, 90.0);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinatord.toml");
        std::fs::write(&path, "sync_window_lo_minutes = 0.01\nsync_window_hi_minutes = 0.01\n")
            .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.sync_window_lo_minutes, 0.01);
        assert_eq!(cfg.status_bind, "127.0.0.1:59055");
    }

    #[test]
    fn bad_regex_is_rejected_at_load_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinatord.toml");
        std::fs::write(&path, "semaphore_regex = \"(unterminated\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
