//! Shared configuration for the trellis host tool and its apps.
//!
//! [`Config`] is layered by `ortho_config`: built-in defaults, then a
//! configuration file, then `TRELLIS_*` environment variables, then command
//! line flags. The [`apps`] module models the TOML files listing installed
//! apps.

pub mod apps;
mod defaults;
mod logging;
mod socket;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::{Deserialize, Serialize};

pub use self::apps::{APPS_FILE_NAME, AppEntry, AppsFile, AppsFileError, merge_unique};
pub use self::defaults::{
    DEFAULT_LOG_FILTER, REATTACH_CACHE_FILE, TRELLIS_HOME_DIR, default_apps_dir,
    default_log_filter, default_log_filter_string, default_log_format,
};
pub use self::logging::{LogFormat, LogFormatParseError};
pub use self::socket::{SocketEndpoint, SocketParseError, SocketPreparationError};

/// Runtime configuration for the `trellis` binary.
#[derive(Debug, Clone, Deserialize, Serialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "TRELLIS")]
pub struct Config {
    /// Root directory for cloned apps, the global apps file and the
    /// reattachment cache.
    #[ortho_config(default = default_apps_dir())]
    pub apps_dir: Utf8PathBuf,
    /// Filter expression handed to the tracing subscriber.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Output format for log records.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Runs app subprocesses with verbose logging.
    #[ortho_config(default = false)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            apps_dir: default_apps_dir(),
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            debug: false,
        }
    }
}

impl Config {
    /// Directory holding cloned apps and the global apps file.
    #[must_use]
    pub fn apps_dir(&self) -> &Utf8Path {
        self.apps_dir.as_path()
    }

    /// Filter expression for the tracing subscriber.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log record format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Whether app subprocesses should log verbosely.
    #[must_use]
    pub const fn debug(&self) -> bool {
        self.debug
    }

    /// Location of the reattachment cache shared by every invocation.
    #[must_use]
    pub fn reattach_cache_path(&self) -> Utf8PathBuf {
        self.apps_dir.join(REATTACH_CACHE_FILE)
    }

    /// Location of the apps file shared by every project.
    #[must_use]
    pub fn global_apps_file(&self) -> Utf8PathBuf {
        self.apps_dir.join(APPS_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_lives_in_apps_dir() {
        let config = Config {
            apps_dir: Utf8PathBuf::from("/srv/trellis/apps"),
            ..Config::default()
        };
        assert_eq!(
            config.reattach_cache_path(),
            Utf8PathBuf::from("/srv/trellis/apps/trellis_app_cache.json")
        );
        assert_eq!(
            config.global_apps_file(),
            Utf8PathBuf::from("/srv/trellis/apps/trellis-apps.toml")
        );
    }

    #[test]
    fn defaults_are_quiet_and_compact() {
        let config = Config::default();
        assert_eq!(config.log_filter(), DEFAULT_LOG_FILTER);
        assert_eq!(config.log_format(), LogFormat::Compact);
        assert!(!config.debug());
        assert!(config.apps_dir().ends_with("apps"));
    }
}
