use std::env;

use camino::Utf8PathBuf;

use crate::logging::LogFormat;

/// Directory under the user's home holding trellis state.
pub const TRELLIS_HOME_DIR: &str = ".trellis";

/// Default log filter expression used by the host tool.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Name of the reattachment cache file kept in the apps directory.
pub const REATTACH_CACHE_FILE: &str = "trellis_app_cache.json";

/// Default log filter expression.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the host tool.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Compact
}

/// Computes `~/.trellis/apps`, falling back to the temp directory when no
/// home directory can be determined.
#[must_use]
pub fn default_apps_dir() -> Utf8PathBuf {
    let base = dirs::home_dir()
        .and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
        .unwrap_or_else(fallback_base_directory);
    base.join(TRELLIS_HOME_DIR).join("apps")
}

fn fallback_base_directory() -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(env::temp_dir()).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}
