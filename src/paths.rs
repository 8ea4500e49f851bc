// On-disk layout under the user-data root (~/.duckcoding)
//
// All core state lives under one directory so backup/reset is a single
// rm -rf. Individual files are documented in the README; nothing outside
// this root is touched except the tools' own native config files.

use std::path::PathBuf;

/// Resolve the user-data root. `DUCKCODING_HOME` overrides for tests and
/// portable installs.
pub fn data_root() -> PathBuf {
    if let Ok(dir) = std::env::var("DUCKCODING_HOME") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".duckcoding")
}

pub fn profiles_file() -> PathBuf {
    data_root().join("profiles.json")
}

pub fn active_file() -> PathBuf {
    data_root().join("active.json")
}

pub fn proxy_file() -> PathBuf {
    data_root().join("proxy.json")
}

pub fn global_file() -> PathBuf {
    data_root().join("global.json")
}

pub fn pricing_file() -> PathBuf {
    data_root().join("pricing.json")
}

pub fn stats_db_file() -> PathBuf {
    data_root().join("stats.sqlite")
}

pub fn log_dir() -> PathBuf {
    data_root().join("logs")
}

/// DUCKCODING_HOME is process-global state; tests that repoint it at
/// scratch directories serialize on this lock.
#[cfg(test)]
pub(crate) static TEST_ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
