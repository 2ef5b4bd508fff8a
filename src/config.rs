use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_EXPIRY_TIME_SECS: u64 = 600;
pub const DEFAULT_INTERVAL_TIME_SECS: u64 = 60;
pub const EXPIRY_TIME_PROPERTY_NAME: &str = "SPIRIT_EXPIRY_TIME";
pub const INTERVAL_TIME_PROPERTY_NAME: &str = "SPIRIT_INTERVAL_TIME";
pub const STDIN_ENCODING_PROPERTY_NAME: &str = "dstore.stdin.encoding";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub files_root: PathBuf,
    pub default_shell: String,
    pub log_level: String,
    pub spirit_on: bool,
    pub spirit_expiry: Duration,
    pub spirit_interval: Duration,
    /// Charset of the process tracker's sub-shell I/O.
    pub stdin_encoding: Option<String>,
    /// Encoding reported by `C_SYSTEM_ENCODING`.
    pub system_encoding: String,
    pub mem_log_file: Option<PathBuf>,
    pub mem_log_max_size_bytes: u64,
}

fn expand_tilde(path_str: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(shellexpand::tilde(path_str).as_ref()))
}

/// Reads a seconds value, falling back to the default when unset or invalid.
fn seconds_from_env(name: &str, default_secs: u64) -> Duration {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => match raw.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(_) => {
                warn!(property = %name, value = %raw, "Invalid spirit time property, using default");
                Duration::from_secs(default_secs)
            }
        },
        _ => Duration::from_secs(default_secs),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let files_root = match std::env::var("FILES_ROOT") {
            Ok(raw) if !raw.is_empty() => expand_tilde(&raw)?,
            _ => std::env::current_dir().context("Failed to read current directory")?,
        };
        let files_root = dunce::canonicalize(&files_root)
            .context(format!("Failed to canonicalize FILES_ROOT: {}", files_root.display()))?;
        if !files_root.is_dir() {
            anyhow::bail!("FILES_ROOT is not a valid directory: {:?}", files_root);
        }

        let host = std::env::var("DSTORE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = std::env::var("DSTORE_PORT")
            .unwrap_or_else(|_| "4075".to_string())
            .parse::<u16>()
            .context("Invalid DSTORE_PORT")?;

        let default_shell = std::env::var("DEFAULT_SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "sh".to_string());

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let spirit_on = match std::env::var("DSTORE_SPIRIT_ON") {
            Ok(raw) => parse_bool(&raw).context(format!("Invalid DSTORE_SPIRIT_ON: {}", raw))?,
            Err(_) => true,
        };

        let spirit_expiry = seconds_from_env(EXPIRY_TIME_PROPERTY_NAME, DEFAULT_EXPIRY_TIME_SECS);
        let spirit_interval = seconds_from_env(INTERVAL_TIME_PROPERTY_NAME, DEFAULT_INTERVAL_TIME_SECS);

        let stdin_encoding = std::env::var(STDIN_ENCODING_PROPERTY_NAME)
            .or_else(|_| std::env::var("DSTORE_STDIN_ENCODING"))
            .ok()
            .filter(|s| !s.is_empty());

        let system_encoding = std::env::var("DSTORE_ENCODING").unwrap_or_else(|_| "UTF-8".to_string());

        let mem_log_file = std::env::var("DSTORE_MEMLOG_FILE")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| expand_tilde(&s))
            .transpose()?;
        let mem_log_max_size_bytes = std::env::var("DSTORE_MEMLOG_MAX_SIZE_MB")
            .unwrap_or_else(|_| "10".to_string()) // Default 10 MB
            .parse::<u64>()
            .map(|mb| mb * 1024 * 1024)
            .unwrap_or(10 * 1024 * 1024);

        Ok(Config {
            host,
            port,
            files_root,
            default_shell,
            log_level,
            spirit_on,
            spirit_expiry,
            spirit_interval,
            stdin_encoding,
            system_encoding,
            mem_log_file,
            mem_log_max_size_bytes,
        })
    }

    /// Defaults rooted at `files_root`, without reading the environment.
    pub fn for_root(files_root: impl AsRef<Path>) -> Self {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            files_root: files_root.as_ref().to_path_buf(),
            default_shell: "sh".to_string(),
            log_level: "info".to_string(),
            spirit_on: true,
            spirit_expiry: Duration::from_secs(DEFAULT_EXPIRY_TIME_SECS),
            spirit_interval: Duration::from_secs(DEFAULT_INTERVAL_TIME_SECS),
            stdin_encoding: None,
            system_encoding: "UTF-8".to_string(),
            mem_log_file: None,
            mem_log_max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_paths_expand_the_home_directory() {
        assert_eq!(expand_tilde("/var/log/dstore.log").unwrap(), PathBuf::from("/var/log/dstore.log"));
        let expanded = expand_tilde("~/dstore.log").unwrap();
        if std::env::var_os("HOME").is_some_and(|h| !h.is_empty()) {
            assert!(!expanded.starts_with("~"));
            assert!(expanded.ends_with("dstore.log"));
        }
    }

    #[test]
    fn invalid_spirit_time_falls_back_to_default() {
        std::env::set_var("DSTORE_TEST_BAD_EXPIRY", "soon");
        assert_eq!(
            seconds_from_env("DSTORE_TEST_BAD_EXPIRY", DEFAULT_EXPIRY_TIME_SECS),
            Duration::from_secs(600)
        );
        std::env::set_var("DSTORE_TEST_GOOD_INTERVAL", "5");
        assert_eq!(
            seconds_from_env("DSTORE_TEST_GOOD_INTERVAL", DEFAULT_INTERVAL_TIME_SECS),
            Duration::from_secs(5)
        );
        assert_eq!(
            seconds_from_env("DSTORE_TEST_UNSET_INTERVAL", DEFAULT_INTERVAL_TIME_SECS),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn bool_flags() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn root_defaults() {
        let config = Config::for_root("/srv");
        assert_eq!(config.spirit_expiry, Duration::from_secs(DEFAULT_EXPIRY_TIME_SECS));
        assert_eq!(config.spirit_interval, Duration::from_secs(DEFAULT_INTERVAL_TIME_SECS));
        assert!(config.spirit_on);
    }
}
