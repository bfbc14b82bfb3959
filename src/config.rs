//! Configuration for ntty.
//!
//! Settings are read from `~/.ntty/config.toml`:
//!
//! ```toml
//! [tty]
//! poll_interval_ms = 10
//! pipe_capacity = 65536
//! ctrl_c_slop_ms = 50
//! ioctl_timeout_ms = 5000
//!
//! [console]
//! charset = "utf-8"      # or "latin1"
//! title = "ntty"
//! mouse = true
//! cols = 80              # size of the in-memory console when no real one exists
//! rows = 24
//!
//! [log]
//! level = "info"
//! file = "~/.ntty/ntty.log"
//! ```
//!
//! A missing file, or one that does not parse, gives the defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::console::state::Charset;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub tty: TtyConfig,
    pub console: ConsoleConfig,
    pub log: LogConfig,
}

/// Terminal timing and buffer sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtyConfig {
    /// How often the output pump looks at the slave's output pipe
    pub poll_interval_ms: u64,
    pub pipe_capacity: usize,
    /// Repeated Ctrl-C inside this window is dropped
    pub ctrl_c_slop_ms: u64,
    /// How long a slave waits for the master to serve an ioctl
    pub ioctl_timeout_ms: u64,
}

impl Default for TtyConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            pipe_capacity: 65536,
            ctrl_c_slop_ms: 50,
            ioctl_timeout_ms: 5000,
        }
    }
}

impl TtyConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn ctrl_c_slop(&self) -> Duration {
        Duration::from_millis(self.ctrl_c_slop_ms)
    }

    pub fn ioctl_timeout(&self) -> Duration {
        Duration::from_millis(self.ioctl_timeout_ms)
    }
}

/// Console settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    pub charset: String,
    pub title: String,
    pub mouse: bool,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            charset: "utf-8".to_string(),
            title: "ntty".to_string(),
            mouse: true,
            cols: 80,
            rows: 24,
        }
    }
}

impl ConsoleConfig {
    /// The configured charset; unknown names fall back to UTF-8.
    pub fn charset(&self) -> Charset {
        self.charset.parse().unwrap_or_else(|_| {
            warn!("unknown charset {:?}, using utf-8", self.charset);
            Charset::Utf8
        })
    }
}

/// Log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Log file; empty means `~/.ntty/ntty.log`
    pub file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: String::new(),
        }
    }
}

impl LogConfig {
    pub fn path(&self) -> Option<PathBuf> {
        if self.file.is_empty() {
            return config_dir().map(|d| d.join("ntty.log"));
        }
        match self.file.strip_prefix("~/") {
            Some(rest) => home_dir().map(|h| h.join(rest)),
            None => Some(PathBuf::from(&self.file)),
        }
    }
}

impl Config {
    /// Load configuration from `~/.ntty/config.toml`
    pub fn load() -> Self {
        match Self::get_config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load configuration from `path`
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                warn!("{}: {}; using defaults", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                warn!("{}: {}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), String> {
        let path = Self::get_config_path().ok_or_else(|| "Could not determine config path".to_string())?;
        let content = toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.toml"))
    }
}

fn config_dir() -> Option<PathBuf> {
    let dir = home_dir()?.join(".ntty");
    if !dir.exists() {
        let _ = fs::create_dir_all(&dir);
    }
    Some(dir)
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse("[tty]\npoll_interval_ms = 25\n").unwrap();
        assert_eq!(config.tty.poll_interval(), Duration::from_millis(25));
        assert_eq!(config.tty.pipe_capacity, 65536);
        assert_eq!(config.console, ConsoleConfig::default());
    }

    #[test]
    fn test_bad_file_is_rejected() {
        assert!(Config::parse("[tty]\npoll_interval_ms = \"soon\"\n").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/ntty/config.toml"));
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = Config::default();
        config.console.charset = "latin1".to_string();
        let text = toml::to_string_pretty(&config).unwrap();
        let back = Config::parse(&text).unwrap();
        assert_eq!(back.console.charset(), Charset::Latin1);
    }

    #[test]
    fn test_unknown_charset_falls_back() {
        let mut console = ConsoleConfig::default();
        console.charset = "ebcdic".to_string();
        assert_eq!(console.charset(), Charset::Utf8);
    }

    #[test]
    fn test_log_path_expands_home() {
        let log = LogConfig { level: "debug".to_string(), file: "/tmp/ntty.log".to_string() };
        assert_eq!(log.path(), Some(PathBuf::from("/tmp/ntty.log")));
    }
}
