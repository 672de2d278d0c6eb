//! Configuration for conterm sessions.
//!
//! Settings are read from `~/.conterm/config.toml`; missing or unreadable
//! files fall back to the defaults below.
//!
//! ```toml
//! # Command line to host
//! shell = "pwsh.exe"
//!
//! # Initial console size
//! columns = 120
//! rows = 40
//!
//! # Keep an in-memory transcript of all output
//! log_output = true
//!
//! # Bytes requested per read of the output pipe
//! read_buffer_size = 16384
//!
//! # How long `close` waits for the child before terminating it
//! exit_grace_ms = 500
//!
//! # Send "\n" in text input as "\r"
//! translate_newlines = false
//! ```
//!
//! `CONTERM_SHELL` overrides `shell`, and `CONTERM_PREVIEW=1` forces preview
//! mode, in which sessions never touch the OS.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::console::ConsoleSize;

/// Default read buffer size for the output loop.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 16 * 1024;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub shell: String,
    pub columns: u16,
    pub rows: u16,
    pub log_output: bool,
    pub read_buffer_size: usize,
    pub exit_grace_ms: u64,
    pub translate_newlines: bool,
    /// Design/preview mode: no console, no child, placeholder output only.
    pub preview: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: "cmd.exe".to_string(),
            columns: 80,
            rows: 30,
            log_output: false,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            exit_grace_ms: 500,
            translate_newlines: false,
            preview: false,
        }
    }
}

impl Config {
    /// Load configuration from file, then apply environment overrides.
    pub fn load() -> Self {
        let mut config = Self::get_config_path()
            .filter(|path| path.exists())
            .and_then(|path| fs::read_to_string(path).ok())
            .and_then(|content| Self::parse(&content).ok())
            .unwrap_or_default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), String> {
        let path = Self::get_config_path().ok_or("Could not determine config path")?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| format!("Failed to create config dir: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        fs::write(&path, content).map_err(|e| format!("Failed to write config: {}", e))?;
        Ok(())
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(shell) = var("CONTERM_SHELL").filter(|s| !s.trim().is_empty()) {
            self.shell = shell;
        }
        if let Some(preview) = var("CONTERM_PREVIEW") {
            self.preview = matches!(preview.trim(), "1" | "true" | "yes");
        }
    }

    /// Directory holding the config file and the log.
    pub fn data_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".conterm"))
    }

    fn get_config_path() -> Option<PathBuf> {
        Self::data_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn size(&self) -> ConsoleSize {
        ConsoleSize::new(self.columns, self.rows)
    }

    /// The per-session part of the configuration.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            read_buffer_size: self.read_buffer_size.max(1),
            exit_grace: Duration::from_millis(self.exit_grace_ms),
            translate_newlines: self.translate_newlines,
            preview: self.preview,
        }
    }
}

/// Options a [`TerminalSession`](crate::TerminalSession) is built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub read_buffer_size: usize,
    pub exit_grace: Duration,
    pub translate_newlines: bool,
    pub preview: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Config::default().session_options()
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}
