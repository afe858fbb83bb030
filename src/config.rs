//! Configuration and shell resolution for ptyhost.
//!
//! This module provides:
//! - TOML configuration file loading from `~/.ptyhost/config.toml`
//! - Default shell resolution (PowerShell 7, then Windows PowerShell, then
//!   `cmd.exe` on Windows; `$SHELL`, then `bash`, then `/bin/sh` on Unix)
//! - Conversion to the runtime [`SessionOptions`]
//!
//! # Configuration File
//!
//! ```toml
//! # Shell to run (optional; resolved automatically when absent)
//! shell = "pwsh.exe"
//! args = ["-NoLogo"]
//!
//! # Starting directory (optional)
//! working_dir = "C:\\src"
//!
//! # Size used when the host terminal size is unknown
//! cols = 120
//! rows = 30
//!
//! # Engine tuning
//! read_buffer_size = 8192
//! exit_poll_interval_ms = 100
//! drain_timeout_ms = 2000
//!
//! # Log level for ~/.ptyhost/ptyhost.log (RUST_LOG takes precedence)
//! log_level = "info"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::process::ShellCommand;
use crate::core::pump::DEFAULT_BUFFER_SIZE;
use crate::core::session::SessionOptions;

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Shell program; resolved automatically when absent
    pub shell: Option<String>,
    /// Extra arguments for the shell
    pub args: Vec<String>,
    /// Starting directory
    pub working_dir: Option<PathBuf>,
    /// Fallback columns
    pub cols: u16,
    /// Fallback rows
    pub rows: u16,
    /// Output pump buffer size in bytes
    pub read_buffer_size: usize,
    /// How often the exit watcher re-checks for shutdown
    pub exit_poll_interval_ms: u64,
    /// How long exit handling waits for the last output
    pub drain_timeout_ms: u64,
    /// tracing level filter
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            args: Vec::new(),
            working_dir: None,
            cols: 80,
            rows: 24,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            exit_poll_interval_ms: 100,
            drain_timeout_ms: 2000,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load() -> Self {
        Self::get_config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    /// Load from a specific path; missing or invalid files give defaults
    pub fn load_from(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|content| Self::parse(&content).ok())
            .unwrap_or_default()
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), String> {
        let path = Self::get_config_path().ok_or_else(|| "Could not determine config path".to_string())?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), String> {
        let content = toml::to_string_pretty(self).map_err(|e| format!("Failed to serialize config: {}", e))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        }
        fs::write(path, content).map_err(|e| format!("Failed to write config: {}", e))
    }

    /// `~/.ptyhost`
    pub fn config_dir() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".ptyhost"))
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// The shell to run: the configured one, else the resolved default.
    pub fn shell_command(&self) -> ShellCommand {
        match &self.shell {
            Some(shell) => ShellCommand::new(shell).args(self.args.iter().cloned()),
            None => resolve_shell().args(self.args.iter().cloned()),
        }
    }

    /// Runtime options for a session.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            command: self.shell_command(),
            working_dir: self.working_dir.clone(),
            read_buffer_size: self.read_buffer_size.max(1),
            exit_poll_interval: Duration::from_millis(self.exit_poll_interval_ms.max(1)),
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }
}

/// Pick the default shell.
///
/// Prefers PowerShell 7 from its install locations, then from `PATH`, then
/// Windows PowerShell, and finally `cmd.exe`.
#[cfg(windows)]
pub fn resolve_shell() -> ShellCommand {
    let program_files = std::env::var_os("ProgramFiles").map(PathBuf::from);
    let installed = program_files.iter().flat_map(|base| {
        ["7", "7-preview"]
            .into_iter()
            .map(move |version| base.join("PowerShell").join(version).join("pwsh.exe"))
    });

    resolve_from(
        installed,
        &["pwsh.exe", "powershell.exe"],
        std::env::var_os("PATH").as_deref(),
    )
    .map(ShellCommand::new)
    .unwrap_or_else(|| {
        let comspec = std::env::var_os("COMSPEC")
            .map(PathBuf::from)
            .filter(|path| path.is_file())
            .unwrap_or_else(|| PathBuf::from("cmd.exe"));
        ShellCommand::new(comspec)
    })
}

/// Pick the default shell.
///
/// Prefers `$SHELL`, then `bash` from `PATH`, and finally `/bin/sh`.
#[cfg(unix)]
pub fn resolve_shell() -> ShellCommand {
    let from_env = std::env::var_os("SHELL").map(PathBuf::from);

    resolve_from(from_env, &["bash"], std::env::var_os("PATH").as_deref())
        .map(ShellCommand::new)
        .unwrap_or_else(|| ShellCommand::new("/bin/sh"))
}

/// First existing file among `preferred`, then among `names` searched on
/// `search_path`.
fn resolve_from(
    preferred: impl IntoIterator<Item = PathBuf>,
    names: &[&str],
    search_path: Option<&std::ffi::OsStr>,
) -> Option<PathBuf> {
    preferred
        .into_iter()
        .find(|path| path.is_file())
        .or_else(|| names.iter().find_map(|name| find_on_path(name, search_path)))
}

/// Look `name` up in a `PATH`-style list.
pub fn find_on_path(name: &str, search_path: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    let search_path = search_path?;
    std::env::split_paths(search_path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
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

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ptyhost-config-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse("shell = \"pwsh.exe\"\ncols = 120\n").unwrap();
        assert_eq!(config.shell.as_deref(), Some("pwsh.exe"));
        assert_eq!(config.cols, 120);
        assert_eq!(config.rows, 24);
        assert_eq!(config.read_buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn test_invalid_file_falls_back() {
        let dir = scratch_dir("invalid");
        let path = dir.join("config.toml");
        fs::write(&path, "cols = \"wide\"").unwrap();

        assert_eq!(Config::load_from(&path), Config::default());
        assert_eq!(Config::load_from(&dir.join("missing.toml")), Config::default());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = scratch_dir("save");
        let path = dir.join("nested").join("config.toml");
        let config = Config {
            shell: Some("bash".to_string()),
            args: vec!["--noprofile".to_string()],
            exit_poll_interval_ms: 250,
            ..Config::default()
        };

        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path), config);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_session_options_from_config() {
        let config = Config {
            shell: Some("zsh".to_string()),
            args: vec!["-l".to_string()],
            read_buffer_size: 0,
            exit_poll_interval_ms: 50,
            ..Config::default()
        };
        let options = config.session_options();

        assert_eq!(options.command, ShellCommand::new("zsh").arg("-l"));
        assert_eq!(options.read_buffer_size, 1);
        assert_eq!(options.exit_poll_interval, Duration::from_millis(50));
        assert_eq!(options.drain_timeout, Duration::from_millis(2000));
    }

    #[test]
    fn test_resolution_order() {
        let dir = scratch_dir("resolve");
        let preferred = dir.join("preferred-shell");
        let on_path = dir.join("fallback-shell");
        fs::write(&on_path, "").unwrap();

        let search = std::env::join_paths([&dir]).unwrap();
        let search = Some(search.as_os_str());

        // Missing preferred entry falls through to the search path.
        let found = resolve_from([preferred.clone()], &["fallback-shell"], search);
        assert_eq!(found, Some(on_path.clone()));

        fs::write(&preferred, "").unwrap();
        let found = resolve_from([preferred.clone()], &["fallback-shell"], search);
        assert_eq!(found, Some(preferred));

        assert_eq!(resolve_from(Vec::new(), &["nothing-here"], search), None);
        assert_eq!(find_on_path("fallback-shell", None), None);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_resolved_shell_is_usable() {
        let shell = resolve_shell();
        assert!(!shell.program.as_os_str().is_empty());
    }
}
