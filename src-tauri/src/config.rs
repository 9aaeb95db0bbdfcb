use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::app::{APP_ID, APP_NAME, BACKEND_BINARY_NAME, BACKEND_ENV, HANDSHAKE_TIMEOUT_ENV, KEEP_ALIVE_ENV};
use crate::coordinator::{CoordinatorSettings, WindowClosePolicy};
use crate::error::{ShellError, ShellResult};
use crate::handshake::DEFAULT_MAX_LINE_BYTES;
use crate::notify::DEFAULT_NOTIFICATION_PATH;
use crate::process::LaunchSpec;
use crate::relay::{default_log_path, DEFAULT_RECENT_LINES};

const CONFIG_FILE: &str = "shell.json";

const HANDSHAKE_TIMEOUT_RANGE_MS: (u64, u64) = (500, 120_000);
const KILL_GRACE_RANGE_MS: (u64, u64) = (0, 30_000);
const MAX_LINE_RANGE: (usize, usize) = (1024, 16 * 1024 * 1024);
const MAX_RECENT_LINES: usize = 10_000;

/// Shell settings, read from `<config_dir>/goircha/shell.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Explicit backend executable. Looked up next to the shell when unset.
    pub backend_path: Option<PathBuf>,
    pub backend_args: Vec<String>,
    pub backend_env: BTreeMap<String, String>,

    pub handshake_timeout_ms: u64,
    pub kill_grace_ms: u64,
    pub max_handshake_line: usize,

    /// Keep running with zero windows. Follows the platform when unset.
    pub keep_running_without_windows: Option<bool>,

    pub window: WindowConfig,

    pub log_to_file: bool,
    pub log_file: Option<PathBuf>,
    pub recent_log_lines: usize,

    pub notification_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: f64,
    pub height: f64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: APP_NAME.to_string(),
            width: 800.0,
            height: 600.0,
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            backend_path: None,
            backend_args: Vec::new(),
            backend_env: BTreeMap::new(),
            handshake_timeout_ms: 10_000,
            kill_grace_ms: 3_000,
            max_handshake_line: DEFAULT_MAX_LINE_BYTES,
            keep_running_without_windows: None,
            window: WindowConfig::default(),
            log_to_file: true,
            log_file: None,
            recent_log_lines: DEFAULT_RECENT_LINES,
            notification_path: DEFAULT_NOTIFICATION_PATH.to_string(),
        }
    }
}

impl ShellConfig {
    /// Loads the config file, falling back to defaults when it is missing or
    /// broken, then applies environment overrides
    pub fn load() -> Self {
        let mut config = match config_path() {
            Some(path) => Self::load_or_create(&path),
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.clamp();
        config
    }

    /// Reads `path`. A missing file is created with the defaults so there is
    /// something to edit.
    pub fn load_or_create(path: &Path) -> Self {
        if !path.exists() {
            debug!("No shell config at {:?}, writing defaults", path);
            let config = Self::default();
            if let Err(e) = config.save_to(path) {
                warn!("Could not write default config: {:#}", e);
            }
            return config;
        }
        match Self::load_from(path) {
            Ok(config) => {
                info!("Loaded shell config from {:?}", path);
                config
            }
            Err(e) => {
                warn!("{}, using defaults", e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> ShellResult<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ShellError::Config(format!("cannot read {:?}: {}", path, e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| ShellError::Config(format!("cannot parse {:?}: {}", path, e)))
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {:?}", parent))?;
        }
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Saved shell config to {:?}", path);
        Ok(())
    }

    /// Applies `GOIRCHA_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(BACKEND_ENV).filter(|p| !p.trim().is_empty()) {
            self.backend_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = lookup(HANDSHAKE_TIMEOUT_ENV) {
            match raw.trim().parse() {
                Ok(ms) => self.handshake_timeout_ms = ms,
                Err(_) => warn!("Ignoring {}={:?}: not a number", HANDSHAKE_TIMEOUT_ENV, raw),
            }
        }
        if let Some(raw) = lookup(KEEP_ALIVE_ENV) {
            match parse_flag(&raw) {
                Some(flag) => self.keep_running_without_windows = Some(flag),
                None => warn!("Ignoring {}={:?}: not a boolean", KEEP_ALIVE_ENV, raw),
            }
        }
    }

    /// Pulls numeric settings back into their supported ranges
    pub fn clamp(&mut self) {
        self.handshake_timeout_ms = self
            .handshake_timeout_ms
            .clamp(HANDSHAKE_TIMEOUT_RANGE_MS.0, HANDSHAKE_TIMEOUT_RANGE_MS.1);
        self.kill_grace_ms = self
            .kill_grace_ms
            .clamp(KILL_GRACE_RANGE_MS.0, KILL_GRACE_RANGE_MS.1);
        self.max_handshake_line = self
            .max_handshake_line
            .clamp(MAX_LINE_RANGE.0, MAX_LINE_RANGE.1);
        self.recent_log_lines = self.recent_log_lines.min(MAX_RECENT_LINES);
        if self.window.width < 200.0 || self.window.height < 150.0 {
            warn!("Window size {}x{} too small, using default", self.window.width, self.window.height);
            self.window.width = WindowConfig::default().width;
            self.window.height = WindowConfig::default().height;
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn close_policy(&self) -> WindowClosePolicy {
        match self.keep_running_without_windows {
            Some(keep) => WindowClosePolicy {
                keep_running_without_windows: keep,
            },
            None => WindowClosePolicy::platform_default(),
        }
    }

    /// Finds the backend executable: configured path, then next to the shell
    /// executable, then on `PATH`
    pub fn resolve_backend(&self) -> PathBuf {
        if let Some(path) = &self.backend_path {
            return path.clone();
        }

        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(BACKEND_BINARY_NAME)));
        if let Some(path) = beside_exe.as_ref().filter(|p| p.is_file()) {
            return path.clone();
        }

        if let Ok(path) = which::which(BACKEND_BINARY_NAME) {
            debug!("Using backend from PATH: {:?}", path);
            return path;
        }

        // spawning will report the launch fault against this path
        beside_exe.unwrap_or_else(|| PathBuf::from(BACKEND_BINARY_NAME))
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            program: self.resolve_backend(),
            args: self.backend_args.clone(),
            env: self
                .backend_env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            current_dir: None,
            kill_grace: self.kill_grace(),
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            launch: self.launch_spec(),
            handshake_timeout: self.handshake_timeout(),
            max_handshake_line: self.max_handshake_line,
            policy: self.close_policy(),
            notification_path: self.notification_path.clone(),
            log_file: if self.log_to_file {
                Some(self.log_file.clone().unwrap_or_else(default_log_path))
            } else {
                None
            },
            recent_log_lines: self.recent_log_lines,
        }
    }
}

/// `<config_dir>/goircha/shell.json`
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_ID).join(CONFIG_FILE))
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShellConfig::default();
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.kill_grace(), Duration::from_secs(3));
        assert_eq!(config.recent_log_lines, 800);
        assert_eq!(config.window.width, 800.0);
        assert_eq!(config.notification_path, "/changeWindow/{source}/{id}");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell.json");
        std::fs::write(&path, r#"{ "handshake_timeout_ms": 2500, "backend_args": ["--dev"] }"#)
            .unwrap();

        let config = ShellConfig::load_from(&path).unwrap();
        assert_eq!(config.handshake_timeout_ms, 2500);
        assert_eq!(config.backend_args, vec!["--dev".to_string()]);
        assert_eq!(config.kill_grace_ms, 3_000);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ShellConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ShellError::Config(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("goircha").join("shell.json");
        assert_eq!(ShellConfig::load_or_create(&path), ShellConfig::default());
        assert!(path.is_file());
        assert_eq!(ShellConfig::load_from(&path).unwrap(), ShellConfig::default());
    }

    #[test]
    fn test_broken_file_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shell.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(ShellConfig::load_or_create(&path), ShellConfig::default());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("shell.json");
        let mut config = ShellConfig::default();
        config.keep_running_without_windows = Some(true);
        config.backend_env.insert("GOIRCHA_PORT".into(), "0".into());
        config.save_to(&path).unwrap();
        assert_eq!(ShellConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ShellConfig::default();
        config.apply_env(|key| match key {
            BACKEND_ENV => Some("/opt/goircha/backend".to_string()),
            HANDSHAKE_TIMEOUT_ENV => Some("2500".to_string()),
            KEEP_ALIVE_ENV => Some("yes".to_string()),
            _ => None,
        });
        assert_eq!(config.backend_path, Some(PathBuf::from("/opt/goircha/backend")));
        assert_eq!(config.handshake_timeout_ms, 2500);
        assert!(config.close_policy().keep_running_without_windows);
        assert_eq!(config.resolve_backend(), PathBuf::from("/opt/goircha/backend"));
    }

    #[test]
    fn test_bad_env_values_are_ignored() {
        let mut config = ShellConfig::default();
        config.apply_env(|key| match key {
            HANDSHAKE_TIMEOUT_ENV => Some("soon".to_string()),
            KEEP_ALIVE_ENV => Some("maybe".to_string()),
            BACKEND_ENV => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config, ShellConfig::default());
    }

    #[test]
    fn test_clamp() {
        let mut config = ShellConfig {
            handshake_timeout_ms: 1,
            kill_grace_ms: 999_999,
            max_handshake_line: 3,
            recent_log_lines: 1_000_000,
            ..Default::default()
        };
        config.window.width = 10.0;
        config.clamp();
        assert_eq!(config.handshake_timeout_ms, 500);
        assert_eq!(config.kill_grace_ms, 30_000);
        assert_eq!(config.max_handshake_line, 1024);
        assert_eq!(config.recent_log_lines, 10_000);
        assert_eq!(config.window.width, 800.0);
    }

    #[test]
    fn test_coordinator_settings_without_log_file() {
        let config = ShellConfig {
            backend_path: Some(PathBuf::from("/bin/true")),
            log_to_file: false,
            ..Default::default()
        };
        let settings = config.coordinator_settings();
        assert_eq!(settings.launch.program, PathBuf::from("/bin/true"));
        assert!(settings.log_file.is_none());
        assert_eq!(settings.handshake_timeout, Duration::from_secs(10));
    }
}
