//! Configuration management for wlsession
//!
//! Settings are loaded from a TOML file. Every section is optional and falls
//! back to its defaults, so an empty file is a valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration struct containing all session settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SessionConfig {
    /// Advisory time budgets of the event loop
    #[serde(default)]
    pub reactor: ReactorConfig,

    /// The demo window
    #[serde(default)]
    pub window: WindowConfig,

    /// Keyboard handling
    #[serde(default)]
    pub keyboard: KeyboardConfig,

    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Per-phase budgets, in milliseconds. Exceeding one is logged, never fatal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReactorConfig {
    /// Tick hooks, all together
    pub tick_budget_ms: u64,

    /// Preselect hooks (flushing)
    pub preselect_budget_ms: u64,

    /// Each of read, write and exception dispatch
    pub dispatch_budget_ms: u64,

    /// Timer alarms, all together
    pub alarm_budget_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    pub title: String,

    /// Application class reported to the shell
    pub app_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeyboardConfig {
    /// Typing this character stops the session with exit code 0
    pub quit_character: char,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Stop the session after this many seconds
    pub auto_quit_secs: Option<u64>,

    /// Exit code used when the auto-quit timer fires
    pub auto_quit_code: i32,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            tick_budget_ms: 500,
            preselect_budget_ms: 100,
            dispatch_budget_ms: 500,
            alarm_budget_ms: 500,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            title: "Window".to_string(),
            app_id: "wlsession".to_string(),
        }
    }
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self { quit_character: 'q' }
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            auto_quit_secs: None,
            auto_quit_code: 2,
        }
    }
}

/// Expand a leading `~` to `$HOME`
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Ok(Path::new(&home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

impl SessionConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let expanded_path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: SessionConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let reactor = &self.reactor;
        if [
            reactor.tick_budget_ms,
            reactor.preselect_budget_ms,
            reactor.dispatch_budget_ms,
            reactor.alarm_budget_ms,
        ]
        .contains(&0)
        {
            anyhow::bail!("Invalid reactor budget: must be at least 1 ms");
        }

        let window = &self.window;
        if window.width == 0 || window.height == 0 {
            anyhow::bail!(
                "Invalid window size {}x{}: both sides must be non-zero",
                window.width,
                window.height
            );
        }
        // stride * height has to fit the i32 pool size
        if window.width as u64 * 4 * window.height as u64 > i32::MAX as u64 {
            anyhow::bail!(
                "Invalid window size {}x{}: buffer too large",
                window.width,
                window.height
            );
        }

        if self.keyboard.quit_character.is_control() {
            anyhow::bail!(
                "Invalid quit_character {:?}: must be printable",
                self.keyboard.quit_character
            );
        }

        if self.general.auto_quit_secs == Some(0) {
            anyhow::bail!("Invalid auto_quit_secs: must be at least 1");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }
}
