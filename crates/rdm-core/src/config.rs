//! Global configuration loaded from `~/.config/rdm/config.toml`.
//!
//! `GlobalSettings` is the typed configuration surface consumed by every
//! component (scheduler, job engine, part workers). A snapshot of it is
//! embedded into each `JobRecord` at admission time so a job keeps the
//! settings it was created under even if the user changes defaults later.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GlobalSettings {
    /// Max concurrent jobs.
    pub download_default_parallel_connections: usize,
    /// Target parts per job; may be overridden to 1 when size is unknown.
    pub download_default_thread_connections: usize,
    /// Per-read buffer size, in bytes.
    pub download_buffer_size: usize,
    /// Per-worker speed cap in bytes/sec; 0 disables.
    pub download_max_network_speed: u64,
    /// Require wifi before starting/continuing a job.
    pub download_wifi_only: bool,
    /// Enable retry-on-error.
    pub download_auto_resume: bool,
    /// Hard cap on retries; forced to 0 when `download_auto_resume` is false.
    pub download_auto_resume_max_errors: u32,
    /// Purge old completed jobs at startup.
    pub download_auto_remove_tasks: bool,
    /// Retention window in days; 0 keeps forever regardless of the flag above.
    pub download_auto_remove_task_after_n_days: u32,
    /// Resolve redirects to a canonical URL before probing.
    pub download_auto_link_redirection: bool,
    /// Preferred User-Agent.
    pub download_http_user_agent: String,
    /// Fallback User-Agent used for `from_browser` jobs.
    pub browser_http_user_agent: String,
    /// Connect & read timeout, in milliseconds.
    pub download_max_http_reading_timeout: u64,
    /// Emit a completion sound.
    pub download_play_notification_sound: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            download_default_parallel_connections: 3,
            download_default_thread_connections: 4,
            download_buffer_size: 64 * 1024,
            download_max_network_speed: 0,
            download_wifi_only: false,
            download_auto_resume: true,
            download_auto_resume_max_errors: 5,
            download_auto_remove_tasks: false,
            download_auto_remove_task_after_n_days: 0,
            download_auto_link_redirection: true,
            download_http_user_agent: "rdm/0.1".to_string(),
            browser_http_user_agent:
                "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                    .to_string(),
            download_max_http_reading_timeout: 30_000,
            download_play_notification_sound: true,
        }
    }
}

impl GlobalSettings {
    /// Enforces the invariant that auto-resume retries require auto-resume to be on.
    pub fn normalize(&mut self) {
        if !self.download_auto_resume {
            self.download_auto_resume_max_errors = 0;
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("rdm")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// The app's private state directory (`~/.local/state/rdm`), home to the
/// Record Store directory and the consolidated snapshot file.
pub fn state_dir() -> Result<PathBuf> {
    Ok(xdg::BaseDirectories::with_prefix("rdm")?.get_state_home())
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<GlobalSettings> {
    let path = config_path()?;
    if !path.exists() {
        let mut default_cfg = GlobalSettings::default();
        default_cfg.normalize();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let mut cfg: GlobalSettings = toml::from_str(&data)?;
    cfg.normalize();
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = GlobalSettings::default();
        assert_eq!(cfg.download_default_parallel_connections, 3);
        assert_eq!(cfg.download_default_thread_connections, 4);
        assert_eq!(cfg.download_auto_resume_max_errors, 5);
    }

    #[test]
    fn config_toml_roundtrip() {
        let cfg = GlobalSettings::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: GlobalSettings = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn normalize_zeroes_max_errors_when_auto_resume_disabled() {
        let mut cfg = GlobalSettings {
            download_auto_resume: false,
            download_auto_resume_max_errors: 7,
            ..GlobalSettings::default()
        };
        cfg.normalize();
        assert_eq!(cfg.download_auto_resume_max_errors, 0);
    }
}
