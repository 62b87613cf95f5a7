//! # Configuration Module
//!
//! Persisted user settings and the store the update manager reads and writes.
//!
//! ## Configuration Storage
//! Settings are stored as JSON in:
//! `~/.config/album-wallpaper/config.json`
//!
//! The downloaded wallpaper is a single, always-overwritten file:
//! `~/.local/share/album-wallpaper/wallpaper.jpg`
//!
//! ## Write points
//! Nothing mutates settings except through [`SettingsStore`]. The update
//! manager writes exactly two keys (`last_picked_index` and
//! `last_successful_update`); the D-Bus service and CLI write the album,
//! frequency, selection policy, filters and fill mode.
//!
//! Every write re-reads the file first, so keys edited by hand while the
//! daemon runs survive the next save.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sink::FillMode;

/// Directory name used under the XDG config and data directories.
pub const APP_DIR: &str = "album-wallpaper";

/// Fixed name of the wallpaper image file.
const WALLPAPER_FILE: &str = "wallpaper.jpg";

/// Default base URL of the photo library API.
pub const DEFAULT_API_BASE_URL: &str = "https://photoslibrary.googleapis.com/v1";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not determine config path")]
    NoConfigDir,
    #[error("Failed to access config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to replace config file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// Returns `~/.config/album-wallpaper`.
pub fn app_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// Returns `~/.local/share/album-wallpaper`.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join(APP_DIR))
}

/// Path of the single wallpaper file handed to the desktop.
pub fn wallpaper_file_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(WALLPAPER_FILE))
}

/// How often the wallpaper changes automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeFrequency {
    Never,
    Hourly,
    SixHours,
    #[default]
    Daily,
}

impl ChangeFrequency {
    /// Interval between automatic updates, `None` for [`ChangeFrequency::Never`].
    pub fn interval(self) -> Option<chrono::Duration> {
        match self {
            Self::Never => None,
            Self::Hourly => Some(chrono::Duration::seconds(3600)),
            Self::SixHours => Some(chrono::Duration::seconds(21_600)),
            Self::Daily => Some(chrono::Duration::seconds(86_400)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Never => "never",
            Self::Hourly => "hourly",
            Self::SixHours => "six-hours",
            Self::Daily => "daily",
        }
    }
}

impl FromStr for ChangeFrequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "never" => Ok(Self::Never),
            "hourly" => Ok(Self::Hourly),
            "six-hours" | "6h" => Ok(Self::SixHours),
            "daily" => Ok(Self::Daily),
            other => Err(format!("Unknown change frequency: {other}")),
        }
    }
}

/// How the next photo is chosen from the filtered candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    Random,
    Sequential,
}

/// User configuration for the application.
///
/// Missing keys fall back to [`Config::default`], so older config files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Album the wallpaper is picked from.
    pub selected_album_id: Option<String>,
    /// Display name of the selected album (informational).
    pub selected_album_name: Option<String>,
    pub change_frequency: ChangeFrequency,
    /// Random selection when true, sequential otherwise.
    pub pick_randomly: bool,
    /// Photos narrower than this are skipped; 0 disables the filter.
    pub minimum_picture_width: u32,
    /// Skip portrait photos.
    pub horizontal_only: bool,
    pub fill_mode: FillMode,
    /// Index of the last sequential pick. -1 means nothing picked yet.
    pub last_picked_index: i64,
    pub last_successful_update: Option<DateTime<Utc>>,
    /// Base URL of the photo library API.
    pub api_base_url: String,
    /// Upper bound for each photo service call; 0 means wait forever.
    pub network_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            selected_album_id: None,
            selected_album_name: None,
            change_frequency: ChangeFrequency::Daily,
            pick_randomly: false,
            minimum_picture_width: 1920,
            horizontal_only: false,
            fill_mode: FillMode::Fill,
            last_picked_index: -1,
            last_successful_update: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            network_timeout_secs: 120,
        }
    }
}

impl Config {
    /// The selected album id, treating an empty string as unset.
    pub fn album_id(&self) -> Option<&str> {
        self.selected_album_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }

    pub fn selection_policy(&self) -> SelectionPolicy {
        if self.pick_randomly {
            SelectionPolicy::Random
        } else {
            SelectionPolicy::Sequential
        }
    }

    pub fn network_timeout(&self) -> Option<Duration> {
        (self.network_timeout_secs > 0).then(|| Duration::from_secs(self.network_timeout_secs))
    }

    /// Returns `~/.config/album-wallpaper/config.json`.
    pub fn config_path() -> Option<PathBuf> {
        app_config_dir().map(|p| p.join("config.json"))
    }

    /// Loads the configuration from `path`.
    ///
    /// A missing file yields the defaults; a malformed one is an error so a
    /// typo never silently resets the user's album selection.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persists the configuration as pretty-printed JSON.
    ///
    /// The file is replaced atomically; readers never see a partial write.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let dir = path.parent().ok_or(ConfigError::NoConfigDir)?;
        std::fs::create_dir_all(dir)?;

        let content = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(content.as_bytes())?;
        tmp.persist(path)?;
        Ok(())
    }
}

/// Mutable settings handle shared by the manager, the D-Bus service and the CLI.
///
/// Implementations serialise writes internally. Each write is persisted
/// before the call returns.
pub trait SettingsStore: Send + Sync {
    /// A consistent copy of the current settings.
    fn snapshot(&self) -> Config;

    /// Applies `change` and persists the result.
    fn update(&self, change: &mut dyn FnMut(&mut Config)) -> Result<(), ConfigError>;

    fn set_last_picked_index(&self, index: i64) -> Result<(), ConfigError> {
        self.update(&mut |c: &mut Config| c.last_picked_index = index)
    }

    /// Records a successful update. Earlier timestamps are ignored.
    fn set_last_successful_update(&self, at: DateTime<Utc>) -> Result<(), ConfigError> {
        self.update(&mut |c: &mut Config| {
            if c.last_successful_update.map_or(true, |prev| at > prev) {
                c.last_successful_update = Some(at);
            }
        })
    }

    fn set_selected_album(&self, id: Option<String>, name: Option<String>) -> Result<(), ConfigError> {
        self.update(&mut |c: &mut Config| {
            c.selected_album_id = id.clone();
            c.selected_album_name = name.clone();
        })
    }

    fn set_change_frequency(&self, frequency: ChangeFrequency) -> Result<(), ConfigError> {
        self.update(&mut |c: &mut Config| c.change_frequency = frequency)
    }

    fn set_pick_randomly(&self, random: bool) -> Result<(), ConfigError> {
        self.update(&mut |c: &mut Config| c.pick_randomly = random)
    }

    /// Sets the candidate filters; a width of 0 disables the width check.
    fn set_filters(&self, minimum_picture_width: u32, horizontal_only: bool) -> Result<(), ConfigError> {
        self.update(&mut |c: &mut Config| {
            c.minimum_picture_width = minimum_picture_width;
            c.horizontal_only = horizontal_only;
        })
    }

    fn set_fill_mode(&self, fill_mode: FillMode) -> Result<(), ConfigError> {
        self.update(&mut |c: &mut Config| c.fill_mode = fill_mode)
    }

    /// Picks up changes made to the backing storage by someone else.
    fn reload(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Runs a store write on the blocking pool so file I/O stays off the async workers.
pub async fn write_blocking<F>(store: &Arc<dyn SettingsStore>, write: F) -> Result<(), ConfigError>
where
    F: FnOnce(&dyn SettingsStore) -> Result<(), ConfigError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || write(store.as_ref()))
        .await
        .map_err(|e| ConfigError::Io(std::io::Error::other(e)))?
}

/// Settings persisted to a JSON file.
#[derive(Debug)]
pub struct JsonSettingsStore {
    path: PathBuf,
    config: Mutex<Config>,
}

impl JsonSettingsStore {
    /// Opens the store at `path`, loading existing settings if present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Config::load_from(&path)?;
        Ok(Self { path, config: Mutex::new(config) })
    }

    /// Opens the store at the default location.
    pub fn open_default() -> Result<Self, ConfigError> {
        Self::open(Config::config_path().ok_or(ConfigError::NoConfigDir)?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonSettingsStore {
    fn snapshot(&self) -> Config {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, change: &mut dyn FnMut(&mut Config)) -> Result<(), ConfigError> {
        let mut guard = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = Config::load_from(&self.path)?;
        change(&mut next);
        next.save_to(&self.path)?;
        *guard = next;
        Ok(())
    }

    fn reload(&self) -> Result<(), ConfigError> {
        let config = Config::load_from(&self.path)?;
        *self.config.lock().unwrap_or_else(PoisonError::into_inner) = config;
        Ok(())
    }
}

/// In-memory store for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    config: Mutex<Config>,
}

#[cfg(test)]
impl MemorySettingsStore {
    pub fn new(config: Config) -> Self {
        Self { config: Mutex::new(config) }
    }
}

#[cfg(test)]
impl SettingsStore for MemorySettingsStore {
    fn snapshot(&self) -> Config {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn update(&self, change: &mut dyn FnMut(&mut Config)) -> Result<(), ConfigError> {
        change(&mut self.config.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }
}
