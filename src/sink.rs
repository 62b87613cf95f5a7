//! # Wallpaper Sink
//!
//! Applies a local image file as the desktop background.
//!
//! Two backends are provided:
//! - [`CosmicSink`] writes COSMIC's background config and restarts `cosmic-bg`
//! - [`DesktopSink`] uses the `wallpaper` crate (GNOME, KDE, XFCE, sway via swaybg, ...)
//!
//! [`detect_sink`] picks one based on `XDG_CURRENT_DESKTOP`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("No display available")]
    DisplayUnavailable,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

/// How a photo is mapped onto the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillMode {
    /// Scale proportionally to cover the screen, cropping the overflow.
    #[default]
    Fill,
    /// Scale proportionally to fit inside the screen.
    Fit,
    /// Scale each axis independently to the screen size.
    Stretch,
    /// Original size, centered.
    Center,
}

/// Scaling behaviour requested from a desktop backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageScaling {
    ProportionallyUpOrDown,
    AxesIndependently,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingOptions {
    pub scaling: ImageScaling,
    pub allow_clipping: bool,
}

impl FillMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fill => "fill",
            Self::Fit => "fit",
            Self::Stretch => "stretch",
            Self::Center => "center",
        }
    }

    pub fn scaling_options(self) -> ScalingOptions {
        let (scaling, allow_clipping) = match self {
            Self::Fill => (ImageScaling::ProportionallyUpOrDown, true),
            Self::Fit => (ImageScaling::ProportionallyUpOrDown, false),
            Self::Stretch => (ImageScaling::AxesIndependently, false),
            Self::Center => (ImageScaling::None, false),
        };
        ScalingOptions { scaling, allow_clipping }
    }
}

impl std::str::FromStr for FillMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fill" => Ok(Self::Fill),
            "fit" => Ok(Self::Fit),
            "stretch" => Ok(Self::Stretch),
            "center" | "centre" => Ok(Self::Center),
            other => Err(format!("Unknown fill mode: {other}")),
        }
    }
}

/// Side-effecting "set this file as the wallpaper" call.
#[async_trait]
pub trait WallpaperSink: Send + Sync {
    async fn apply(&self, path: &Path, fill_mode: FillMode) -> Result<(), SinkError>;
}

/// True when a Wayland or X11 display is reachable from this process.
pub fn display_available() -> bool {
    std::env::var_os("WAYLAND_DISPLAY").is_some() || std::env::var_os("DISPLAY").is_some()
}

/// Chooses the backend for the running desktop session.
pub fn detect_sink() -> Box<dyn WallpaperSink> {
    let desktop = std::env::var("XDG_CURRENT_DESKTOP").unwrap_or_default();
    if desktop.to_ascii_uppercase().contains("COSMIC") {
        debug!("Using COSMIC wallpaper backend");
        Box::new(CosmicSink::default())
    } else {
        debug!(desktop = %desktop, "Using generic desktop wallpaper backend");
        Box::new(DesktopSink)
    }
}

/// Generic backend built on the `wallpaper` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct DesktopSink;

fn desktop_mode(options: ScalingOptions) -> wallpaper::Mode {
    match (options.scaling, options.allow_clipping) {
        (ImageScaling::ProportionallyUpOrDown, true) => wallpaper::Mode::Crop,
        (ImageScaling::ProportionallyUpOrDown, false) => wallpaper::Mode::Fit,
        (ImageScaling::AxesIndependently, _) => wallpaper::Mode::Stretch,
        (ImageScaling::None, _) => wallpaper::Mode::Center,
    }
}

#[async_trait]
impl WallpaperSink for DesktopSink {
    async fn apply(&self, path: &Path, fill_mode: FillMode) -> Result<(), SinkError> {
        if !display_available() {
            return Err(SinkError::DisplayUnavailable);
        }
        let path = path
            .to_str()
            .ok_or_else(|| SinkError::Backend("Wallpaper path is not valid UTF-8".into()))?
            .to_string();
        let mode = desktop_mode(fill_mode.scaling_options());

        tokio::task::spawn_blocking(move || {
            wallpaper::set_from_path(&path).map_err(|e| SinkError::Backend(e.to_string()))?;
            wallpaper::set_mode(mode).map_err(|e| SinkError::Backend(e.to_string()))
        })
        .await
        .map_err(|e| SinkError::Backend(format!("Wallpaper task failed: {e}")))?
    }
}

/// Checks if the application is running inside a Flatpak sandbox.
///
/// Flatpak creates a `/.flatpak-info` file inside the sandbox; commands meant
/// for the host then need `flatpak-spawn --host`.
pub fn is_flatpak() -> bool {
    Path::new("/.flatpak-info").exists()
}

/// Runs a command on the host system, prefixing `flatpak-spawn --host` inside Flatpak.
fn run_host_command(cmd: &str, args: &[&str]) -> std::io::Result<std::process::Output> {
    if is_flatpak() {
        let mut spawn_args = vec!["--host", cmd];
        spawn_args.extend(args);
        std::process::Command::new("flatpak-spawn")
            .args(&spawn_args)
            .output()
    } else {
        std::process::Command::new(cmd).args(args).output()
    }
}

/// Like `run_host_command` but doesn't wait for the command to finish.
fn spawn_host_command(cmd: &str) -> std::io::Result<std::process::Child> {
    if is_flatpak() {
        std::process::Command::new("flatpak-spawn")
            .args(["--host", cmd])
            .spawn()
    } else {
        std::process::Command::new(cmd).spawn()
    }
}

/// COSMIC desktop backend.
///
/// COSMIC reads its background from a RON file at
/// `~/.config/cosmic/com.system76.CosmicBackground/v1/all`. There is no reload
/// API, so after writing the file `cosmic-bg` is terminated; COSMIC restarts it
/// and it picks up the new config. If it doesn't come back we start it.
#[derive(Debug, Clone)]
pub struct CosmicSink {
    /// Overrides the config location (tests).
    config_path: Option<PathBuf>,
    restart_renderer: bool,
}

impl Default for CosmicSink {
    fn default() -> Self {
        Self { config_path: None, restart_renderer: true }
    }
}

/// cosmic-bg's `scaling_mode`. COSMIC has no "center" mode; fit is closest.
fn cosmic_scaling_mode(options: ScalingOptions) -> &'static str {
    match (options.scaling, options.allow_clipping) {
        (ImageScaling::ProportionallyUpOrDown, true) => "Zoom",
        (ImageScaling::ProportionallyUpOrDown, false) => "Fit((0.0, 0.0, 0.0))",
        (ImageScaling::AxesIndependently, _) => "Stretch",
        (ImageScaling::None, _) => "Fit((0.0, 0.0, 0.0))",
    }
}

/// Renders the background config for `image_path`.
fn cosmic_background_config(image_path: &str, options: ScalingOptions) -> String {
    format!(
        r#"(
    output: "all",
    source: Path("{}"),
    filter_by_theme: false,
    rotation_frequency: 300,
    filter_method: Lanczos,
    scaling_mode: {},
    sampling_method: Alphanumeric,
)"#,
        image_path,
        cosmic_scaling_mode(options)
    )
}

impl CosmicSink {
    fn config_path(&self) -> Result<PathBuf, SinkError> {
        if let Some(path) = &self.config_path {
            return Ok(path.clone());
        }
        // home_dir() rather than config_dir(): inside Flatpak config_dir() is the
        // sandboxed path, but COSMIC reads the host's ~/.config.
        let home = dirs::home_dir()
            .ok_or_else(|| SinkError::Backend("Could not find home directory".into()))?;
        Ok(home.join(".config/cosmic/com.system76.CosmicBackground/v1/all"))
    }

    fn apply_blocking(&self, image_path: &str, options: ScalingOptions) -> Result<(), SinkError> {
        let config_path = self.config_path()?;
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&config_path, cosmic_background_config(image_path, options))?;

        if !self.restart_renderer {
            return Ok(());
        }

        let _ = run_host_command("pkill", &["-TERM", "-x", "cosmic-bg"]);
        std::thread::sleep(Duration::from_millis(1000));

        match run_host_command("pgrep", &["-x", "cosmic-bg"]) {
            Ok(output) if output.status.success() => Ok(()),
            _ => {
                warn!("cosmic-bg did not restart, starting it");
                spawn_host_command("cosmic-bg")
                    .map_err(|e| SinkError::Backend(format!("Failed to start cosmic-bg: {e}")))?;
                std::thread::sleep(Duration::from_millis(500));
                Ok(())
            }
        }
    }
}

#[async_trait]
impl WallpaperSink for CosmicSink {
    async fn apply(&self, path: &Path, fill_mode: FillMode) -> Result<(), SinkError> {
        if !display_available() {
            return Err(SinkError::DisplayUnavailable);
        }
        let options = fill_mode.scaling_options();
        if options.scaling == ImageScaling::None {
            debug!("COSMIC has no center mode, using fit");
        }
        let image_path = path.to_string_lossy().to_string();
        let sink = self.clone();
        tokio::task::spawn_blocking(move || sink.apply_blocking(&image_path, options))
            .await
            .map_err(|e| SinkError::Backend(format!("Wallpaper task failed: {e}")))?
    }
}
