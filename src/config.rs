//! Configuration handling for Vyper
//!
//! Settings live in a TOML file under the Vyper base directory. The file holds the
//! appearance preferences and a `[client]` table describing how the external VPN
//! client is launched.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, warn};

/// Environment variable overriding the base directory
pub const HOME_ENV: &str = "VYPER_HOME";

const CONFIG_FILE: &str = "config.toml";
const PROFILE_DIR: &str = "vpns";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(std::io::Error),
    #[error("Failed to write config file: {0}")]
    WriteError(std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Could not determine a configuration directory")]
    NoConfigDir,
}

/// Resolve the Vyper base directory (`$VYPER_HOME` or `<config dir>/vyper`)
pub fn base_dir() -> Result<PathBuf, ConfigError> {
    if let Some(home) = std::env::var_os(HOME_ENV) {
        return Ok(PathBuf::from(home));
    }
    dirs::config_dir()
        .map(|dir| dir.join("vyper"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Location of the settings file inside `base`
pub fn config_path(base: &Path) -> PathBuf {
    base.join(CONFIG_FILE)
}

/// Location of the profile directory inside `base`
pub fn profile_dir(base: &Path) -> PathBuf {
    base.join(PROFILE_DIR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Appearance {
    #[default]
    Dark,
    Light,
}

impl Appearance {
    pub fn toggled(self) -> Self {
        match self {
            Appearance::Dark => Appearance::Light,
            Appearance::Light => Appearance::Dark,
        }
    }
}

impl FromStr for Appearance {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dark" => Ok(Appearance::Dark),
            "light" => Ok(Appearance::Light),
            _ => Err(format!("unknown appearance: {s}")),
        }
    }
}

impl fmt::Display for Appearance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Appearance::Dark => f.write_str("Dark"),
            Appearance::Light => f.write_str("Light"),
        }
    }
}

/// Text color that stays readable on top of an accent color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextColor {
    White,
    Black,
}

/// 24-bit color, stored as `#RRGGBB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Pick white text for dark backgrounds and black text for light ones
    pub fn contrasting_text(&self) -> TextColor {
        let luminance =
            (0.299 * f64::from(self.r) + 0.587 * f64::from(self.g) + 0.114 * f64::from(self.b))
                / 255.0;
        if luminance < 0.5 {
            TextColor::White
        } else {
            TextColor::Black
        }
    }
}

impl Default for Rgb {
    fn default() -> Self {
        Self::new(0x00, 0x78, 0xD7)
    }
}

impl FromStr for Rgb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid color (expected #RRGGBB): {s}"));
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| e.to_string());
        Ok(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl TryFrom<String> for Rgb {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// How privileges are obtained for the client process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElevationKind {
    #[default]
    Auto,
    Sudo,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Client executable, resolved through `PATH` when relative
    pub binary: PathBuf,
    pub elevation: ElevationKind,
    pub grace_period_secs: u64,
    pub diagnostic_tail_bytes: usize,
    /// Output line marking an established tunnel; unset means "exit code 0"
    pub ready_marker: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("openvpn"),
            elevation: ElevationKind::Auto,
            grace_period_secs: 5,
            diagnostic_tail_bytes: 8 * 1024,
            ready_marker: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub appearance: Appearance,
    #[serde(default)]
    pub accent_color: Rgb,
    #[serde(default)]
    pub client: ClientSettings,
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Owns the settings blob and writes it back on every change
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    settings: Settings,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            settings: Settings::default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Load settings from disk, writing defaults on first run
    ///
    /// On error the in-memory settings fall back to defaults so the caller can keep
    /// going after reporting the problem.
    pub fn load(&mut self) -> Result<&Settings, ConfigError> {
        if !self.path.exists() {
            info!("No config file at {}, writing defaults", self.path.display());
            self.settings = Settings::default();
            self.save()?;
            return Ok(&self.settings);
        }

        let loaded = std::fs::read_to_string(&self.path)
            .map_err(ConfigError::ReadError)
            .and_then(|content| Settings::from_toml(&content));
        match loaded {
            Ok(settings) => {
                self.settings = settings;
                Ok(&self.settings)
            }
            Err(e) => {
                self.settings = Settings::default();
                Err(e)
            }
        }
    }

    /// Load settings, logging any error and substituting defaults
    pub fn load_or_default(&mut self) -> &Settings {
        if let Err(e) = self.load() {
            warn!("Using default settings: {}", e);
        }
        &self.settings
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let content = self.settings.to_toml()?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::WriteError)?;
        }
        std::fs::write(&self.path, content).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    pub fn set_appearance(&mut self, appearance: Appearance) -> Result<(), ConfigError> {
        self.settings.appearance = appearance;
        self.save()
    }

    pub fn set_accent_color(&mut self, color: Rgb) -> Result<(), ConfigError> {
        self.settings.accent_color = color;
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.appearance, Appearance::Dark);
        assert_eq!(settings.accent_color.to_string(), "#0078D7");
        assert_eq!(settings.client.binary, PathBuf::from("openvpn"));
        assert_eq!(settings.client.grace_period_secs, 5);
        assert!(settings.client.ready_marker.is_none());
    }

    #[test]
    fn test_rgb_parse_and_display() {
        let color: Rgb = "#ff8000".parse().unwrap();
        assert_eq!(color, Rgb::new(255, 128, 0));
        assert_eq!(color.to_string(), "#FF8000");
        assert_eq!("00ff00".parse::<Rgb>().unwrap(), Rgb::new(0, 255, 0));
        assert!("#12345".parse::<Rgb>().is_err());
        assert!("#zzzzzz".parse::<Rgb>().is_err());
    }

    #[test]
    fn test_contrasting_text() {
        assert_eq!(Rgb::new(0, 0, 0).contrasting_text(), TextColor::White);
        assert_eq!(Rgb::new(255, 255, 255).contrasting_text(), TextColor::Black);
        assert_eq!(Rgb::default().contrasting_text(), TextColor::White);
        assert_eq!(Rgb::new(255, 255, 0).contrasting_text(), TextColor::Black);
    }

    #[test]
    fn test_appearance_parse() {
        assert_eq!("dark".parse::<Appearance>().unwrap(), Appearance::Dark);
        assert_eq!("Light".parse::<Appearance>().unwrap(), Appearance::Light);
        assert!("dim".parse::<Appearance>().is_err());
        assert_eq!(Appearance::Dark.toggled(), Appearance::Light);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let settings = Settings::from_toml("appearance = \"Light\"\n").unwrap();
        assert_eq!(settings.appearance, Appearance::Light);
        assert_eq!(settings.accent_color, Rgb::default());
        assert_eq!(settings.client, ClientSettings::default());

        let settings = Settings::from_toml(
            "[client]\nbinary = \"/usr/sbin/openvpn\"\nready_marker = \"Initialization Sequence Completed\"\n",
        )
        .unwrap();
        assert_eq!(settings.client.binary, PathBuf::from("/usr/sbin/openvpn"));
        assert_eq!(settings.client.grace_period_secs, 5);
        assert_eq!(
            settings.client.ready_marker.as_deref(),
            Some("Initialization Sequence Completed")
        );
    }

    #[test]
    fn test_load_creates_defaults() {
        let dir = TempDir::new().unwrap();
        let path = config_path(dir.path());
        let mut store = ConfigStore::new(path.clone());

        let settings = store.load().unwrap().clone();
        assert_eq!(settings, Settings::default());
        assert!(path.exists());
    }

    #[test]
    fn test_setters_persist() {
        let dir = TempDir::new().unwrap();
        let path = config_path(dir.path());
        let mut store = ConfigStore::new(path.clone());
        store.load().unwrap();

        store.set_appearance(Appearance::Light).unwrap();
        store.set_accent_color(Rgb::new(0x11, 0x22, 0x33)).unwrap();

        let mut reopened = ConfigStore::new(path);
        let settings = reopened.load().unwrap();
        assert_eq!(settings.appearance, Appearance::Light);
        assert_eq!(settings.accent_color.to_string(), "#112233");
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = config_path(dir.path());
        std::fs::write(&path, "appearance = [not toml").unwrap();

        let mut store = ConfigStore::new(path);
        assert!(matches!(store.load(), Err(ConfigError::ParseError(_))));
        assert_eq!(store.settings(), &Settings::default());
        assert_eq!(store.load_or_default(), &Settings::default());
    }

    #[test]
    fn test_invalid_accent_is_parse_error() {
        let result = Settings::from_toml("accent_color = \"blue\"\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }
}
