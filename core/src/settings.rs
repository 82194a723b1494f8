use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    DownloadPath,
    AppearanceMode,
    ColorTheme,
}

impl SettingKey {
    pub const ALL: [SettingKey; 3] = [
        SettingKey::DownloadPath,
        SettingKey::AppearanceMode,
        SettingKey::ColorTheme,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::DownloadPath => "downloadPath",
            SettingKey::AppearanceMode => "appearanceMode",
            SettingKey::ColorTheme => "colorTheme",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "downloadPath" => Some(SettingKey::DownloadPath),
            "appearanceMode" => Some(SettingKey::AppearanceMode),
            "colorTheme" => Some(SettingKey::ColorTheme),
            _ => None,
        }
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppearanceMode {
    System,
    Light,
    Dark,
}

impl AppearanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppearanceMode::System => "system",
            AppearanceMode::Light => "light",
            AppearanceMode::Dark => "dark",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "system" => Some(AppearanceMode::System),
            "light" => Some(AppearanceMode::Light),
            "dark" => Some(AppearanceMode::Dark),
            _ => None,
        }
    }
}

/// Flat key/value document. Keys outside [`SettingKey`] are carried through
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    pub fn seeded() -> Self {
        let mut settings = Self::default();
        settings.seed_defaults();
        settings
    }

    /// Adds an empty value for every missing recognized key. Returns whether
    /// anything was added.
    pub fn seed_defaults(&mut self) -> bool {
        let mut changed = false;
        for key in SettingKey::ALL {
            if !self.values.contains_key(key.as_str()) {
                self.values.insert(key.as_str().to_string(), String::new());
                changed = true;
            }
        }
        changed
    }

    pub fn get(&self, key: SettingKey) -> &str {
        self.values.get(key.as_str()).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: SettingKey, value: &str) -> CoreResult<()> {
        if key == SettingKey::AppearanceMode
            && !value.is_empty()
            && AppearanceMode::from_str(value).is_none()
        {
            return Err(CoreError::InvalidSetting(format!(
                "appearanceMode must be one of system, light, dark (got {})",
                value
            )));
        }
        self.values.insert(key.as_str().to_string(), value.to_string());
        Ok(())
    }

    pub fn download_path(&self) -> Option<PathBuf> {
        let value = self.get(SettingKey::DownloadPath).trim();
        if value.is_empty() {
            None
        } else {
            Some(PathBuf::from(value))
        }
    }

    pub fn appearance_mode(&self) -> Option<AppearanceMode> {
        AppearanceMode::from_str(self.get(SettingKey::AppearanceMode))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

pub trait SettingsStore: Send + Sync {
    /// Returns the current document, materializing defaults on first touch.
    fn load(&mut self) -> CoreResult<Settings>;
    fn save(&mut self, settings: &Settings) -> CoreResult<()>;

    fn get(&mut self, key: SettingKey) -> CoreResult<String> {
        Ok(self.load()?.get(key).to_string())
    }

    fn set(&mut self, key: SettingKey, value: &str) -> CoreResult<()> {
        let mut settings = self.load()?;
        settings.set(key, value)?;
        self.save(&settings)
    }
}

#[derive(Default)]
pub struct MemorySettingsStore {
    settings: Option<Settings>,
}

impl MemorySettingsStore {
    pub fn with_settings(settings: Settings) -> Self {
        Self {
            settings: Some(settings),
        }
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&mut self) -> CoreResult<Settings> {
        let settings = self.settings.get_or_insert_with(Settings::seeded);
        settings.seed_defaults();
        Ok(settings.clone())
    }

    fn save(&mut self, settings: &Settings) -> CoreResult<()> {
        self.settings = Some(settings.clone());
        Ok(())
    }
}

pub struct JsonSettingsStore {
    pub path: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config_dir>/trackfetch/settings.json`, or `./settings.json` when the
    /// platform has no config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("trackfetch").join("settings.json"))
            .unwrap_or_else(|| PathBuf::from("settings.json"))
    }

    fn read(path: &Path) -> CoreResult<Settings> {
        let bytes = fs::read(path)
            .map_err(|err| CoreError::SettingsIo(format!("{}: {}", path.display(), err)))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| CoreError::SettingsIo(format!("{}: {}", path.display(), err)))
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&mut self) -> CoreResult<Settings> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "seeding settings file");
            let settings = Settings::seeded();
            self.save(&settings)?;
            return Ok(settings);
        }
        let mut settings = Self::read(&self.path)?;
        if settings.seed_defaults() {
            self.save(&settings)?;
        }
        Ok(settings)
    }

    fn save(&mut self, settings: &Settings) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    CoreError::SettingsIo(format!("{}: {}", parent.display(), err))
                })?;
            }
        }
        let json = serde_json::to_string_pretty(settings)
            .map_err(|err| CoreError::SettingsIo(err.to_string()))?;
        fs::write(&self.path, format!("{json}\n"))
            .map_err(|err| CoreError::SettingsIo(format!("{}: {}", self.path.display(), err)))
    }
}
