//! Settings persistence (JSON file in the user's config directory)

use crate::error::SessionError;
use dlsession_types::Settings;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// File name of the settings document
pub const SETTINGS_FILE: &str = "settings.json";

/// Loads and saves [`Settings`]
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/dlsession/settings.json`, or `.dlsession/settings.json`
    /// when the platform has no config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("dlsession"))
            .unwrap_or_else(|| PathBuf::from(".dlsession"))
            .join(SETTINGS_FILE)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, falling back to defaults when no file exists yet
    pub async fn load(&self) -> Result<Settings, SessionError> {
        if !fs::try_exists(&self.path).await? {
            debug!("No settings at {:?}, using defaults", self.path);
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    pub async fn save(&self, settings: &Settings) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.path, content).await?;
        info!("Saved settings to {:?}", self.path);
        Ok(())
    }

    /// Delete the settings file so the next load yields defaults
    pub async fn reset(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Names of all settings keys
pub fn setting_keys() -> Vec<String> {
    match serde_json::to_value(Settings::default()) {
        Ok(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Read one setting as display text
pub fn get_setting(settings: &Settings, key: &str) -> Result<String, SessionError> {
    let value = serde_json::to_value(settings)?;
    match value.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) => Ok("none".to_string()),
        Some(other) => Ok(other.to_string()),
        None => Err(unknown_key(key)),
    }
}

/// Update one setting from text. The value is parsed as JSON first and
/// taken as a plain string otherwise; `none` clears optional settings.
pub fn set_setting(settings: &mut Settings, key: &str, raw: &str) -> Result<(), SessionError> {
    let mut document = serde_json::to_value(&*settings)?;
    let Some(slot) = document.get_mut(key) else {
        return Err(unknown_key(key));
    };

    *slot = if raw.eq_ignore_ascii_case("none") {
        Value::Null
    } else {
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
    };

    *settings = serde_json::from_value(document)
        .map_err(|e| SessionError::Config(format!("{} = {:?}: {}", key, raw, e)))?;
    Ok(())
}

fn unknown_key(key: &str) -> SessionError {
    SessionError::Config(format!(
        "unknown key '{}' (expected one of: {})",
        key,
        setting_keys().join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlsession_types::OverwritePolicy;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path().join("settings.json"));

        assert_eq!(store.load().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path().join("nested").join("settings.json"));

        let settings = Settings {
            overwrite: OverwritePolicy::Always,
            timeout_secs: Some(60),
            ..Default::default()
        };
        store.save(&settings).await.unwrap();

        assert_eq!(store.load().await.unwrap(), settings);

        store.reset().await.unwrap();
        store.reset().await.unwrap();
        assert_eq!(store.load().await.unwrap(), Settings::default());
    }

    #[tokio::test]
    async fn test_partial_document_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "max_redirects": 3 }"#).unwrap();

        let settings = SettingsStore::new(&path).load().await.unwrap();

        assert_eq!(settings.max_redirects, 3);
        assert_eq!(settings.read_timeout_secs, Settings::default().read_timeout_secs);
    }

    #[test]
    fn test_set_and_get_setting() {
        let mut settings = Settings::default();

        set_setting(&mut settings, "overwrite", "always").unwrap();
        set_setting(&mut settings, "timeout_secs", "90").unwrap();
        set_setting(&mut settings, "download_dir", "/tmp/downloads").unwrap();
        set_setting(&mut settings, "accept_invalid_certs", "true").unwrap();

        assert_eq!(settings.overwrite, OverwritePolicy::Always);
        assert_eq!(settings.timeout_secs, Some(90));
        assert_eq!(settings.download_dir, PathBuf::from("/tmp/downloads"));
        assert!(settings.accept_invalid_certs);
        assert_eq!(get_setting(&settings, "timeout_secs").unwrap(), "90");

        set_setting(&mut settings, "timeout_secs", "none").unwrap();
        assert_eq!(get_setting(&settings, "timeout_secs").unwrap(), "none");
    }

    #[test]
    fn test_rejects_bad_settings() {
        let mut settings = Settings::default();

        assert!(matches!(
            set_setting(&mut settings, "colour", "blue"),
            Err(SessionError::Config(_))
        ));
        assert!(matches!(
            set_setting(&mut settings, "max_redirects", "lots"),
            Err(SessionError::Config(_))
        ));
        assert_eq!(settings, Settings::default());
    }
}
