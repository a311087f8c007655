use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

pub const DEVICE_ID_KEY: &str = "device_id";

/// Read-only key-value settings.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Settings persisted as a flat JSON object.
#[derive(Debug, Default)]
pub struct JsonSettings {
    values: Map<String, Value>,
}

impl JsonSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {:?}", path))?;
        let values: Map<String, Value> = serde_json::from_str(&content)
            .with_context(|| format!("Settings {:?} are not a JSON object", path))?;
        Ok(Self { values })
    }
}

impl SettingsStore for JsonSettings {
    fn get(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemorySettings(HashMap<String, String>);

impl MemorySettings {
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.0.insert(key.to_string(), value.to_string());
        self
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn json_settings_lookup() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"device_id": "board_x", "boot_count": 7, "gone": null}}"#).unwrap();
        let settings = JsonSettings::load(file.path()).unwrap();
        assert_eq!(settings.get(DEVICE_ID_KEY).as_deref(), Some("board_x"));
        assert_eq!(settings.get("boot_count").as_deref(), Some("7"));
        assert_eq!(settings.get("gone"), None);
        assert_eq!(settings.get("missing"), None);
    }

    #[test]
    fn non_object_settings_fail() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2]").unwrap();
        assert!(JsonSettings::load(file.path()).is_err());
    }

    #[test]
    fn memory_settings() {
        let settings = MemorySettings::default().with(DEVICE_ID_KEY, "abc");
        assert_eq!(settings.get(DEVICE_ID_KEY).as_deref(), Some("abc"));
    }
}
