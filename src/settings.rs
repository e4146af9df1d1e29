//! Named device settings
//!
//! Persistence is owned by an external collaborator; the core only reads and
//! writes named values through [`SettingsStore`].

use anyhow::{Context, Result};
use log::{debug, info};
#[cfg(feature = "mock")]
use mockall::automock;
use serde_json::{Map, Value};
use std::{fs, io::ErrorKind, path::Path};

pub const HOSTNAME: &str = "hostname";
pub const AP_ONLY: &str = "aponly";
pub const AP_PASSPHRASE: &str = "appwd";
pub const NO_CAPTIVE_PORTAL: &str = "nocaptp";
pub const CLIENT_SSID: &str = "wcssid";
pub const CLIENT_PASSPHRASE: &str = "wcpass";
pub const MQTT_ENABLE: &str = "mqtt_enable";
pub const MQTT_HOST: &str = "mqtt_host";
pub const MQTT_PORT: &str = "mqtt_port";
pub const MQTT_USER: &str = "mqtt_user";
pub const MQTT_PASS: &str = "mqtt_pass";
pub const MQTT_TOPIC: &str = "mqtt_topic";
pub const MQTT_KEEPALIVE: &str = "mqtt_ka";

const SECRETS: [&str; 3] = [AP_PASSPHRASE, CLIENT_PASSPHRASE, MQTT_PASS];
const REDACTED: &str = "********";

#[cfg_attr(feature = "mock", automock)]
pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value);
    fn remove(&mut self, key: &str);
    fn snapshot(&self) -> Map<String, Value>;
}

/// Typed accessors on top of any [`SettingsStore`].
pub trait SettingsExt {
    /// Non-empty string value of `key`.
    fn string(&self, key: &str) -> Option<String>;
    /// Boolean value of `key`, accepting `true`, `1` and `"1"`/`"true"`.
    fn flag(&self, key: &str) -> bool;
    fn number(&self, key: &str) -> Option<u64>;
    /// Store `value`, or remove `key` when `value` is null or an empty string.
    fn set_or_remove(&mut self, key: &str, value: Value);
    /// Snapshot with secret values masked.
    fn redacted(&self) -> Map<String, Value>;
    /// Snapshot without secret values.
    fn public(&self) -> Map<String, Value>;
}

pub fn is_secret(key: &str) -> bool {
    SECRETS.contains(&key)
}

impl<S: SettingsStore + ?Sized> SettingsExt for S {
    fn string(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn flag(&self, key: &str) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::Number(n)) => n.as_u64().is_some_and(|n| n != 0),
            Some(Value::String(s)) => matches!(s.as_str(), "1" | "true"),
            _ => false,
        }
    }

    fn number(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn set_or_remove(&mut self, key: &str, value: Value) {
        match value {
            Value::Null => self.remove(key),
            Value::String(s) if s.is_empty() => self.remove(key),
            value => self.set(key, value),
        }
    }

    fn redacted(&self) -> Map<String, Value> {
        let mut snapshot = self.snapshot();
        for key in SECRETS {
            if let Some(value) = snapshot.get_mut(key) {
                *value = Value::String(REDACTED.to_string());
            }
        }
        snapshot
    }

    fn public(&self) -> Map<String, Value> {
        let mut snapshot = self.snapshot();
        snapshot.retain(|key, _| !is_secret(key));
        snapshot
    }
}

/// In-memory settings, optionally seeded from a JSON object file.
#[derive(Clone, Debug, Default)]
pub struct MemorySettings {
    values: Map<String, Value>,
}

impl MemorySettings {
    pub fn new(values: Map<String, Value>) -> Self {
        Self { values }
    }

    /// Load the seed file. A missing file yields empty settings.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!("no settings file at {path:?}, starting with defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e).context(format!("failed to read settings: {path:?}")),
        };

        let values: Map<String, Value> = serde_json::from_str(&content)
            .context(format!("failed to parse settings: {path:?}"))?;

        debug!("loaded {} settings from {path:?}", values.len());

        Ok(Self { values })
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn settings(value: Value) -> MemorySettings {
        let Value::Object(map) = value else {
            panic!("expected object");
        };
        MemorySettings::new(map)
    }

    #[test]
    fn typed_accessors() {
        let s = settings(json!({
            "a": "text", "empty": "", "on": true, "one": "1", "zero": 0,
            "port": 1883, "ka": "30"
        }));

        assert_eq!(s.string("a").as_deref(), Some("text"));
        assert_eq!(s.string("empty"), None);
        assert_eq!(s.string("port").as_deref(), Some("1883"));
        assert!(s.flag("on"));
        assert!(s.flag("one"));
        assert!(!s.flag("zero"));
        assert!(!s.flag("missing"));
        assert_eq!(s.number("port"), Some(1883));
        assert_eq!(s.number("ka"), Some(30));
    }

    #[test]
    fn set_or_remove_drops_empty_values() {
        let mut s = settings(json!({"hostname": "lamp"}));

        s.set_or_remove(HOSTNAME, json!(""));
        assert_eq!(s.get(HOSTNAME), None);

        s.set_or_remove(HOSTNAME, json!("desk"));
        assert_eq!(s.get(HOSTNAME), Some(json!("desk")));

        s.set_or_remove(HOSTNAME, Value::Null);
        assert_eq!(s.get(HOSTNAME), None);
    }

    #[test]
    fn redacted_masks_secrets() {
        let s = settings(json!({"mqtt_pass": "secret", "appwd": "12345678", "mqtt_host": "broker"}));
        let redacted = s.redacted();

        assert_eq!(redacted["mqtt_pass"], json!(REDACTED));
        assert_eq!(redacted["appwd"], json!(REDACTED));
        assert_eq!(redacted["mqtt_host"], json!("broker"));

        let public = s.public();
        assert_eq!(public.len(), 1);
        assert!(public.contains_key("mqtt_host"));
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let s = MemorySettings::load(&dir.path().join("settings.json")).unwrap();
        assert!(s.snapshot().is_empty());
    }

    #[test]
    fn load_seed_file() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"mqtt_host":"10.0.0.2","aponly":false}"#).unwrap();

        let s = MemorySettings::load(&path).unwrap();
        assert_eq!(s.string(MQTT_HOST).as_deref(), Some("10.0.0.2"));
        assert!(!s.flag(AP_ONLY));
    }

    #[test]
    fn load_rejects_non_object() {
        let dir = TempDir::new().expect("failed to create temp directory");
        let path = dir.path().join("settings.json");
        fs::write(&path, "[1,2]").unwrap();

        let err = MemorySettings::load(&path).unwrap_err();
        assert!(err.to_string().contains("failed to parse settings"));
    }
}
