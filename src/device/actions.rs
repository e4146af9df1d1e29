//! Built-in settings actions and the settings page
//!
//! Every action validates its payload, stores the values, applies them and
//! re-renders the settings page.

use super::{Action, Device};
use crate::{
    frame::Frame,
    settings::{self, SettingsExt},
    wifi::{radio::Credentials, sanitize_passphrase},
};
use anyhow::Context;
use serde::{Deserialize, Deserializer, de::DeserializeOwned, de::Error as _};
use serde_json::{Map, Value};
use serde_valid::Validate;
use std::collections::HashMap;

pub const SET_WIFI: &str = "set_wifi";
pub const SET_WIFI_AP: &str = "set_wifiAP";
pub const SET_MQTT: &str = "set_mqtt";
pub const SET_HOSTNAME: &str = "shname";

/// Renders the settings page as a frame.
pub trait SettingsPage: Send {
    fn render(&self, device: &Device) -> Frame;
}

/// Value frame with the non-secret network settings.
pub struct NetworkSettingsPage;

impl SettingsPage for NetworkSettingsPage {
    fn render(&self, device: &Device) -> Frame {
        let mut block = device.settings().public();
        block.insert(
            settings::HOSTNAME.to_string(),
            Value::String(device.hostname().to_string()),
        );
        block.insert(
            "wifi".to_string(),
            serde_json::to_value(device.state()).unwrap_or_default(),
        );
        block.insert(
            "mqtt".to_string(),
            serde_json::to_value(device.bus().state()).unwrap_or_default(),
        );

        Frame::value(Value::Object(block))
    }
}

pub(super) fn builtin() -> HashMap<String, Action> {
    HashMap::from([
        (SET_WIFI.to_string(), set_wifi as Action),
        (SET_WIFI_AP.to_string(), set_wifi_ap as Action),
        (SET_MQTT.to_string(), set_mqtt as Action),
        (SET_HOSTNAME.to_string(), set_hostname as Action),
    ])
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_u64().is_some_and(|n| n != 0),
        Value::String(s) => matches!(s.as_str(), "1" | "true" | "on"),
        _ => false,
    })
}

fn number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid number: {n}"))),
        Value::String(s) => s.trim().parse().map_err(D::Error::custom),
        other => Err(D::Error::custom(format!("expected number, got {other}"))),
    }
}

fn default_port() -> u32 {
    crate::bus::DEFAULT_PORT.into()
}

fn default_keepalive() -> u32 {
    crate::bus::DEFAULT_KEEPALIVE.into()
}

#[derive(Debug, Deserialize, Validate)]
struct ClientSettings {
    #[serde(default)]
    #[validate(max_length = 32)]
    wcssid: String,
    #[serde(default)]
    #[validate(max_length = 63)]
    wcpass: String,
}

#[derive(Debug, Deserialize, Validate)]
struct AccessPointSettings {
    #[serde(default, deserialize_with = "flag")]
    aponly: bool,
    #[serde(default)]
    #[validate(max_length = 63)]
    appwd: String,
    #[serde(default, deserialize_with = "flag")]
    nocaptp: bool,
}

#[derive(Debug, Deserialize, Validate)]
struct BusSettings {
    #[serde(default, deserialize_with = "flag")]
    mqtt_enable: bool,
    #[serde(default)]
    #[validate(max_length = 128)]
    mqtt_host: String,
    #[serde(default = "default_port", deserialize_with = "number")]
    #[validate(minimum = 1)]
    #[validate(maximum = 65535)]
    mqtt_port: u32,
    #[serde(default)]
    mqtt_user: String,
    #[serde(default)]
    mqtt_pass: String,
    #[serde(default)]
    #[validate(max_length = 128)]
    mqtt_topic: String,
    #[serde(default = "default_keepalive", deserialize_with = "number")]
    #[validate(maximum = 65535)]
    mqtt_ka: u32,
}

#[derive(Debug, Deserialize, Validate)]
struct HostnameSettings {
    #[serde(default)]
    #[validate(max_length = 32)]
    #[validate(pattern = r"^[A-Za-z0-9-]*$")]
    hostname: String,
}

fn payload<T>(command: &Map<String, Value>) -> anyhow::Result<T>
where
    T: DeserializeOwned + Validate,
{
    let payload: T =
        serde_json::from_value(Value::Object(command.clone())).context("invalid payload")?;
    payload.validate().context("validation failed")?;
    Ok(payload)
}

fn set_wifi(device: &mut Device, command: &Map<String, Value>) -> anyhow::Result<()> {
    let ClientSettings { wcssid, wcpass } = payload(command)?;

    let store = device.settings_mut();
    store.set_or_remove(settings::CLIENT_SSID, Value::String(wcssid.clone()));
    store.set_or_remove(settings::CLIENT_PASSPHRASE, Value::String(wcpass.clone()));

    let credentials = (!wcssid.is_empty()).then_some(Credentials {
        ssid: wcssid,
        passphrase: wcpass,
    });

    device.connect(credentials);
    device.render_settings();
    Ok(())
}

fn set_wifi_ap(device: &mut Device, command: &Map<String, Value>) -> anyhow::Result<()> {
    let AccessPointSettings {
        aponly,
        appwd,
        nocaptp,
    } = payload(command)?;
    let appwd = sanitize_passphrase(Some(appwd).filter(|p| !p.is_empty())).unwrap_or_default();

    let store = device.settings_mut();
    store.set(settings::AP_ONLY, Value::Bool(aponly));
    store.set_or_remove(settings::AP_PASSPHRASE, Value::String(appwd));
    store.set(settings::NO_CAPTIVE_PORTAL, Value::Bool(nocaptp));

    device.reload_connectivity();
    device.render_settings();
    Ok(())
}

fn set_mqtt(device: &mut Device, command: &Map<String, Value>) -> anyhow::Result<()> {
    let BusSettings {
        mqtt_enable,
        mqtt_host,
        mqtt_port,
        mqtt_user,
        mqtt_pass,
        mqtt_topic,
        mqtt_ka,
    } = payload(command)?;

    let store = device.settings_mut();
    store.set(settings::MQTT_ENABLE, Value::Bool(mqtt_enable));
    store.set_or_remove(settings::MQTT_HOST, Value::String(mqtt_host));
    store.set(settings::MQTT_PORT, mqtt_port.into());
    store.set_or_remove(settings::MQTT_USER, Value::String(mqtt_user));
    store.set_or_remove(settings::MQTT_PASS, Value::String(mqtt_pass));
    store.set_or_remove(settings::MQTT_TOPIC, Value::String(mqtt_topic));
    store.set(settings::MQTT_KEEPALIVE, mqtt_ka.into());

    device.enable_bus();
    device.render_settings();
    Ok(())
}

fn set_hostname(device: &mut Device, command: &Map<String, Value>) -> anyhow::Result<()> {
    let HostnameSettings { hostname } = payload(command)?;

    device.set_hostname(&hostname);
    device.render_settings();
    Ok(())
}
