//! Device context
//!
//! [`Device`] owns every component of the core and is handed by `&mut` to
//! timer jobs, deferred work and event handlers. It is driven by exactly
//! one task (see [`driver::run`]).

pub mod actions;
pub mod driver;

use crate::{
    bus::{BusAdapter, BusEvent, BusOptions, BusState, SessionId, TransportFactory},
    config::AppConfig,
    frame::{
        Frame, FrameRegistry,
        http::{HttpResponseSink, Registration},
    },
    scheduler::{Scheduled, Scheduler},
    settings::{self, SettingsExt, SettingsStore},
    wifi::{
        ConnectivityConfig, ConnectivityState, WifiManager, WifiTiming,
        radio::{Credentials, LinkEventKind, NameService, Radio},
        sanitize_passphrase,
    },
};
use actions::{NetworkSettingsPage, SettingsPage};
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{collections::HashMap, net::Ipv4Addr, time::Duration};
use tokio::{sync::oneshot, time::Instant};

pub use driver::{DeviceEvent, DeviceGone, DeviceHandle, run};

/// Version of the command interface announced on the bus.
pub const API_VERSION: &str = "2";

/// Handler of one named command.
pub type Action = fn(&mut Device, &Map<String, Value>) -> Result<()>;

/// External collaborators a device is built from.
pub struct Collaborators {
    pub settings: Box<dyn SettingsStore>,
    pub radio: Box<dyn Radio>,
    pub names: Box<dyn NameService>,
    pub transports: TransportFactory,
}

#[derive(Clone, Debug)]
pub struct DeviceOptions {
    pub hostname_prefix: String,
    pub timing: WifiTiming,
    pub status_interval: Duration,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            hostname_prefix: "netdev".to_string(),
            timing: WifiTiming::default(),
            status_interval: Duration::from_secs(60),
        }
    }
}

impl From<&AppConfig> for DeviceOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            hostname_prefix: config.hostname_prefix.clone(),
            timing: WifiTiming {
                connect_timeout: config.wifi.connect_timeout,
                reconnect_interval: config.wifi.reconnect_interval,
            },
            status_interval: config.bus.status_interval,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub id: String,
    pub hostname: String,
    pub connectivity: ConnectivityState,
    pub bus: BusState,
    pub access_point: bool,
    pub address: Option<Ipv4Addr>,
    /// Unknown routes redirect to the portal.
    pub captive_portal: bool,
    pub uptime_secs: u64,
}

/// Upper-case hex of the last three MAC bytes.
fn device_id(mac: &[u8; 6]) -> String {
    format!("{:02X}{:02X}{:02X}", mac[3], mac[4], mac[5])
}

/// Remove a stored access-point passphrase the radio would refuse.
fn discard_short_ap_passphrase(store: &mut dyn SettingsStore) {
    let short = store
        .string(settings::AP_PASSPHRASE)
        .is_some_and(|passphrase| sanitize_passphrase(Some(passphrase)).is_none());
    if short {
        store.remove(settings::AP_PASSPHRASE);
    }
}

pub struct Device {
    pub(crate) scheduler: Scheduler<Device>,
    pub(crate) wifi: WifiManager,
    pub(crate) frames: FrameRegistry,
    pub(crate) bus: BusAdapter,
    settings: Box<dyn SettingsStore>,
    actions: HashMap<String, Action>,
    settings_page: Box<dyn SettingsPage>,
    id: String,
    options: DeviceOptions,
    started: Instant,
}

impl Scheduled for Device {
    fn scheduler(&mut self) -> &mut Scheduler<Self> {
        &mut self.scheduler
    }
}

impl Device {
    pub fn new(collaborators: Collaborators, options: DeviceOptions) -> Self {
        let Collaborators {
            mut settings,
            radio,
            names,
            transports,
        } = collaborators;

        discard_short_ap_passphrase(settings.as_mut());

        let id = device_id(&radio.mac_address());
        let hostname = hostname(settings.as_ref(), &options.hostname_prefix, &id);
        let config = ConnectivityConfig::from_settings(settings.as_ref(), hostname, options.timing);

        info!("device {id} named {}", config.hostname);

        Self {
            scheduler: Scheduler::new(),
            wifi: WifiManager::new(config, radio, names),
            frames: FrameRegistry::new(),
            bus: BusAdapter::new(transports, options.status_interval),
            settings,
            actions: actions::builtin(),
            settings_page: Box::new(NetworkSettingsPage),
            id,
            options,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.wifi.config().hostname
    }

    pub fn state(&self) -> ConnectivityState {
        self.wifi.state()
    }

    pub fn wifi(&self) -> &WifiManager {
        &self.wifi
    }

    pub fn bus(&self) -> &BusAdapter {
        &self.bus
    }

    pub fn frames(&self) -> &FrameRegistry {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameRegistry {
        &mut self.frames
    }

    pub fn timers(&self) -> &Scheduler<Device> {
        &self.scheduler
    }

    pub fn settings(&self) -> &dyn SettingsStore {
        self.settings.as_ref()
    }

    pub fn settings_mut(&mut self) -> &mut dyn SettingsStore {
        self.settings.as_mut()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn set_settings_page(&mut self, page: Box<dyn SettingsPage>) {
        self.settings_page = page;
    }

    /// Register `action` under `name`, replacing a previous handler.
    pub fn register_action(&mut self, name: &str, action: Action) {
        self.actions.insert(name.to_string(), action);
    }

    pub fn start(&mut self) {
        info!("starting device {}", self.id);
        self.wifi.start(&mut self.scheduler);
        self.enable_bus();
    }

    /// Tear down all components. Pending timers are dropped.
    pub fn shutdown(&mut self) {
        info!("stopping device {}", self.id);
        self.wifi.shutdown(&mut self.scheduler);
        self.bus.disable(&mut self.scheduler, &mut self.frames);
        self.scheduler.clear();
    }

    pub fn handle_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Link(event) => match event.kind {
                LinkEventKind::LinkUp => self.link_up(event.address),
                LinkEventKind::LinkDown => self.link_down(event.reason),
                LinkEventKind::ModeChanged => self.wifi.on_mode_changed(),
            },
            DeviceEvent::Bus { session, event } => self.handle_bus_event(session, event),
            DeviceEvent::Api { command, reply } => {
                let result = self.handle_api(command);
                if let Err(e) = &result {
                    warn!("api: command rejected: {e:#}");
                }
                if reply.send(result).is_err() {
                    debug!("api: request is gone");
                }
            }
            DeviceEvent::Status(reply) => {
                if reply.send(self.status()).is_err() {
                    debug!("api: status request is gone");
                }
            }
            DeviceEvent::Settings(reply) => {
                if reply.send(self.settings.redacted()).is_err() {
                    debug!("api: settings request is gone");
                }
            }
            DeviceEvent::Shutdown => self.shutdown(),
        }
    }

    pub fn link_up(&mut self, address: Option<Ipv4Addr>) {
        self.wifi.on_link_up(&mut self.scheduler, address);

        if self.state() == ConnectivityState::ClientConnected
            && self.bus.is_enabled()
            && self.bus.state() != BusState::Connected
        {
            self.scheduler
                .defer(|device: &mut Device| device.reconnect_bus());
        }
    }

    pub fn link_down(&mut self, reason: Option<u16>) {
        self.wifi.on_link_down(&mut self.scheduler, reason);
    }

    pub fn force_ap(&mut self) {
        self.wifi.force_ap(&mut self.scheduler);
    }

    pub fn set_ap_only(&mut self, ap_only: bool) {
        self.settings.set(settings::AP_ONLY, Value::Bool(ap_only));
        self.wifi.set_ap_only(&mut self.scheduler, ap_only);
    }

    pub fn connect(&mut self, credentials: Option<Credentials>) {
        self.settings.set(settings::AP_ONLY, Value::Bool(false));
        self.wifi.connect(&mut self.scheduler, credentials);
    }

    /// Store the hostname override, an empty name restores the generated one.
    pub fn set_hostname(&mut self, name: &str) {
        self.settings
            .set_or_remove(settings::HOSTNAME, Value::String(name.to_string()));

        let hostname = hostname(self.settings.as_ref(), &self.options.hostname_prefix, &self.id);
        info!("hostname is {hostname}");
        self.wifi.set_hostname(&mut self.scheduler, hostname);
    }

    /// Re-read the connectivity settings and apply them.
    pub fn reload_connectivity(&mut self) {
        let config = ConnectivityConfig::from_settings(
            self.settings.as_ref(),
            self.hostname().to_string(),
            self.options.timing,
        );
        self.wifi.reconfigure(&mut self.scheduler, config);
    }

    /// Start the bus from settings, or stop it when it is not configured.
    pub fn enable_bus(&mut self) {
        match BusOptions::from_settings(self.settings.as_ref(), &self.id, self.hostname()) {
            Some(options) => self.bus.enable(&mut self.scheduler, &mut self.frames, options),
            None => {
                debug!("bus: not configured");
                self.disable_bus();
            }
        }
    }

    pub fn disable_bus(&mut self) {
        self.bus.disable(&mut self.scheduler, &mut self.frames);
    }

    pub(crate) fn reconnect_bus(&mut self) {
        let client_mode = self.wifi.client_mode();
        self.bus.reconnect(client_mode);
    }

    pub(crate) fn publish_bus_status(&mut self) {
        self.bus
            .publish("sys/uptime", &self.uptime().as_secs().to_string(), false);

        if let Some(rssi) = self.wifi.radio().rssi() {
            self.bus.publish("sys/rssi", &rssi.to_string(), false);
        }
    }

    fn publish_bus_facts(&self) {
        let address = self
            .wifi
            .address()
            .map(|address| address.to_string())
            .unwrap_or_default();

        self.bus.publish("sys/hostname", self.hostname(), true);
        self.bus.publish("sys/ip", &address, true);
        self.bus.publish("sys/uiver", env!("CARGO_PKG_VERSION"), true);
        self.bus.publish("sys/uijsapi", API_VERSION, true);
    }

    /// Apply an event of bus session `session`. Events of replaced sessions
    /// are dropped.
    pub fn handle_bus_event(&mut self, session: SessionId, event: BusEvent) {
        match event {
            BusEvent::Connected => {
                if self
                    .bus
                    .on_connected(&mut self.scheduler, &mut self.frames, session)
                {
                    self.publish_bus_facts();
                }
            }
            BusEvent::Disconnected(reason) => self.bus.on_disconnected(
                &mut self.scheduler,
                &mut self.frames,
                session,
                &reason,
            ),
            BusEvent::Message(message) => {
                let Some(command) = self.bus.on_message(session, &message) else {
                    return;
                };

                self.scheduler.defer(move |device: &mut Device| {
                    if let Err(e) = device.post(command) {
                        warn!("bus: command rejected: {e:#}");
                    }
                });
            }
        }
    }

    /// Run a command document through its registered action.
    ///
    /// Unknown actions are logged and ignored.
    pub fn post(&mut self, command: Value) -> Result<()> {
        let Value::Object(command) = command else {
            bail!("command is not an object");
        };

        let action = command
            .get("action")
            .and_then(Value::as_str)
            .context("command without action")?;

        let Some(handler) = self.actions.get(action).copied() else {
            warn!("unknown action: {action}");
            return Ok(());
        };

        debug!("run action {action}");
        handler(self, &command).context(format!("action {action} failed"))
    }

    /// Run a command on behalf of one HTTP request.
    ///
    /// Returns the first frame produced while the command ran.
    pub fn handle_api(&mut self, command: Value) -> Result<Option<Frame>> {
        let (tx, mut rx) = oneshot::channel();

        {
            let mut request = Registration::new(self, Box::new(HttpResponseSink::new(tx)));
            debug!("api: request registered as {}", request.handle());
            request.post(command)?;
        }

        Ok(rx.try_recv().ok())
    }

    pub fn broadcast(&mut self, frame: &Frame) -> usize {
        self.frames.broadcast(frame)
    }

    /// Render the settings page and broadcast it.
    pub fn render_settings(&mut self) -> usize {
        let frame = self.settings_page.render(self);
        self.broadcast(&frame)
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus {
            id: self.id.clone(),
            hostname: self.hostname().to_string(),
            connectivity: self.state(),
            bus: self.bus.state(),
            access_point: self.wifi.access_point_active(),
            address: self.wifi.address(),
            captive_portal: self.wifi.access_point_active()
                && !self.settings.flag(settings::NO_CAPTIVE_PORTAL),
            uptime_secs: self.uptime().as_secs(),
        }
    }
}

/// Hostname override from settings or `<prefix>-<id>`.
fn hostname(settings: &dyn SettingsStore, prefix: &str, id: &str) -> String {
    settings
        .string(settings::HOSTNAME)
        .unwrap_or_else(|| format!("{prefix}-{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::device_with;
    use serde_json::json;

    #[test]
    fn id_from_mac() {
        assert_eq!(device_id(&[0, 1, 2, 0xa1, 0x0b, 0xc3]), "A10BC3");
    }

    #[test]
    fn hostname_override_or_generated() {
        let (device, _) = device_with(json!({}));
        assert_eq!(device.hostname(), "netdev-A1B2C3");

        let (device, _) = device_with(json!({"hostname": "lamp"}));
        assert_eq!(device.hostname(), "lamp");
    }

    #[tokio::test(start_paused = true)]
    async fn set_hostname_updates_radio_and_names() {
        let (mut device, fakes) = device_with(json!({"aponly": true}));
        device.start();

        device.set_hostname("desk");
        assert_eq!(device.hostname(), "desk");
        assert_eq!(fakes.radio().hostname.as_deref(), Some("desk"));
        assert_eq!(fakes.radio().ap_ssid.as_deref(), Some("desk"));
        assert_eq!(fakes.names().running.as_deref(), Some("desk"));

        device.set_hostname("");
        assert_eq!(device.hostname(), "netdev-A1B2C3");
        assert_eq!(device.settings().get(settings::HOSTNAME), None);
    }

    mod post {
        use super::*;

        fn record(device: &mut Device, command: &Map<String, Value>) -> Result<()> {
            device
                .settings_mut()
                .set("last", Value::Object(command.clone()));
            Ok(())
        }

        fn fail(_: &mut Device, _: &Map<String, Value>) -> Result<()> {
            bail!("not today")
        }

        #[test]
        fn dispatches_by_action() {
            let (mut device, _) = device_with(json!({}));
            device.register_action("record", record);

            device.post(json!({"action": "record", "n": 1})).unwrap();
            assert_eq!(
                device.settings().get("last"),
                Some(json!({"action": "record", "n": 1}))
            );
        }

        #[test]
        fn rejects_malformed_commands() {
            let (mut device, _) = device_with(json!({}));

            assert!(device.post(json!([1])).is_err());
            assert!(device.post(json!({"n": 1})).is_err());
            assert!(device.post(json!({"action": 3})).is_err());
        }

        #[test]
        fn ignores_unknown_action() {
            let (mut device, _) = device_with(json!({}));
            assert!(device.post(json!({"action": "nope"})).is_ok());
        }

        #[test]
        fn action_error_carries_context() {
            let (mut device, _) = device_with(json!({}));
            device.register_action("fail", fail);

            let err = device.post(json!({"action": "fail"})).unwrap_err();
            assert_eq!(format!("{err:#}"), "action fail failed: not today");
        }
    }

    mod api {
        use super::*;

        fn answer(device: &mut Device, _: &Map<String, Value>) -> Result<()> {
            device.broadcast(&Frame::value(json!({"first": true})));
            device.broadcast(&Frame::value(json!({"second": true})));
            Ok(())
        }

        fn silent(_: &mut Device, _: &Map<String, Value>) -> Result<()> {
            Ok(())
        }

        fn fail(device: &mut Device, _: &Map<String, Value>) -> Result<()> {
            assert_eq!(device.frames().labels(), vec!["http"]);
            bail!("rejected")
        }

        #[test]
        fn first_frame_answers_and_sink_is_removed() {
            let (mut device, _) = device_with(json!({}));
            device.register_action("answer", answer);

            let frame = device.handle_api(json!({"action": "answer"})).unwrap();

            assert_eq!(frame, Some(Frame::value(json!({"first": true}))));
            assert!(device.frames().is_empty());
        }

        #[test]
        fn no_frame_yields_none() {
            let (mut device, _) = device_with(json!({}));
            device.register_action("silent", silent);

            assert_eq!(device.handle_api(json!({"action": "silent"})).unwrap(), None);
            assert!(device.frames().is_empty());
        }

        #[test]
        fn sink_is_removed_on_error() {
            let (mut device, _) = device_with(json!({}));
            device.register_action("fail", fail);

            assert!(device.handle_api(json!({"action": "fail"})).is_err());
            assert!(device.frames().is_empty());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn status_reports_captive_portal() {
        let (mut device, _) = device_with(json!({"aponly": true}));
        device.start();
        assert!(device.status().captive_portal);
        assert!(device.status().access_point);

        let (mut device, _) = device_with(json!({"aponly": true, "nocaptp": "1"}));
        device.start();
        assert!(!device.status().captive_portal);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_leaves_no_pending_work() {
        let (mut device, _) = device_with(json!({
            "wcssid": "home", "mqtt_enable": true, "mqtt_host": "broker"
        }));
        device.start();
        device.shutdown();

        assert!(device.timers().is_idle());
        assert!(!device.bus().is_enabled());
        assert!(device.frames().is_empty());
    }

    #[test]
    fn stored_short_ap_passphrase_is_discarded() {
        let (device, _) = device_with(json!({"appwd": "1234567", "wcpass": "abc"}));
        assert_eq!(device.settings().get(settings::AP_PASSPHRASE), None);
        assert_eq!(device.settings().get(settings::CLIENT_PASSPHRASE), Some(json!("abc")));

        let (device, _) = device_with(json!({"appwd": "12345678"}));
        assert_eq!(
            device.settings().string(settings::AP_PASSPHRASE).as_deref(),
            Some("12345678")
        );
    }

    #[test]
    fn replies_to_gone_requests_are_dropped() {
        let (mut device, _) = device_with(json!({"hostname": "lamp"}));

        let (reply, request) = oneshot::channel();
        drop(request);
        device.handle_event(DeviceEvent::Status(reply));

        let (reply, request) = oneshot::channel();
        drop(request);
        device.handle_event(DeviceEvent::Settings(reply));

        let (reply, request) = oneshot::channel();
        drop(request);
        device.handle_event(DeviceEvent::Api {
            command: json!({"action": "shname", "hostname": "desk"}),
            reply,
        });

        assert_eq!(device.hostname(), "desk");
    }
}
