//! Message-bus adapter
//!
//! Keeps at most one broker session. While connected the session is
//! registered as a frame sink; inbound command messages are decoded into
//! owned command documents that the device runs later.

pub mod mqtt;
pub mod transport;

use crate::{
    device::Device,
    frame::{Frame, FrameHandle, FrameKind, FrameRegistry, FrameSink},
    scheduler::{Purpose, Scheduler},
    settings::{self, SettingsExt, SettingsStore},
};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
pub use transport::{
    BusEvent, BusEventSink, BusMessage, BusTransport, SessionEventSink, SessionId, TransportFactory,
};

/// Interval of connect attempts while disconnected.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_KEEPALIVE: u16 = 30;
const DEFAULT_TOPIC: &str = "EmbUI/$id/";
const ID_PLACEHOLDER: &str = "$id";

const TOPIC_SET: &str = "set/";
const TOPIC_GET: &str = "get/";
const TOPIC_POST: &str = "post";
const TOPIC_VALUE: &str = "pub/value";
const TOPIC_INTERFACE: &str = "pub/interface";
const TOPIC_ETC: &str = "pub/etc";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BusState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BusOptions {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Always ends with `/`.
    pub topic_prefix: String,
    pub keepalive: Duration,
    pub client_id: String,
}

impl BusOptions {
    /// Options from settings, `None` when the bus is disabled or has no host.
    pub fn from_settings(settings: &dyn SettingsStore, id: &str, hostname: &str) -> Option<Self> {
        if !settings.flag(settings::MQTT_ENABLE) {
            return None;
        }

        let Some(host) = settings.string(settings::MQTT_HOST) else {
            debug!("bus: enabled without broker host");
            return None;
        };

        let port = settings
            .number(settings::MQTT_PORT)
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port != 0)
            .unwrap_or(DEFAULT_PORT);

        let keepalive = settings
            .number(settings::MQTT_KEEPALIVE)
            .and_then(|ka| u16::try_from(ka).ok())
            .unwrap_or(DEFAULT_KEEPALIVE);

        let topic = settings
            .string(settings::MQTT_TOPIC)
            .unwrap_or_else(|| DEFAULT_TOPIC.to_string());

        let uuid = uuid::Uuid::new_v4().simple().to_string();

        Some(Self {
            host,
            port,
            user: settings.string(settings::MQTT_USER),
            password: settings.string(settings::MQTT_PASS),
            topic_prefix: topic_prefix(&topic, id),
            keepalive: Duration::from_secs(keepalive.into()),
            client_id: format!("{hostname}-{}", &uuid[..8]),
        })
    }
}

fn topic_prefix(topic: &str, id: &str) -> String {
    let mut prefix = topic.replace(ID_PLACEHOLDER, id);
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

/// Decode an inbound message into a command document.
///
/// `set/` and `get/` topics inject the underscore-joined remainder of the
/// topic as `action`. Returns `None` for messages that are dropped.
pub fn decode_command(prefix: &str, message: &BusMessage) -> Option<Value> {
    let topic = &message.topic;

    if message.is_chunked() {
        warn!("bus: chunked message on {topic} not supported");
        return None;
    }

    let Some(suffix) = topic.strip_prefix(prefix) else {
        debug!("bus: ignore message on foreign topic {topic}");
        return None;
    };

    let mut command: Map<String, Value> = match serde_json::from_slice(&message.payload) {
        Ok(Value::Object(command)) => command,
        Ok(_) => {
            warn!("bus: payload on {topic} is not an object");
            return None;
        }
        Err(e) => {
            warn!("bus: malformed payload on {topic}: {e}");
            return None;
        }
    };

    if let Some(path) = suffix
        .strip_prefix(TOPIC_SET)
        .or_else(|| suffix.strip_prefix(TOPIC_GET))
    {
        let action = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("_");

        if action.is_empty() {
            warn!("bus: no action in topic {topic}");
            return None;
        }

        command.insert("action".to_string(), Value::String(action));
    }

    Some(Value::Object(command))
}

/// Frame sink publishing to the broker.
struct BusSink {
    transport: Arc<dyn BusTransport>,
    prefix: String,
}

impl FrameSink for BusSink {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        let (suffix, body) = match frame.kind() {
            FrameKind::Value => (TOPIC_VALUE, frame.block()),
            FrameKind::Interface => (TOPIC_INTERFACE, frame.payload()),
            FrameKind::Other => (TOPIC_ETC, frame.payload()),
        };

        let payload = serde_json::to_vec(body).context("failed to serialize frame")?;
        self.transport
            .publish(&format!("{}{suffix}", self.prefix), &payload, false)
    }

    fn label(&self) -> &str {
        "bus"
    }
}

struct BusSession {
    id: SessionId,
    options: BusOptions,
    state: BusState,
    transport: Arc<dyn BusTransport>,
    channel: Option<FrameHandle>,
}

pub struct BusAdapter {
    transports: TransportFactory,
    status_interval: Duration,
    next_session: SessionId,
    session: Option<BusSession>,
}

impl BusAdapter {
    pub fn new(transports: TransportFactory, status_interval: Duration) -> Self {
        Self {
            transports,
            status_interval,
            next_session: 1,
            session: None,
        }
    }

    pub fn state(&self) -> BusState {
        self.session
            .as_ref()
            .map_or(BusState::Disconnected, |session| session.state)
    }

    pub fn is_enabled(&self) -> bool {
        self.session.is_some()
    }

    /// Identity of the current session.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|session| session.id)
    }

    pub fn options(&self) -> Option<&BusOptions> {
        self.session.as_ref().map(|session| &session.options)
    }

    /// Handle of the registered bus sink, present only while connected.
    pub fn channel(&self) -> Option<FrameHandle> {
        self.session.as_ref().and_then(|session| session.channel)
    }

    /// Replace the session and start connecting.
    pub fn enable(
        &mut self,
        scheduler: &mut Scheduler<Device>,
        frames: &mut FrameRegistry,
        options: BusOptions,
    ) {
        self.disable(scheduler, frames);

        info!(
            "bus: enable {}:{} as {} (prefix {})",
            options.host, options.port, options.client_id, options.topic_prefix
        );

        let id = self.next_session;
        self.next_session += 1;

        self.session = Some(BusSession {
            id,
            options,
            state: BusState::Disconnected,
            transport: (self.transports)(id),
            channel: None,
        });

        arm_reconnect(scheduler);
        scheduler.defer(|device: &mut Device| device.reconnect_bus());
    }

    pub fn disable(&mut self, scheduler: &mut Scheduler<Device>, frames: &mut FrameRegistry) {
        scheduler.cancel(Purpose::BusReconnect);
        scheduler.cancel(Purpose::BusStatus);

        let Some(session) = self.session.take() else {
            return;
        };

        if let Some(handle) = session.channel {
            frames.remove(handle);
        }
        session.transport.disconnect();

        info!("bus: disabled");
    }

    /// Connect attempt, skipped while connected or with the client radio off.
    pub fn reconnect(&mut self, client_mode: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if session.state == BusState::Connected {
            return;
        }

        if !client_mode {
            debug!("bus: client radio off, skip connect");
            return;
        }

        debug!(
            "bus: connect to {}:{}",
            session.options.host, session.options.port
        );
        session.state = BusState::Connecting;

        if let Err(e) = session.transport.connect(&session.options) {
            warn!("bus: connect failed: {e:#}");
            session.state = BusState::Disconnected;
        }
    }

    /// Current session, `None` for events of a replaced or closed one.
    fn session_mut(&mut self, id: SessionId) -> Option<&mut BusSession> {
        match self.session.as_mut() {
            Some(session) if session.id == id => Some(session),
            _ => {
                debug!("bus: ignore event of stale session {id}");
                None
            }
        }
    }

    /// Returns whether the current session took the connection.
    pub fn on_connected(
        &mut self,
        scheduler: &mut Scheduler<Device>,
        frames: &mut FrameRegistry,
        id: SessionId,
    ) -> bool {
        let status_interval = self.status_interval;
        let Some(session) = self.session_mut(id) else {
            return false;
        };

        info!("bus: connected to {}", session.options.host);
        session.state = BusState::Connected;
        scheduler.cancel(Purpose::BusReconnect);

        let prefix = &session.options.topic_prefix;
        for filter in [
            format!("{prefix}{TOPIC_SET}#"),
            format!("{prefix}{TOPIC_GET}#"),
            format!("{prefix}{TOPIC_POST}"),
        ] {
            if let Err(e) = session.transport.subscribe(&filter) {
                warn!("bus: subscribe to {filter} failed: {e:#}");
            }
        }

        if session.channel.is_none() {
            session.channel = Some(frames.add(Box::new(BusSink {
                transport: session.transport.clone(),
                prefix: prefix.clone(),
            })));
        }

        scheduler.every(
            Purpose::BusStatus,
            status_interval,
            |device: &mut Device| device.publish_bus_status(),
        );

        true
    }

    pub fn on_disconnected(
        &mut self,
        scheduler: &mut Scheduler<Device>,
        frames: &mut FrameRegistry,
        id: SessionId,
        reason: &str,
    ) {
        let Some(session) = self.session_mut(id) else {
            return;
        };

        if session.state == BusState::Connected {
            info!("bus: disconnected: {reason}");
        } else {
            debug!("bus: connect failed: {reason}");
        }

        session.state = BusState::Disconnected;
        if let Some(handle) = session.channel.take() {
            frames.remove(handle);
        }

        scheduler.cancel(Purpose::BusStatus);
        if !scheduler.is_pending(Purpose::BusReconnect) {
            arm_reconnect(scheduler);
        }
    }

    /// Decode an inbound message against the session prefix.
    pub fn on_message(&mut self, id: SessionId, message: &BusMessage) -> Option<Value> {
        let session = self.session_mut(id)?;
        decode_command(&session.options.topic_prefix, message)
    }

    /// Publish `payload` under the topic prefix. No-op unless connected.
    pub fn publish(&self, topic: &str, payload: &str, retained: bool) -> bool {
        self.publish_bytes(topic, payload.as_bytes(), retained)
    }

    /// Publish a serialized document under the topic prefix. No-op unless
    /// connected.
    pub fn publish_json(&self, topic: &str, payload: &Value, retained: bool) -> bool {
        match serde_json::to_vec(payload) {
            Ok(bytes) => self.publish_bytes(topic, &bytes, retained),
            Err(e) => {
                warn!("bus: failed to serialize {topic}: {e}");
                false
            }
        }
    }

    fn publish_bytes(&self, topic: &str, payload: &[u8], retained: bool) -> bool {
        let Some(session) = self
            .session
            .as_ref()
            .filter(|session| session.state == BusState::Connected)
        else {
            return false;
        };

        let topic = format!("{}{topic}", session.options.topic_prefix);
        match session.transport.publish(&topic, payload, retained) {
            Ok(()) => true,
            Err(e) => {
                warn!("bus: publish to {topic} failed: {e:#}");
                false
            }
        }
    }
}

fn arm_reconnect(scheduler: &mut Scheduler<Device>) {
    scheduler.every(
        Purpose::BusReconnect,
        RECONNECT_INTERVAL,
        |device: &mut Device| device.reconnect_bus(),
    );
}
