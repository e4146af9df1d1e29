//! MQTT transport on top of `rumqttc`
//!
//! The client event loop runs on its own task and reports through the
//! event sink; the device loop is never blocked by network I/O.

use super::{
    BusEvent, BusEventSink, BusMessage, BusOptions, BusTransport, SessionEventSink, SessionId,
    TransportFactory,
};
use anyhow::{Context, Result};
use log::{debug, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
};
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{runtime::Handle, task::JoinHandle, time::timeout};

const REQUEST_CAPACITY: usize = 10;
const MIN_KEEPALIVE: Duration = Duration::from_secs(5);
/// Time the poll task gets to flush a DISCONNECT before it is aborted.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

struct Link {
    client: AsyncClient,
    poller: JoinHandle<()>,
}

/// What the poll task does with one event loop result.
#[derive(Debug, PartialEq)]
enum Step {
    Continue,
    Report(BusEvent),
    Stop(Option<BusEvent>),
}

fn step(polled: Result<Event, ConnectionError>) -> Step {
    match polled {
        Ok(Event::Incoming(Packet::ConnAck(ack))) if ack.code == ConnectReturnCode::Success => {
            Step::Report(BusEvent::Connected)
        }
        Ok(Event::Incoming(Packet::ConnAck(ack))) => Step::Stop(Some(BusEvent::Disconnected(
            format!("connection refused: {:?}", ack.code),
        ))),
        // copied out of the client buffer before it leaves the poll task
        Ok(Event::Incoming(Packet::Publish(publish))) => Step::Report(BusEvent::Message(
            BusMessage::complete(publish.topic, publish.payload.to_vec()),
        )),
        Ok(Event::Incoming(Packet::Disconnect)) => Step::Stop(Some(BusEvent::Disconnected(
            "broker closed the connection".into(),
        ))),
        // our own DISCONNECT went out
        Ok(Event::Outgoing(Outgoing::Disconnect)) => Step::Stop(None),
        Ok(event) => {
            debug!("bus: {event:?}");
            Step::Continue
        }
        Err(e) => Step::Stop(Some(BusEvent::Disconnected(e.to_string()))),
    }
}

pub struct MqttTransport {
    events: BusEventSink,
    link: Mutex<Option<Link>>,
}

impl MqttTransport {
    pub fn new(events: BusEventSink) -> Self {
        Self {
            events,
            link: Mutex::new(None),
        }
    }

    /// Factory creating one transport per session, all reporting to
    /// `events` tagged with their session.
    pub fn factory(events: SessionEventSink) -> TransportFactory {
        Box::new(move |session: SessionId| {
            let events = events.clone();
            let sink: BusEventSink = Arc::new(move |event: BusEvent| events(session, event));
            Arc::new(MqttTransport::new(sink)) as Arc<dyn BusTransport>
        })
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Result<AsyncClient> {
        self.link()
            .as_ref()
            .map(|link| link.client.clone())
            .context("not connected")
    }
}

fn mqtt_options(options: &BusOptions) -> MqttOptions {
    let mut mqtt = MqttOptions::new(&options.client_id, &options.host, options.port);
    mqtt.set_keep_alive(options.keepalive.max(MIN_KEEPALIVE));

    if let Some(user) = &options.user {
        mqtt.set_credentials(user, options.password.clone().unwrap_or_default());
    }

    mqtt
}

impl BusTransport for MqttTransport {
    fn connect(&self, options: &BusOptions) -> Result<()> {
        self.disconnect();

        let (client, mut eventloop) = AsyncClient::new(mqtt_options(options), REQUEST_CAPACITY);
        let events = self.events.clone();

        let poller = tokio::spawn(async move {
            loop {
                match step(eventloop.poll().await) {
                    Step::Continue => {}
                    Step::Report(event) => events(event),
                    Step::Stop(event) => {
                        if let Some(event) = event {
                            events(event);
                        }
                        break;
                    }
                }
            }
        });

        *self.link() = Some(Link { client, poller });

        Ok(())
    }

    fn disconnect(&self) {
        let Some(Link { client, poller }) = self.link().take() else {
            return;
        };

        if let Err(e) = client.try_disconnect() {
            debug!("bus: disconnect request failed: {e}");
            poller.abort();
            return;
        }

        // a poller still waiting for the broker never sends the request
        let abort = poller.abort_handle();
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if timeout(DISCONNECT_GRACE, poller).await.is_err() {
                        debug!("bus: disconnect not flushed in time");
                        abort.abort();
                    }
                });
            }
            Err(_) => abort.abort(),
        }
    }

    fn subscribe(&self, filter: &str) -> Result<()> {
        self.client()?
            .try_subscribe(filter, QoS::AtMostOnce)
            .context(format!("failed to subscribe: {filter}"))
    }

    fn publish(&self, topic: &str, payload: &[u8], retained: bool) -> Result<()> {
        self.client()?
            .try_publish(topic, QoS::AtMostOnce, retained, payload.to_vec())
            .context(format!("failed to publish: {topic}"))
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if self.link().is_some() {
            warn!("bus: transport dropped while connected");
            self.disconnect();
        }
    }
}
