//! Device loop and its handle
//!
//! Platform adapters, the HTTP server and the bus transport run on their own
//! tasks and talk to the device only through [`DeviceEvent`]s.

use super::{Device, DeviceStatus};
use crate::{
    bus::{BusEvent, SessionEventSink, SessionId},
    frame::Frame,
    scheduler::Scheduled,
    wifi::radio::LinkEvent,
};
use anyhow::Result;
use log::debug;
use serde_json::{Map, Value};
use std::{fmt, sync::Arc};
use tokio::{
    sync::{mpsc, oneshot},
    time::{Instant, sleep_until},
};

pub enum DeviceEvent {
    Link(LinkEvent),
    Bus {
        session: SessionId,
        event: BusEvent,
    },
    /// Command on behalf of an HTTP request.
    Api {
        command: Value,
        reply: oneshot::Sender<Result<Option<Frame>>>,
    },
    Status(oneshot::Sender<DeviceStatus>),
    /// Settings with secrets redacted.
    Settings(oneshot::Sender<Map<String, Value>>),
    Shutdown,
}

/// The device loop has stopped.
#[derive(Debug)]
pub struct DeviceGone;

impl fmt::Display for DeviceGone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device loop is gone")
    }
}

impl std::error::Error for DeviceGone {}

/// Cloneable sender side of the device loop.
#[derive(Clone, Debug)]
pub struct DeviceHandle {
    tx: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceHandle {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: DeviceEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| DeviceGone)?;
        Ok(())
    }

    pub fn link(&self, event: LinkEvent) -> Result<()> {
        self.send(DeviceEvent::Link(event))
    }

    /// Bus events delivered into the device loop.
    pub fn bus_events(&self) -> SessionEventSink {
        let tx = self.tx.clone();
        Arc::new(move |session: SessionId, event: BusEvent| {
            if tx.send(DeviceEvent::Bus { session, event }).is_err() {
                debug!("bus: event dropped, device loop is gone");
            }
        })
    }

    /// Run `command` and return the first frame it produced.
    ///
    /// Fails with [`DeviceGone`] when the loop has stopped.
    pub async fn post(&self, command: Value) -> Result<Option<Frame>> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceEvent::Api { command, reply })?;
        rx.await.map_err(|_| DeviceGone)?
    }

    pub async fn status(&self) -> Result<DeviceStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceEvent::Status(reply))?;
        Ok(rx.await.map_err(|_| DeviceGone)?)
    }

    pub async fn settings(&self) -> Result<Map<String, Value>> {
        let (reply, rx) = oneshot::channel();
        self.send(DeviceEvent::Settings(reply))?;
        Ok(rx.await.map_err(|_| DeviceGone)?)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(DeviceEvent::Shutdown)
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drive `device` until shutdown is requested or every handle is dropped.
///
/// Due timers run before the next event is taken. The device is torn down
/// before this returns.
pub async fn run(mut device: Device, mut events: mpsc::UnboundedReceiver<DeviceEvent>) {
    loop {
        device.run_pending();

        let event = tokio::select! {
            biased;
            _ = wait_for(device.timers().next_deadline()) => continue,
            event = events.recv() => event,
        };

        match event {
            Some(DeviceEvent::Shutdown) => {
                debug!("device shutdown requested");
                break;
            }
            Some(event) => device.handle_event(event),
            None => {
                debug!("all device handles dropped");
                break;
            }
        }
    }

    device.shutdown();
}
