//! Transient HTTP channel
//!
//! One in-flight API request is wrapped as a single-use sink. It is
//! registered for exactly one command invocation and removed again when the
//! [`Registration`] guard goes out of scope.

use super::{Frame, FrameHandle, FrameSink};
use crate::device::Device;
use anyhow::{Result, bail};
use std::ops::{Deref, DerefMut};
use tokio::sync::oneshot;

/// Sink answering a single HTTP request with the first frame it receives.
pub struct HttpResponseSink {
    responder: Option<oneshot::Sender<Frame>>,
}

impl HttpResponseSink {
    pub fn new(responder: oneshot::Sender<Frame>) -> Self {
        Self {
            responder: Some(responder),
        }
    }
}

impl FrameSink for HttpResponseSink {
    fn send(&mut self, frame: &Frame) -> Result<()> {
        let Some(responder) = self.responder.take() else {
            bail!("response already sent");
        };

        if responder.send(frame.clone()).is_err() {
            bail!("request is gone");
        }

        Ok(())
    }

    fn label(&self) -> &str {
        "http"
    }
}

/// Keeps a sink registered on a device for as long as the guard lives.
pub struct Registration<'a> {
    device: &'a mut Device,
    handle: FrameHandle,
}

impl<'a> Registration<'a> {
    pub fn new(device: &'a mut Device, sink: Box<dyn FrameSink>) -> Self {
        let handle = device.frames_mut().add(sink);
        Self { device, handle }
    }

    pub fn handle(&self) -> FrameHandle {
        self.handle
    }
}

impl Deref for Registration<'_> {
    type Target = Device;

    fn deref(&self) -> &Device {
        self.device
    }
}

impl DerefMut for Registration<'_> {
    fn deref_mut(&mut self) -> &mut Device {
        self.device
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.device.frames_mut().remove(self.handle);
    }
}
