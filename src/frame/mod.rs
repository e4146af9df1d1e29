//! Frames and the frame registry
//!
//! A frame is an immutable structured update. The registry maps opaque
//! handles to output channels ("sinks") and broadcasts frames to all of
//! them in registration order.

pub mod http;

use anyhow::Result;
use log::{debug, warn};
use serde::{Serialize, Serializer};
use serde_json::{Value, json};
use std::{collections::BTreeMap, fmt, sync::Arc};

pub const PKG: &str = "pkg";
pub const BLOCK: &str = "block";
pub const SECTION: &str = "section";

const PKG_VALUE: &str = "value";
const PKG_INTERFACE: &str = "interface";
const PKG_XLOAD: &str = "xload";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameKind {
    /// Value updates for already rendered controls.
    Value,
    /// Interface (UI structure) related updates.
    Interface,
    Other,
}

/// Structured update document, cheap to clone and shared read-only by all sinks.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    kind: FrameKind,
    payload: Arc<Value>,
}

impl Frame {
    /// Wrap a payload, deriving the kind from its `pkg` member.
    pub fn new(payload: Value) -> Self {
        let kind = match payload.get(PKG).and_then(Value::as_str) {
            Some(PKG_VALUE) => FrameKind::Value,
            Some(PKG_INTERFACE | PKG_XLOAD) => FrameKind::Interface,
            _ if payload.get(SECTION).is_some() => FrameKind::Interface,
            _ => FrameKind::Other,
        };

        Self {
            kind,
            payload: Arc::new(payload),
        }
    }

    /// A value frame carrying `block`.
    pub fn value(block: Value) -> Self {
        Self::new(json!({ PKG: PKG_VALUE, BLOCK: block }))
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The `block` member of the payload, `null` if absent.
    pub fn block(&self) -> &Value {
        self.payload.get(BLOCK).unwrap_or(&Value::Null)
    }
}

impl Serialize for Frame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.payload.serialize(serializer)
    }
}

/// Destination capable of receiving frames.
pub trait FrameSink: Send {
    fn send(&mut self, frame: &Frame) -> Result<()>;

    /// Short label used in log messages.
    fn label(&self) -> &str;
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FrameHandle(u64);

impl fmt::Display for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry of live sinks.
///
/// Handles grow monotonically and are never reused, so iterating in handle
/// order is iterating in registration order.
#[derive(Default)]
pub struct FrameRegistry {
    next: u64,
    sinks: BTreeMap<FrameHandle, Box<dyn FrameSink>>,
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: Box<dyn FrameSink>) -> FrameHandle {
        self.next += 1;
        let handle = FrameHandle(self.next);
        debug!("frames: add {} as {handle}", sink.label());
        self.sinks.insert(handle, sink);
        handle
    }

    /// Remove a sink. Unknown or already removed handles are ignored.
    pub fn remove(&mut self, handle: FrameHandle) -> bool {
        match self.sinks.remove(&handle) {
            Some(sink) => {
                debug!("frames: remove {} ({handle})", sink.label());
                true
            }
            None => false,
        }
    }

    /// Send `frame` to every sink. A failing sink is logged and skipped.
    ///
    /// Returns the number of sinks that accepted the frame.
    pub fn broadcast(&mut self, frame: &Frame) -> usize {
        let mut delivered = 0;

        for (handle, sink) in self.sinks.iter_mut() {
            match sink.send(frame) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("frames: send to {} ({handle}) failed: {e:#}", sink.label()),
            }
        }

        delivered
    }

    pub fn contains(&self, handle: FrameHandle) -> bool {
        self.sinks.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn labels(&self) -> Vec<&str> {
        self.sinks.values().map(|sink| sink.label()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        fail: bool,
        seen: Arc<Mutex<Vec<(&'static str, Value)>>>,
    }

    impl FrameSink for Recorder {
        fn send(&mut self, frame: &Frame) -> Result<()> {
            if self.fail {
                bail!("sink is broken");
            }
            self.seen
                .lock()
                .unwrap()
                .push((self.label, frame.payload().clone()));
            Ok(())
        }

        fn label(&self) -> &str {
            self.label
        }
    }

    fn recorder(
        label: &'static str,
        fail: bool,
        seen: &Arc<Mutex<Vec<(&'static str, Value)>>>,
    ) -> Box<dyn FrameSink> {
        Box::new(Recorder {
            label,
            fail,
            seen: seen.clone(),
        })
    }

    #[test]
    fn frame_kind_follows_pkg() {
        assert_eq!(Frame::value(json!({"x": 1})).kind(), FrameKind::Value);
        assert_eq!(
            Frame::new(json!({"pkg": "interface"})).kind(),
            FrameKind::Interface
        );
        assert_eq!(Frame::new(json!({"pkg": "xload"})).kind(), FrameKind::Interface);
        assert_eq!(
            Frame::new(json!({"section": "settings"})).kind(),
            FrameKind::Interface
        );
        assert_eq!(Frame::new(json!({"pkg": "toast"})).kind(), FrameKind::Other);
        assert_eq!(Frame::value(json!(42)).block(), &json!(42));
    }

    #[test]
    fn frame_serializes_as_payload() {
        let frame = Frame::value(json!({"relay": true}));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"pkg": "value", "block": {"relay": true}})
        );
    }

    #[test]
    fn handles_are_unique_and_never_reused() {
        let seen = Arc::default();
        let mut registry = FrameRegistry::new();

        let a = registry.add(recorder("a", false, &seen));
        assert!(registry.remove(a));
        let b = registry.add(recorder("b", false, &seen));

        assert_ne!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let seen = Arc::default();
        let mut registry = FrameRegistry::new();
        let keep = registry.add(recorder("keep", false, &seen));
        let handle = registry.add(recorder("gone", false, &seen));

        assert!(registry.remove(handle));
        assert!(!registry.remove(handle));
        assert!(!registry.remove(handle));

        assert!(registry.contains(keep));
        assert_eq!(registry.labels(), vec!["keep"]);
    }

    #[test]
    fn broadcast_skips_failing_sink_and_keeps_order() {
        let seen = Arc::default();
        let mut registry = FrameRegistry::new();
        registry.add(recorder("first", false, &seen));
        registry.add(recorder("broken", true, &seen));
        registry.add(recorder("third", false, &seen));

        let frame = Frame::value(json!({"t": 21.5}));
        assert_eq!(registry.broadcast(&frame), 2);

        let seen = seen.lock().unwrap();
        let labels: Vec<_> = seen.iter().map(|(label, _)| *label).collect();
        assert_eq!(labels, vec!["first", "third"]);
        assert!(seen.iter().all(|(_, payload)| payload == frame.payload()));
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn broadcast_to_empty_registry_is_harmless() {
        let mut registry = FrameRegistry::new();
        assert_eq!(registry.broadcast(&Frame::new(json!({}))), 0);
        assert!(registry.is_empty());
    }
}
