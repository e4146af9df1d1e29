use super::BusOptions;
use anyhow::Result;
#[cfg(feature = "mock")]
use mockall::automock;
use std::sync::Arc;

/// Inbound bus message, owned by the receiver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Offset of this chunk within the whole message.
    pub index: usize,
    /// Length of the whole message.
    pub total: usize,
}

impl BusMessage {
    /// A message delivered in one piece.
    pub fn complete(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            topic: topic.into(),
            total: payload.len(),
            payload,
            index: 0,
        }
    }

    pub fn is_chunked(&self) -> bool {
        self.index != 0 || self.payload.len() != self.total
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BusEvent {
    Connected,
    Disconnected(String),
    Message(BusMessage),
}

/// Identity of one bus session. Every enable starts a new one.
pub type SessionId = u64;

/// Receives the events of one transport, possibly from a foreign task.
pub type BusEventSink = Arc<dyn Fn(BusEvent) + Send + Sync>;

/// Receives transport events tagged with the session they belong to.
pub type SessionEventSink = Arc<dyn Fn(SessionId, BusEvent) + Send + Sync>;

/// Broker client.
///
/// Implementations report progress asynchronously through the event sink
/// they were created with. All calls return without waiting for the broker.
#[cfg_attr(feature = "mock", automock)]
pub trait BusTransport: Send + Sync {
    /// Start connecting, dropping a previous connection.
    fn connect(&self, options: &BusOptions) -> Result<()>;
    fn disconnect(&self);
    fn subscribe(&self, filter: &str) -> Result<()>;
    fn publish(&self, topic: &str, payload: &[u8], retained: bool) -> Result<()>;
}

/// Creates the transport of one bus session.
pub type TransportFactory = Box<dyn Fn(SessionId) -> Arc<dyn BusTransport> + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_message_is_not_chunked() {
        let message = BusMessage::complete("a/b", b"{}".to_vec());
        assert!(!message.is_chunked());

        let chunk = BusMessage {
            index: 2,
            ..message.clone()
        };
        assert!(chunk.is_chunked());

        let partial = BusMessage {
            total: 10,
            ..message
        };
        assert!(partial.is_chunked());
    }
}
