use crate::types::HostEvent;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("event consumer is gone")]
    Closed,
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Receives the ordered events of a turn.
///
/// Called synchronously from the single task that drives the turn, so
/// implementations only need to preserve call order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: HostEvent) -> Result<(), SinkError>;
}

/// Forwards events into a channel, tagged with the conversation they belong to.
pub struct ChannelSink {
    conversation_id: String,
    tx: mpsc::UnboundedSender<(String, HostEvent)>,
}

impl ChannelSink {
    pub fn new(conversation_id: String, tx: mpsc::UnboundedSender<(String, HostEvent)>) -> Self {
        Self {
            conversation_id,
            tx,
        }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: HostEvent) -> Result<(), SinkError> {
        self.tx
            .send((self.conversation_id.clone(), event))
            .map_err(|_| SinkError::Closed)
    }
}
