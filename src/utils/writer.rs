use crate::types::HostEvent;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use tokio::sync::Mutex as TokioMutex;

/// Writes one JSON line per message.
/// Lets tests capture output instead of writing to stdout.
#[async_trait]
pub trait LineWriter: Send {
    /// Write `line` plus a newline and flush.
    async fn write_line(&mut self, line: &str) -> Result<()>;
}

/// Writes lines to any async output, usually stdout.
pub struct StreamWriter<W> {
    out: W,
}

impl<W> StreamWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> LineWriter for StreamWriter<W> {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.out.write_all(line.as_bytes()).await?;
        self.out.write_all(b"\n").await?;
        self.out.flush().await?;
        Ok(())
    }
}

/// A host event tagged with the conversation it belongs to
#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "conversationId", skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    #[serde(flatten)]
    event: &'a HostEvent,
}

pub fn event_line(conversation_id: Option<&str>, event: &HostEvent) -> Result<String> {
    Ok(serde_json::to_string(&Envelope {
        conversation_id,
        event,
    })?)
}

/// Writes events from all running turns until every sender is gone.
pub async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<(String, HostEvent)>,
    mut writer: impl LineWriter,
) -> Result<()> {
    while let Some((conversation_id, event)) = rx.recv().await {
        let line = event_line(Some(&conversation_id), &event)?;
        writer.write_line(&line).await?;
    }
    Ok(())
}

/// Captures lines for assertions.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MockWriter {
    pub lines: Arc<TokioMutex<Vec<String>>>,
}

#[cfg(test)]
impl MockWriter {
    pub async fn get_lines(&self) -> Vec<String> {
        self.lines.lock().await.clone()
    }
}

#[cfg(test)]
#[async_trait]
impl LineWriter for MockWriter {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        self.lines.lock().await.push(line.to_string());
        Ok(())
    }
}
