//! Feeds a recorded agent response through the streaming pipeline without
//! a live agent.

use crate::context::{parse_snapshots, SnapshotSet};
use crate::events::{EventSink, SinkError};
use crate::settings::HostSettings;
use crate::streaming::{MermaidFenceRenderer, PatchStreamProcessor, TurnOutcome};
use crate::types::{HostEvent, TurnAction};
use crate::utils::writer::event_line;
use crate::utils::{LineWriter, StreamWriter};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub transcript: PathBuf,
    /// User message whose `[Overleaf file: ...]` blocks provide the snapshots
    pub context: Option<PathBuf>,
    pub chunk_size: usize,
    pub action: TurnAction,
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<HostEvent>>,
}

impl EventSink for CollectingSink {
    fn emit(&self, event: HostEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Splits `text` into deltas of `chunk_size` characters. Zero keeps it whole.
fn deltas(text: &str, chunk_size: usize) -> Vec<&str> {
    if chunk_size == 0 {
        return vec![text];
    }
    let mut deltas = Vec::new();
    let mut start = 0;
    for (count, (index, _)) in text.char_indices().enumerate() {
        if count > 0 && count % chunk_size == 0 {
            deltas.push(&text[start..index]);
            start = index;
        }
    }
    if start < text.len() {
        deltas.push(&text[start..]);
    }
    deltas
}

/// Runs `transcript` through a processor and returns the events it produced.
pub fn replay_transcript(
    transcript: &str,
    snapshots: SnapshotSet,
    chunk_size: usize,
    action: TurnAction,
    settings: &HostSettings,
) -> Result<Vec<HostEvent>> {
    let sink = Arc::new(CollectingSink::default());
    let mut processor = PatchStreamProcessor::new(
        sink.clone(),
        Arc::new(MermaidFenceRenderer),
        snapshots,
        settings.stream_config(action),
    );
    for delta in deltas(transcript, chunk_size) {
        processor.push_delta(delta)?;
    }
    processor.finish(TurnOutcome::Completed { final_text: None })?;

    let events = std::mem::take(&mut *sink.events.lock().unwrap());
    Ok(events)
}

pub async fn replay(options: ReplayOptions, settings: &HostSettings) -> Result<()> {
    let transcript = std::fs::read_to_string(&options.transcript)
        .with_context(|| format!("Failed to read {}", options.transcript.display()))?;
    let snapshots = match &options.context {
        Some(path) => {
            let message = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            parse_snapshots(&message)
        }
        None => SnapshotSet::default(),
    };
    tracing::info!(
        "Replaying {} in chunks of {} with {} snapshot(s)",
        options.transcript.display(),
        options.chunk_size,
        snapshots.len()
    );

    let events = replay_transcript(
        &transcript,
        snapshots,
        options.chunk_size,
        options.action,
        settings,
    )?;

    let mut writer = StreamWriter::new(tokio::io::stdout());
    for event in &events {
        writer.write_line(&event_line(None, event)?).await?;
    }
    Ok(())
}
