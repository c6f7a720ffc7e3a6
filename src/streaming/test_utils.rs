//! Shared helpers for the streaming processor tests

use super::{MermaidFenceRenderer, PatchStreamProcessor, StreamConfig};
use crate::context::SnapshotSet;
use crate::events::{EventSink, SinkError};
use crate::types::{FileSnapshot, HostEvent};
use std::sync::{Arc, Mutex};

/// A sink that records events and merges adjacent deltas
#[derive(Clone, Default)]
pub struct TestSink {
    events: Arc<Mutex<Vec<HostEvent>>>,
    raw_events: Arc<Mutex<Vec<HostEvent>>>,
}

impl TestSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_events(&self) -> Vec<HostEvent> {
        self.events.lock().unwrap().clone()
    }

    // Unmerged, in emission order
    pub fn get_raw_events(&self) -> Vec<HostEvent> {
        self.raw_events.lock().unwrap().clone()
    }

    /// All forwarded prose, concatenated
    pub fn visible_text(&self) -> String {
        self.get_raw_events()
            .into_iter()
            .filter_map(|event| match event {
                HostEvent::Delta { text } => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for TestSink {
    fn emit(&self, event: HostEvent) -> Result<(), SinkError> {
        self.raw_events.lock().unwrap().push(event.clone());

        let mut guard = self.events.lock().unwrap();
        if let (Some(HostEvent::Delta { text: last }), HostEvent::Delta { text }) =
            (guard.last_mut(), &event)
        {
            last.push_str(text);
            return Ok(());
        }
        guard.push(event);
        Ok(())
    }
}

/// Split text into chunks of `chunk_size` characters
pub fn chunk_str(s: &str, chunk_size: usize) -> Vec<String> {
    let chars: Vec<char> = s.chars().collect();
    chars
        .chunks(chunk_size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

pub fn snapshots(files: &[(&str, &str)]) -> SnapshotSet {
    SnapshotSet::new(files.iter().map(|(path, content)| FileSnapshot {
        file_path: path.to_string(),
        content: content.to_string(),
    }))
}

pub fn processor(sink: &TestSink, snapshots: SnapshotSet, config: StreamConfig) -> PatchStreamProcessor {
    PatchStreamProcessor::new(
        Arc::new(sink.clone()),
        Arc::new(MermaidFenceRenderer),
        snapshots,
        config,
    )
}

pub fn delta(text: &str) -> HostEvent {
    HostEvent::Delta {
        text: text.to_string(),
    }
}

#[allow(dead_code)]
pub fn print_events(events: &[HostEvent]) {
    println!("Collected {} events:", events.len());
    for (i, event) in events.iter().enumerate() {
        println!("  [{i}] {event:?}");
    }
}
