use super::assembler::{PatchAssembler, PayloadError};
use super::diagram::{render_diagram, DiagramRenderer};
use super::fallback::extract_rewrite_fallback;
use super::markers::{self, PayloadKind};
use crate::context::SnapshotSet;
use crate::events::{EventSink, SinkError};
use crate::types::{DoneStatus, HostEvent, Patch, TurnAction};
use crate::utils::offsets::OffsetEncoding;
use std::sync::Arc;

pub const DEFAULT_HOLD_BACK_CHARS: usize = 32;
pub const DEFAULT_DIAGRAM_MAX_CHARS: usize = 20_000;

const FALLBACK_NOTE: &str =
    "\n\n_No rewrite markers were found; the suggested text was extracted on a best-effort basis._";
const NO_REWRITE_NOTE: &str = "\n\n_No rewrite could be extracted from the response._";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub hold_back_chars: usize,
    pub offset_encoding: OffsetEncoding,
    pub diagram_max_chars: usize,
    pub action: TurnAction,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            hold_back_chars: DEFAULT_HOLD_BACK_CHARS,
            offset_encoding: OffsetEncoding::default(),
            diagram_max_chars: DEFAULT_DIAGRAM_MAX_CHARS,
            action: TurnAction::Chat,
        }
    }
}

/// How the upstream agent call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The agent finished; `final_text` is its consolidated result if the
    /// backend reports one
    Completed { final_text: Option<String> },
    /// Interrupted by the user or a timeout
    Aborted { message: Option<String> },
    Failed { status: DoneStatus, message: String },
}

/// Observable phase of the stream, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Visible,
    PayloadBuffering,
    DiagramBuffering,
}

enum ScanMode {
    Visible,
    Payload {
        kind: PayloadKind,
        path: Option<String>,
    },
    Diagram,
}

/// Mutable per-turn buffering state
struct StreamBufferState {
    /// Received text not yet forwarded or resolved. In visible mode this is
    /// the hold-back window; inside a payload it is the body so far.
    pending: String,
    /// Bytes of `pending` already searched for a closer
    scanned: usize,
    mode: ScanMode,
    /// Drop a newline that directly follows a closer arriving in a later delta
    swallow_newline: bool,
    started: bool,
}

/// Drives one turn: forwards prose, extracts payloads, emits patches, and
/// finishes with exactly one `done` event.
///
/// Consumed by [`PatchStreamProcessor::finish`], so nothing can be emitted
/// after the terminal event.
pub struct PatchStreamProcessor {
    sink: Arc<dyn EventSink>,
    renderer: Arc<dyn DiagramRenderer>,
    assembler: PatchAssembler,
    config: StreamConfig,
    state: StreamBufferState,
    /// Every delta of the turn, the final-pass source when the backend
    /// reports no consolidated result
    transcript: String,
}

impl PatchStreamProcessor {
    pub fn new(
        sink: Arc<dyn EventSink>,
        renderer: Arc<dyn DiagramRenderer>,
        snapshots: SnapshotSet,
        config: StreamConfig,
    ) -> Self {
        Self {
            sink,
            renderer,
            assembler: PatchAssembler::new(snapshots, config.offset_encoding),
            config,
            state: StreamBufferState {
                pending: String::new(),
                scanned: 0,
                mode: ScanMode::Visible,
                swallow_newline: false,
                started: false,
            },
            transcript: String::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        if !self.state.started {
            return StreamPhase::Idle;
        }
        match self.state.mode {
            ScanMode::Visible => StreamPhase::Visible,
            ScanMode::Payload { .. } => StreamPhase::PayloadBuffering,
            ScanMode::Diagram => StreamPhase::DiagramBuffering,
        }
    }

    /// Feeds one text delta from the agent.
    pub fn push_delta(&mut self, text: &str) -> Result<(), SinkError> {
        self.state.started = true;
        if text.is_empty() {
            return Ok(());
        }
        self.transcript.push_str(text);
        self.state.pending.push_str(text);
        self.drain(false)
    }

    /// Forwards a tool progress notification.
    pub fn tool_event(&mut self, name: &str, phase: &str) -> Result<(), SinkError> {
        self.sink.emit(HostEvent::Plan {
            message: format!("{name} {phase}"),
            tool_name: Some(name.to_string()),
            phase: phase.to_string(),
        })
    }

    pub fn usage(&mut self, model: &str, used_tokens: u64, context_window: u64) -> Result<(), SinkError> {
        self.sink.emit(HostEvent::Usage {
            model: model.to_string(),
            used_tokens,
            context_window,
        })
    }

    /// Flushes what is buffered, runs the final pass when the agent
    /// completed, and emits the terminal `done` event.
    pub fn finish(mut self, outcome: TurnOutcome) -> Result<(), SinkError> {
        match outcome {
            TurnOutcome::Completed { final_text } => {
                self.flush()?;
                self.final_pass(final_text)?;
                self.sink.emit(HostEvent::Done {
                    status: DoneStatus::Ok,
                    message: None,
                })
            }
            TurnOutcome::Aborted { message } => {
                if !self.state.pending.is_empty() {
                    tracing::debug!(
                        "Discarding {} buffered bytes of aborted turn",
                        self.state.pending.len()
                    );
                }
                self.sink.emit(HostEvent::Done {
                    status: DoneStatus::Aborted,
                    message,
                })
            }
            TurnOutcome::Failed { status, message } => {
                self.flush()?;
                self.sink.emit(HostEvent::Done {
                    status,
                    message: Some(message),
                })
            }
        }
    }

    fn drain(&mut self, flushing: bool) -> Result<(), SinkError> {
        loop {
            let open_kind = match &self.state.mode {
                ScanMode::Visible => None,
                ScanMode::Payload { kind, .. } => Some(*kind),
                ScanMode::Diagram => Some(PayloadKind::DiagramFence),
            };

            if let Some(kind) = open_kind {
                if !self.close_if_complete(kind, flushing)? {
                    if !flushing {
                        return Ok(());
                    }
                    self.abandon_payload()?;
                }
                continue;
            }

            if self.state.swallow_newline && !self.state.pending.is_empty() {
                let rest = markers::strip_leading_newline(&self.state.pending).len();
                let consumed = self.state.pending.len() - rest;
                self.state.pending.drain(..consumed);
                self.state.swallow_newline = false;
            }

            if let Some(opener) = markers::find_opener(&self.state.pending) {
                let before: String = self.state.pending.drain(..opener.start).collect();
                self.emit_visible(before)?;
                self.state.pending.drain(..opener.end - opener.start);
                self.state.scanned = 0;
                self.open_payload(opener.kind, opener.path)?;
                continue;
            }

            let hold = if flushing {
                self.state.pending.len()
            } else {
                markers::hold_start(&self.state.pending, self.config.hold_back_chars)
            };
            let visible: String = self.state.pending.drain(..hold).collect();
            return self.emit_visible(visible);
        }
    }

    fn open_payload(&mut self, kind: PayloadKind, path: Option<String>) -> Result<(), SinkError> {
        tracing::debug!("Payload {} started", kind.name());
        match kind {
            PayloadKind::DiagramFence => self.state.mode = ScanMode::Diagram,
            PayloadKind::FileUpdateMarker => {
                if let Some(event) = self.assembler.file_started(path.as_deref()) {
                    self.sink.emit(event)?;
                }
                self.state.mode = ScanMode::Payload { kind, path };
            }
            _ => self.state.mode = ScanMode::Payload { kind, path },
        }
        Ok(())
    }

    /// Resolves the current payload if its closer has arrived. Returns
    /// whether scanning can continue.
    fn close_if_complete(&mut self, kind: PayloadKind, at_end: bool) -> Result<bool, SinkError> {
        let Some(closer) =
            markers::find_closer(kind, &self.state.pending, self.state.scanned, at_end)
        else {
            self.state.scanned = self.state.pending.len();
            return Ok(false);
        };

        let body = self.state.pending[..closer.body_end].to_string();
        self.state.pending.drain(..closer.end);
        self.state.scanned = 0;
        self.state.swallow_newline = !closer.consumed_newline;

        let mode = std::mem::replace(&mut self.state.mode, ScanMode::Visible);
        match mode {
            ScanMode::Diagram => {
                let rendered = render_diagram(
                    self.renderer.as_ref(),
                    &body,
                    self.config.diagram_max_chars,
                );
                self.sink.emit(HostEvent::Delta { text: rendered })?;
            }
            ScanMode::Payload { kind, path } => {
                let result = match kind {
                    PayloadKind::JsonPatch => self.assembler.json_patch(&body, false),
                    PayloadKind::RewriteMarker => Ok(vec![self.assembler.rewrite(&body)]),
                    PayloadKind::FileUpdateMarker => {
                        self.assembler.file_update(path.as_deref(), &body)
                    }
                    PayloadKind::DiagramFence => Ok(Vec::new()),
                };
                self.emit_patches(kind, result)?;
            }
            ScanMode::Visible => {}
        }
        Ok(true)
    }

    fn emit_patches(
        &self,
        kind: PayloadKind,
        result: Result<Vec<Patch>, PayloadError>,
    ) -> Result<(), SinkError> {
        match result {
            Ok(patches) => {
                for patch in patches {
                    self.sink.emit(HostEvent::Patch(patch))?;
                }
            }
            Err(e @ (PayloadError::AlreadyPatched(_)
            | PayloadError::NoChanges(_)
            | PayloadError::Duplicate)) => {
                tracing::debug!("Skipping {} payload: {e}", kind.name());
            }
            Err(e) => tracing::warn!("Dropping {} payload: {e}", kind.name()),
        }
        Ok(())
    }

    fn emit_visible(&self, text: String) -> Result<(), SinkError> {
        if text.is_empty() {
            return Ok(());
        }
        self.sink.emit(HostEvent::Delta { text })
    }

    /// Force-closes a payload whose closer never arrived. A diagram is
    /// rendered with what arrived. Any other payload loses only its opener;
    /// the text after it is scanned again as prose.
    fn abandon_payload(&mut self) -> Result<(), SinkError> {
        let mode = std::mem::replace(&mut self.state.mode, ScanMode::Visible);
        self.state.scanned = 0;
        match mode {
            ScanMode::Visible => {}
            ScanMode::Diagram => {
                tracing::debug!("Closing unterminated diagram fence");
                let body = std::mem::take(&mut self.state.pending);
                let rendered = render_diagram(
                    self.renderer.as_ref(),
                    &body,
                    self.config.diagram_max_chars,
                );
                self.sink.emit(HostEvent::Delta { text: rendered })?;
            }
            ScanMode::Payload { kind, .. } => {
                tracing::warn!("{}", PayloadError::Unterminated(kind));
                if kind != PayloadKind::JsonPatch {
                    // The marker's own line break goes with it
                    let rest = markers::strip_leading_newline(&self.state.pending).len();
                    let consumed = self.state.pending.len() - rest;
                    self.state.pending.drain(..consumed);
                }
            }
        }
        Ok(())
    }

    /// End-of-stream flush: everything buffered is resolved or released.
    fn flush(&mut self) -> Result<(), SinkError> {
        self.drain(true)
    }

    /// Re-reads the consolidated output for payloads the incremental path
    /// missed. Already-satisfied files and patches are skipped.
    fn final_pass(&mut self, final_text: Option<String>) -> Result<(), SinkError> {
        let text = match final_text {
            Some(text) if !text.trim().is_empty() => text,
            _ => std::mem::take(&mut self.transcript),
        };

        for payload in markers::scan_complete_payloads(&text) {
            let result = match payload.kind {
                PayloadKind::FileUpdateMarker => {
                    if let Some(event) = self.assembler.file_started(payload.path.as_deref()) {
                        self.sink.emit(event)?;
                    }
                    self.assembler
                        .file_update(payload.path.as_deref(), &payload.body)
                }
                PayloadKind::RewriteMarker if !self.assembler.selection_patched() => {
                    Ok(vec![self.assembler.rewrite(&payload.body)])
                }
                PayloadKind::JsonPatch => self.assembler.json_patch(&payload.body, true),
                PayloadKind::RewriteMarker | PayloadKind::DiagramFence => continue,
            };
            if matches!(&result, Ok(patches) if !patches.is_empty()) {
                tracing::info!("Recovered {} payload from final text", payload.kind.name());
            }
            self.emit_patches(payload.kind, result)?;
        }

        if self.config.action == TurnAction::Rewrite && !self.assembler.selection_patched() {
            match extract_rewrite_fallback(&text) {
                Some(rewritten) => {
                    tracing::info!("Using best-effort rewrite extraction");
                    let text = markers::strip_trailing_newline(&rewritten).to_string();
                    let patch = self.assembler.rewrite(&text);
                    self.sink.emit(HostEvent::Patch(patch))?;
                    self.emit_visible(FALLBACK_NOTE.to_string())?;
                }
                None => {
                    tracing::warn!("Rewrite turn produced no usable text");
                    self.emit_visible(NO_REWRITE_NOTE.to_string())?;
                }
            }
        }

        Ok(())
    }
}
