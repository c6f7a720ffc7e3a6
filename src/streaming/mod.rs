//! Streaming patch extraction for agent output
//!
//! Agent text arrives as arbitrary deltas. Prose is forwarded with a small
//! hold-back window, embedded payloads (`ageaf-patch` and `ageaf-diagram`
//! fences, rewrite and file-update markers) are buffered until their closer
//! arrives and then turned into patch or diagram events.

mod assembler;
mod diagram;
mod fallback;
mod markers;
mod patch_processor;

#[cfg(test)]
mod test_realistic_chunks;
#[cfg(test)]
mod test_utils;

pub use assembler::{PatchAssembler, PayloadError};
pub use diagram::{render_diagram, DiagramRenderer, MermaidFenceRenderer};
pub use fallback::extract_rewrite_fallback;
pub use markers::{scan_complete_payloads, CompletePayload, PayloadKind};
pub use patch_processor::{
    PatchStreamProcessor, StreamConfig, StreamPhase, TurnOutcome, DEFAULT_DIAGRAM_MAX_CHARS,
    DEFAULT_HOLD_BACK_CHARS,
};
