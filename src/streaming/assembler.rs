use super::markers::{strip_leading_newline, strip_trailing_newline, PayloadKind};
use crate::context::SnapshotSet;
use crate::types::{HostEvent, Patch, PatchShapeError};
use crate::utils::hunks::compute_hunks;
use crate::utils::offsets::{hunk_to_patch, OffsetEncoding};
use std::collections::HashSet;
use thiserror::Error;

/// Why a single payload instance produced no patch. Never fatal to a turn.
#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("patch JSON is invalid: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("patch has an invalid shape: {0}")]
    InvalidShape(#[from] PatchShapeError),
    #[error("file {0} is not among the known files of this turn")]
    UnresolvedPath(String),
    #[error("file update marker has no path")]
    MissingPath,
    #[error("file {0} was already patched in this turn")]
    AlreadyPatched(String),
    #[error("proposed content of {0} matches the current content")]
    NoChanges(String),
    #[error("patch was already emitted in this turn")]
    Duplicate,
    #[error("{} payload was not terminated before the end of the stream", .0.name())]
    Unterminated(PayloadKind),
}

/// Turns recognized payloads into patch events and remembers what this turn
/// already emitted.
pub struct PatchAssembler {
    snapshots: SnapshotSet,
    encoding: OffsetEncoding,
    /// Paths that received a range patch, from a file-update marker or a
    /// JSON patch
    patched_files: HashSet<String>,
    /// Resolved paths a `file_started` notification went out for
    started_files: HashSet<String>,
    /// Serialized form of every patch emitted this turn
    fingerprints: HashSet<String>,
    selection_patched: bool,
}

impl PatchAssembler {
    pub fn new(snapshots: SnapshotSet, encoding: OffsetEncoding) -> Self {
        Self {
            snapshots,
            encoding,
            patched_files: HashSet::new(),
            started_files: HashSet::new(),
            fingerprints: HashSet::new(),
            selection_patched: false,
        }
    }

    /// Whether a `replaceSelection` patch went out in this turn.
    pub fn selection_patched(&self) -> bool {
        self.selection_patched
    }

    /// Validates an `ageaf-patch` fence body. Range patches are forwarded
    /// with the offsets the agent computed; they are never recomputed, but
    /// their file counts as patched for later file-update markers.
    pub fn json_patch(&mut self, body: &str, skip_duplicates: bool) -> Result<Vec<Patch>, PayloadError> {
        let patch: Patch = serde_json::from_str(body.trim())?;
        patch.validate()?;
        if skip_duplicates && self.fingerprints.contains(&fingerprint(&patch)) {
            return Err(PayloadError::Duplicate);
        }
        if let Some(path) = patch.file_path() {
            let resolved = match self.snapshots.resolve(path) {
                Some(snapshot) => snapshot.file_path.clone(),
                None => path.to_string(),
            };
            self.patched_files.insert(resolved);
        }
        Ok(vec![self.record(patch)])
    }

    /// A rewrite marker body always becomes one selection replacement.
    pub fn rewrite(&mut self, body: &str) -> Patch {
        let text = strip_trailing_newline(strip_leading_newline(body)).to_string();
        self.record(Patch::ReplaceSelection { text })
    }

    /// Progress notification for the file a marker just opened, at most once
    /// per file and turn.
    pub fn file_started(&mut self, path: Option<&str>) -> Option<HostEvent> {
        let resolved = self.snapshots.resolve(path?)?.file_path.clone();
        if !self.started_files.insert(resolved.clone()) {
            return None;
        }
        Some(HostEvent::FileStarted {
            file_path: resolved,
        })
    }

    /// Diffs a file-update body against the snapshot and returns one range
    /// patch per hunk, last hunk first so the patches apply one after another.
    pub fn file_update(&mut self, path: Option<&str>, body: &str) -> Result<Vec<Patch>, PayloadError> {
        let path = path.ok_or(PayloadError::MissingPath)?;
        let snapshot = self
            .snapshots
            .resolve(path)
            .ok_or_else(|| PayloadError::UnresolvedPath(path.to_string()))?
            .clone();

        if self.patched_files.contains(&snapshot.file_path) {
            return Err(PayloadError::AlreadyPatched(snapshot.file_path));
        }

        let new_content = strip_leading_newline(body);
        let hunks = compute_hunks(&snapshot.file_path, &snapshot.content, new_content);
        if hunks.is_empty() {
            return Err(PayloadError::NoChanges(snapshot.file_path));
        }

        self.patched_files.insert(snapshot.file_path.clone());
        let encoding = self.encoding;
        let mut patches = Vec::with_capacity(hunks.len());
        for hunk in hunks.iter().rev() {
            let patch = hunk_to_patch(hunk, &snapshot.content, encoding);
            patches.push(self.record(patch));
        }
        Ok(patches)
    }

    fn record(&mut self, patch: Patch) -> Patch {
        if matches!(patch, Patch::ReplaceSelection { .. }) {
            self.selection_patched = true;
        }
        self.fingerprints.insert(fingerprint(&patch));
        patch
    }
}

fn fingerprint(patch: &Patch) -> String {
    serde_json::to_string(patch).unwrap_or_default()
}
