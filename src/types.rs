use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A normalized, applicable edit instruction derived from agent output.
///
/// Serialized tagged by `kind`, which is also the shape agents write into
/// `ageaf-patch` fences, so deserializing a fence body is the shape check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Patch {
    /// Replace the user's current editor selection
    ReplaceSelection { text: String },
    /// Insert at the cursor without replacing anything
    InsertAtCursor { text: String },
    /// Replace `[from, to)` of a file, guarded by `expected_old_text`
    ReplaceRangeInFile {
        #[serde(rename = "filePath")]
        file_path: String,
        #[serde(rename = "expectedOldText")]
        expected_old_text: String,
        text: String,
        from: usize,
        to: usize,
        #[serde(
            rename = "lineFrom",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        line_from: Option<usize>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchShapeError {
    #[error("range start {from} is after range end {to}")]
    InvertedRange { from: usize, to: usize },
    #[error("file path is empty")]
    EmptyFilePath,
    #[error("lineFrom must be 1-based")]
    ZeroLine,
}

impl Patch {
    /// Checks the invariants serde cannot express.
    pub fn validate(&self) -> Result<(), PatchShapeError> {
        match self {
            Patch::ReplaceSelection { .. } | Patch::InsertAtCursor { .. } => Ok(()),
            Patch::ReplaceRangeInFile {
                file_path,
                from,
                to,
                line_from,
                ..
            } => {
                if file_path.trim().is_empty() {
                    return Err(PatchShapeError::EmptyFilePath);
                }
                if from > to {
                    return Err(PatchShapeError::InvertedRange {
                        from: *from,
                        to: *to,
                    });
                }
                if *line_from == Some(0) {
                    return Err(PatchShapeError::ZeroLine);
                }
                Ok(())
            }
        }
    }

    pub fn file_path(&self) -> Option<&str> {
        match self {
            Patch::ReplaceRangeInFile { file_path, .. } => Some(file_path),
            _ => None,
        }
    }
}

/// Full known text of one file at turn start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSnapshot {
    pub file_path: String,
    pub content: String,
}

/// One contiguous replacement computed against a [`FileSnapshot`].
///
/// `from`/`to` are byte offsets into the snapshot content, computed in the
/// same pass that captured `expected_old_text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub file_path: String,
    pub expected_old_text: String,
    pub text: String,
    pub from: usize,
    pub to: usize,
    /// 0-based index of the line containing `from`
    pub start_line: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    Ok,
    Error,
    NotConfigured,
    Aborted,
}

/// Events produced for the consumer of a turn, in emission order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    Delta {
        text: String,
    },
    Plan {
        message: String,
        #[serde(rename = "toolName", skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        phase: String,
    },
    FileStarted {
        #[serde(rename = "filePath")]
        file_path: String,
    },
    Patch(Patch),
    Usage {
        model: String,
        #[serde(rename = "usedTokens")]
        used_tokens: u64,
        #[serde(rename = "contextWindow")]
        context_window: u64,
    },
    Done {
        status: DoneStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// What kind of result the caller expects from a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAction {
    #[default]
    Chat,
    /// The turn rewrites the current selection and is expected to answer
    /// with rewrite markers
    Rewrite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub conversation_id: String,
    /// User message, including any `[Overleaf file: ...]` context blocks
    pub message: String,
    #[serde(default)]
    pub selection: Option<String>,
    #[serde(default)]
    pub action: TurnAction,
}

/// Token accounting reported by a runtime at the end of a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}
