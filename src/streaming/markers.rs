//! Grammar of the payloads embedded in agent text.
//!
//! The same opener/closer definitions serve the incremental scanner and the
//! end-of-turn pass over the final text.

use regex::Regex;
use std::sync::OnceLock;

pub const REWRITE_START: &str = "<<<AGEAF_REWRITE>>>";
pub const REWRITE_END: &str = "<<<AGEAF_REWRITE_END>>>";
pub const FILE_UPDATE_END: &str = "<<<AGEAF_FILE_UPDATE_END>>>";

/// An opener that started this far back without completing is prose.
const MAX_OPENER_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    JsonPatch,
    RewriteMarker,
    FileUpdateMarker,
    DiagramFence,
}

impl PayloadKind {
    pub fn name(self) -> &'static str {
        match self {
            PayloadKind::JsonPatch => "jsonPatch",
            PayloadKind::RewriteMarker => "rewriteMarker",
            PayloadKind::FileUpdateMarker => "fileUpdateMarker",
            PayloadKind::DiagramFence => "diagramFence",
        }
    }
}

/// A complete opener found in the scanned text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opener {
    pub kind: PayloadKind,
    pub start: usize,
    pub end: usize,
    /// `path` attribute of a file-update marker
    pub path: Option<String>,
}

/// A closer found in a payload body buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Closer {
    /// Where the payload body ends
    pub body_end: usize,
    /// Where scanning resumes
    pub end: usize,
    /// Whether the newline after the closer was already consumed
    pub consumed_newline: bool,
}

/// A fully delimited payload, as found by [`scan_complete_payloads`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletePayload {
    pub kind: PayloadKind,
    pub path: Option<String>,
    pub body: String,
}

fn opener_regex() -> &'static Regex {
    static OPENER: OnceLock<Regex> = OnceLock::new();
    OPENER.get_or_init(|| {
        Regex::new(concat!(
            r"(?P<fence>```[ \t]*(?i:ageaf[-_]?(?P<fkind>patch|diagram))\b[^\n]*\n)",
            r#"|(?P<rewrite><<<AGEAF_REWRITE>>>)"#,
            r#"|(?P<file><<<AGEAF_FILE_UPDATE[ \t]+path[ \t]*=[ \t]*"(?P<path>[^"\n]*)"[ \t]*>>>)"#,
        ))
        .expect("valid opener regex")
    })
}

/// While streaming, a closer line only counts once its newline arrived; the
/// same line could still continue as ```` ```json ````.
fn fence_closer_regex(at_end: bool) -> &'static Regex {
    static STREAMING: OnceLock<Regex> = OnceLock::new();
    static AT_END: OnceLock<Regex> = OnceLock::new();
    if at_end {
        AT_END.get_or_init(|| {
            Regex::new(r"(?m)^[ \t]*```[ \t]*(?:\r?\n|\r?\z)").expect("valid fence closer regex")
        })
    } else {
        STREAMING.get_or_init(|| {
            Regex::new(r"(?m)^[ \t]*```[ \t]*\r?\n").expect("valid fence closer regex")
        })
    }
}

/// Finds the earliest complete opener in `text`.
pub fn find_opener(text: &str) -> Option<Opener> {
    let captures = opener_regex().captures(text)?;
    let whole = captures.get(0)?;

    let (kind, path) = if captures.name("fence").is_some() {
        let fence_kind = captures.name("fkind")?.as_str().to_ascii_lowercase();
        let kind = if fence_kind == "patch" {
            PayloadKind::JsonPatch
        } else {
            PayloadKind::DiagramFence
        };
        (kind, None)
    } else if captures.name("rewrite").is_some() {
        (PayloadKind::RewriteMarker, None)
    } else {
        let path = captures.name("path").map(|m| m.as_str().to_string());
        (PayloadKind::FileUpdateMarker, path)
    };

    Some(Opener {
        kind,
        start: whole.start(),
        end: whole.end(),
        path,
    })
}

/// Looks for the closer of `kind` in a body buffer. `scanned` is how much of
/// the buffer was already searched without a match; only the tail that could
/// still contain a split closer is searched again. `at_end` is set once no
/// more text will follow the buffer.
pub fn find_closer(kind: PayloadKind, body: &str, scanned: usize, at_end: bool) -> Option<Closer> {
    let scanned = scanned.min(body.len());
    match kind {
        PayloadKind::JsonPatch | PayloadKind::DiagramFence => {
            // A fence closer is a whole line, so restart at the last line start
            let resume = body[..scanned].rfind('\n').map(|i| i + 1).unwrap_or(0);
            let m = fence_closer_regex(at_end).find_at(body, resume)?;
            let consumed_newline = m.as_str().ends_with('\n');
            Some(Closer {
                body_end: m.start(),
                end: m.end(),
                consumed_newline,
            })
        }
        PayloadKind::RewriteMarker => find_literal_closer(body, scanned, REWRITE_END),
        PayloadKind::FileUpdateMarker => find_literal_closer(body, scanned, FILE_UPDATE_END),
    }
}

fn find_literal_closer(body: &str, scanned: usize, marker: &str) -> Option<Closer> {
    let resume = floor_char_boundary(body, scanned.saturating_sub(marker.len() - 1));
    let start = body[resume..].find(marker)? + resume;
    let mut end = start + marker.len();
    let mut consumed_newline = false;
    if body[end..].starts_with("\r\n") {
        end += 2;
        consumed_newline = true;
    } else if body[end..].starts_with('\n') {
        end += 1;
        consumed_newline = true;
    }
    Some(Closer {
        body_end: start,
        end,
        consumed_newline,
    })
}

/// Byte offset from which `text` must stay buffered: the last
/// `hold_back_chars` characters, extended back to the start of any opener
/// that has begun but not yet completed.
pub fn hold_start(text: &str, hold_back_chars: usize) -> usize {
    let mut hold = if hold_back_chars == 0 {
        text.len()
    } else {
        text.char_indices()
            .rev()
            .nth(hold_back_chars - 1)
            .map(|(i, _)| i)
            .unwrap_or(0)
    };

    let window_start = text
        .char_indices()
        .rev()
        .nth(MAX_OPENER_CHARS - 1)
        .map(|(i, _)| i)
        .unwrap_or(0);

    if let Some(pos) = text.rfind("<<<") {
        if pos >= window_start && !text[pos..].contains(">>>") {
            hold = hold.min(pos);
        }
    }
    if let Some(pos) = text.rfind("```") {
        if pos >= window_start && !text[pos..].contains('\n') {
            // Back up over a longer run of backticks
            let run_start = text[..pos].trim_end_matches('`').len();
            hold = hold.min(run_start);
        }
    }

    hold
}

/// Extracts every complete payload from a finished text, in order. An opener
/// without a closer is skipped and scanning goes on after it.
pub fn scan_complete_payloads(text: &str) -> Vec<CompletePayload> {
    let mut payloads = Vec::new();
    let mut rest = text;

    while let Some(opener) = find_opener(rest) {
        let body_text = &rest[opener.end..];
        match find_closer(opener.kind, body_text, 0, true) {
            Some(closer) => {
                payloads.push(CompletePayload {
                    kind: opener.kind,
                    path: opener.path,
                    body: body_text[..closer.body_end].to_string(),
                });
                rest = &body_text[closer.end..];
            }
            None => {
                tracing::debug!("Skipping unterminated {} opener", opener.kind.name());
                rest = body_text;
            }
        }
    }

    payloads
}

/// Drops one leading line terminator.
pub fn strip_leading_newline(text: &str) -> &str {
    text.strip_prefix("\r\n")
        .or_else(|| text.strip_prefix('\n'))
        .unwrap_or(text)
}

/// Drops one trailing line terminator.
pub fn strip_trailing_newline(text: &str) -> &str {
    text.strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text)
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}
