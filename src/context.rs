//! File snapshots carried in the user message.
//!
//! The page embeds the files it knows about as
//!
//! ````text
//! [Overleaf file: chapters/intro.tex]
//! ```latex
//! ...content...
//! ```
//! ````
//!
//! Snapshots are captured once per turn and never refetched.

use crate::types::FileSnapshot;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

fn header_regex() -> &'static Regex {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    HEADER.get_or_init(|| {
        Regex::new(r"(?m)^[ \t]*\[Overleaf file:[ \t]*([^\]\n]+?)[ \t]*\][ \t]*\r?\n[ \t]*(`{3,})[^\n]*\n")
            .expect("valid header regex")
    })
}

/// Immutable set of snapshots for one turn, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct SnapshotSet {
    files: BTreeMap<String, FileSnapshot>,
}

impl SnapshotSet {
    pub fn new(snapshots: impl IntoIterator<Item = FileSnapshot>) -> Self {
        let mut files = BTreeMap::new();
        for snapshot in snapshots {
            files.insert(normalize_path(&snapshot.file_path), snapshot);
        }
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Resolves a path written by the agent to a known snapshot: exact match
    /// first, then a basename match if exactly one file has that basename.
    pub fn resolve(&self, path: &str) -> Option<&FileSnapshot> {
        let wanted = normalize_path(path);
        if wanted.is_empty() {
            return None;
        }
        if let Some(snapshot) = self.files.get(&wanted) {
            return Some(snapshot);
        }

        let wanted_base = basename(&wanted);
        let mut candidates = self
            .files
            .iter()
            .filter(|(key, _)| basename(key) == wanted_base)
            .map(|(_, snapshot)| snapshot);
        let first = candidates.next()?;
        if candidates.next().is_some() {
            tracing::debug!("Path {path} matches several snapshots by basename");
            return None;
        }
        Some(first)
    }
}

/// Extracts all `[Overleaf file: ...]` blocks from a message. A later block
/// for the same path replaces an earlier one. Blocks without a closing fence
/// are ignored.
pub fn parse_snapshots(message: &str) -> SnapshotSet {
    let mut snapshots = Vec::new();
    let mut search_from = 0;

    while let Some(captures) = header_regex().captures_at(message, search_from) {
        let (Some(whole), Some(path), Some(fence)) =
            (captures.get(0), captures.get(1), captures.get(2))
        else {
            break;
        };
        let content_start = whole.end();
        match find_closing_fence(message, content_start, fence.as_str().len()) {
            Some((content_end, block_end)) => {
                snapshots.push(FileSnapshot {
                    file_path: path.as_str().trim().to_string(),
                    content: message[content_start..content_end].to_string(),
                });
                search_from = block_end;
            }
            None => {
                tracing::debug!("Unterminated file block for {}", path.as_str());
                search_from = content_start;
            }
        }
    }

    SnapshotSet::new(snapshots)
}

/// Finds a line consisting only of at least `fence_len` backticks. Returns
/// the offset where that line starts and where it ends.
fn find_closing_fence(text: &str, from: usize, fence_len: usize) -> Option<(usize, usize)> {
    let mut line_start = from;
    while line_start <= text.len() {
        let rest = &text[line_start..];
        let line_len = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
        let line = rest[..line_len].trim();
        if line.len() >= fence_len && line.chars().all(|c| c == '`') {
            return Some((line_start, line_start + line_len));
        }
        if line_len == 0 || line_start + line_len >= text.len() {
            return None;
        }
        line_start += line_len;
    }
    None
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('"');
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    trimmed.trim_start_matches('/').to_string()
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MESSAGE: &str = "Please fix the typo.\n\n[Overleaf file: main.tex]\n```latex\nHello world\n```\n\n[Overleaf file: chapters/intro.tex]\n````\nIntro with ``` inside\n````\n";

    #[test]
    fn test_parse_snapshots_reads_content_with_final_newline() {
        let set = parse_snapshots(MESSAGE);
        assert_eq!(set.len(), 2);
        assert_eq!(set.resolve("main.tex").unwrap().content, "Hello world\n");
        assert_eq!(
            set.resolve("chapters/intro.tex").unwrap().content,
            "Intro with ``` inside\n"
        );
    }

    #[test]
    fn test_resolve_by_basename_and_prefix() {
        let set = parse_snapshots(MESSAGE);
        assert_eq!(
            set.resolve("intro.tex").unwrap().file_path,
            "chapters/intro.tex"
        );
        assert_eq!(set.resolve("./main.tex").unwrap().file_path, "main.tex");
        assert_eq!(set.resolve("/main.tex").unwrap().file_path, "main.tex");
        assert!(set.resolve("missing.tex").is_none());
        assert!(set.resolve("").is_none());
    }

    #[test]
    fn test_ambiguous_basename_is_unresolved() {
        let set = SnapshotSet::new([
            FileSnapshot {
                file_path: "a/intro.tex".to_string(),
                content: String::new(),
            },
            FileSnapshot {
                file_path: "b/intro.tex".to_string(),
                content: String::new(),
            },
        ]);
        assert!(set.resolve("intro.tex").is_none());
        assert!(set.resolve("a/intro.tex").is_some());
    }

    #[test]
    fn test_unterminated_block_is_ignored() {
        let set = parse_snapshots("[Overleaf file: main.tex]\n```\nno end");
        assert!(set.is_empty());
    }

    #[test]
    fn test_empty_file_block() {
        let set = parse_snapshots("[Overleaf file: empty.tex]\n```\n```\n");
        assert_eq!(set.resolve("empty.tex").unwrap().content, "");
    }
}
