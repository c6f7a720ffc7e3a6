//! Minimal replacement hunks between a snapshot and a proposed new full text.
//!
//! The diff runs over lines (every line keeps its terminator), consecutive
//! changed lines coalesce into one hunk, and each hunk is then narrowed by a
//! line terminator both sides share, so an edit on the last line of a file
//! does not drag the final newline into its anchor.

use crate::types::Hunk;
use similar::{capture_diff_slices, Algorithm, DiffTag};

pub fn compute_hunks(file_path: &str, old_text: &str, new_text: &str) -> Vec<Hunk> {
    if old_text == new_text {
        return Vec::new();
    }

    let old_lines: Vec<&str> = old_text.split_inclusive('\n').collect();
    let new_lines: Vec<&str> = new_text.split_inclusive('\n').collect();
    let old_starts = line_starts(&old_lines);
    let new_starts = line_starts(&new_lines);

    let ops = capture_diff_slices(Algorithm::Myers, &old_lines, &new_lines);

    let mut hunks = Vec::new();
    // (old line range, new line range) of the change region being collected
    let mut pending: Option<(usize, usize, usize, usize)> = None;

    for op in &ops {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        if tag == DiffTag::Equal {
            if let Some(region) = pending.take() {
                hunks.extend(region_to_hunk(
                    file_path, old_text, new_text, &old_starts, &new_starts, region,
                ));
            }
            continue;
        }
        pending = Some(match pending {
            Some((old_start, _, new_start, _)) => {
                (old_start, old_range.end, new_start, new_range.end)
            }
            None => (
                old_range.start,
                old_range.end,
                new_range.start,
                new_range.end,
            ),
        });
    }
    if let Some(region) = pending.take() {
        hunks.extend(region_to_hunk(
            file_path, old_text, new_text, &old_starts, &new_starts, region,
        ));
    }

    hunks
}

/// Applies hunks computed against `text`, last hunk first so earlier
/// offsets stay valid.
pub fn apply_hunks(text: &str, hunks: &[Hunk]) -> String {
    let mut result = text.to_string();
    let mut ordered: Vec<&Hunk> = hunks.iter().collect();
    ordered.sort_by_key(|h| std::cmp::Reverse(h.from));
    for hunk in ordered {
        result.replace_range(hunk.from..hunk.to, &hunk.text);
    }
    result
}

/// Byte offset of every line start, plus the total length as a sentinel.
fn line_starts(lines: &[&str]) -> Vec<usize> {
    let mut starts = Vec::with_capacity(lines.len() + 1);
    let mut offset = 0;
    for line in lines {
        starts.push(offset);
        offset += line.len();
    }
    starts.push(offset);
    starts
}

fn region_to_hunk(
    file_path: &str,
    old_text: &str,
    new_text: &str,
    old_starts: &[usize],
    new_starts: &[usize],
    (old_first, old_last, new_first, new_last): (usize, usize, usize, usize),
) -> Option<Hunk> {
    let from = old_starts[old_first];
    let mut to = old_starts[old_last];
    let new_from = new_starts[new_first];
    let mut new_to = new_starts[new_last];

    let mut old_span = &old_text[from..to];
    let mut new_span = &new_text[new_from..new_to];

    // Keep a shared trailing terminator outside the hunk
    for terminator in ["\r\n", "\n"] {
        if old_span.ends_with(terminator) && new_span.ends_with(terminator) {
            to -= terminator.len();
            new_to -= terminator.len();
            old_span = &old_text[from..to];
            new_span = &new_text[new_from..new_to];
            break;
        }
    }

    if old_span == new_span {
        return None;
    }

    Some(Hunk {
        file_path: file_path.to_string(),
        expected_old_text: old_span.to_string(),
        text: new_span.to_string(),
        from,
        to,
        start_line: old_first,
    })
}
