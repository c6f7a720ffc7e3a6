use crate::types::{Hunk, Patch};
use serde::{Deserialize, Serialize};

/// Code unit used for `from`/`to` of patches sent to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetEncoding {
    /// UTF-16 code units, what JavaScript string indices count
    #[default]
    Utf16,
    /// Bytes of the UTF-8 encoding
    Utf8,
}

impl OffsetEncoding {
    /// Length of `text` in this unit.
    pub fn len_of(self, text: &str) -> usize {
        match self {
            OffsetEncoding::Utf16 => text.encode_utf16().count(),
            OffsetEncoding::Utf8 => text.len(),
        }
    }
}

/// Turns a byte-offset hunk into a range patch in the wire unit.
///
/// Both ends are converted from the same snapshot text the hunk was computed
/// against.
pub fn hunk_to_patch(hunk: &Hunk, snapshot: &str, encoding: OffsetEncoding) -> Patch {
    let from = encoding.len_of(&snapshot[..hunk.from]);
    let to = from + encoding.len_of(&hunk.expected_old_text);
    Patch::ReplaceRangeInFile {
        file_path: hunk.file_path.clone(),
        expected_old_text: hunk.expected_old_text.clone(),
        text: hunk.text.clone(),
        from,
        to,
        line_from: Some(hunk.start_line + 1),
    }
}
