//! Best-effort recovery of a rewrite when the agent answered without
//! rewrite markers.

use super::markers::{REWRITE_END, REWRITE_START};

/// Tries the last fenced code block, then the trailing prose that is not a
/// bullet list.
pub fn extract_rewrite_fallback(text: &str) -> Option<String> {
    last_fenced_block(text).or_else(|| trailing_prose(text))
}

fn last_fenced_block(text: &str) -> Option<String> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        match current.take() {
            None => {
                if let Some(info) = trimmed.strip_prefix("```") {
                    current = Some((info.trim().to_ascii_lowercase(), Vec::new()));
                }
            }
            Some((info, mut lines)) => {
                if trimmed.trim_end() == "```" {
                    blocks.push((info, lines.join("\n")));
                } else {
                    lines.push(line);
                    current = Some((info, lines));
                }
            }
        }
    }

    blocks
        .into_iter()
        .rev()
        .filter(|(info, _)| !info.starts_with("ageaf"))
        .map(|(_, body)| body)
        .find(|body| !body.trim().is_empty())
}

fn trailing_prose(text: &str) -> Option<String> {
    let cleaned: Vec<&str> = text
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            trimmed != REWRITE_START && trimmed != REWRITE_END
        })
        .collect();

    let mut paragraphs: Vec<Vec<&str>> = vec![Vec::new()];
    for line in cleaned {
        if line.trim().is_empty() {
            if paragraphs.last().is_some_and(|p| !p.is_empty()) {
                paragraphs.push(Vec::new());
            }
        } else if let Some(last) = paragraphs.last_mut() {
            last.push(line);
        }
    }

    paragraphs
        .into_iter()
        .rev()
        .filter(|p| !p.is_empty())
        .find(|p| !p.iter().any(|line| is_bullet(line)) && !is_lead_in(p))
        .map(|p| p.join("\n").trim().to_string())
}

fn is_bullet(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with("- ") || trimmed.starts_with("* ") || trimmed.starts_with("+ ") {
        return true;
    }
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    digits > 0 && (trimmed[digits..].starts_with(". ") || trimmed[digits..].starts_with(") "))
}

/// A one-line paragraph ending in a colon introduces something else.
fn is_lead_in(paragraph: &[&str]) -> bool {
    paragraph.len() == 1 && paragraph[0].trim_end().ends_with(':')
}
