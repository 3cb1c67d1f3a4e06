use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use super::{ChangeKind, ItemizedChange};

static STAT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*((?:Number of|Total) [A-Za-z ]+?)\s*:\s*(.*)$").expect("stat pattern is valid")
});

static SCAN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(?:[\d,]+ files(?:\.\.\.| to consider)|(?:building|sending incremental|receiving incremental|receiving) file list)")
        .expect("scan pattern is valid")
});

/// Summary fields from the `--stats` block that feed the dry-run analysis.
/// Other stat lines are plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatField {
    TotalFiles,
    FilesTransferred,
    DeletedFiles,
}

impl StatField {
    /// Label variants differ across rsync releases.
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "Number of files" => Some(Self::TotalFiles),
            "Number of regular files transferred" | "Number of files transferred" => {
                Some(Self::FilesTransferred)
            }
            "Number of deleted files" | "Number of deletions" => Some(Self::DeletedFiles),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RsyncEvent {
    Change { change: ItemizedChange, line: String },
    Stat { field: StatField, value: u64, line: String },
    ScanProgress { line: String },
    Text(String),
}

impl RsyncEvent {
    pub fn line(&self) -> &str {
        match self {
            Self::Change { line, .. } | Self::Stat { line, .. } | Self::ScanProgress { line } => line,
            Self::Text(line) => line,
        }
    }
}

/// Turns arbitrarily split byte chunks of rsync output into line events.
///
/// Bytes are buffered until a newline arrives so a multi-byte UTF-8
/// sequence split across chunks is decoded whole.
#[derive(Debug, Default)]
pub struct OutputParser {
    partial: Vec<u8>,
}

impl OutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<RsyncEvent> {
        self.partial.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.partial[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            if let Some(event) = classify_bytes(&self.partial[consumed..end]) {
                events.push(event);
            }
            consumed = end + 1;
        }
        self.partial.drain(..consumed);
        events
    }

    /// Flushes a trailing line that never got its newline.
    pub fn finish(&mut self) -> Vec<RsyncEvent> {
        let rest = std::mem::take(&mut self.partial);
        classify_bytes(&rest).into_iter().collect()
    }

    #[cfg(test)]
    pub fn has_partial(&self) -> bool {
        !self.partial.is_empty()
    }
}

fn classify_bytes(raw: &[u8]) -> Option<RsyncEvent> {
    let text = String::from_utf8_lossy(raw);
    classify_line(text.trim_end_matches('\r'))
}

/// Classifies one complete line. Blank lines produce no event.
pub fn classify_line(line: &str) -> Option<RsyncEvent> {
    if line.trim().is_empty() {
        return None;
    }

    if let Some(path) = deletion_path(line) {
        return Some(RsyncEvent::Change {
            change: ItemizedChange {
                kind: ChangeKind::Delete,
                path: path.to_string(),
            },
            line: line.to_string(),
        });
    }

    if let Some((code, path)) = split_itemized(line) {
        let kind = if matches!(&code[..2], ">f" | "<f") {
            ChangeKind::Transfer
        } else {
            ChangeKind::Other
        };
        return Some(RsyncEvent::Change {
            change: ItemizedChange {
                kind,
                path: path.to_string(),
            },
            line: line.to_string(),
        });
    }

    if let Some(captures) = STAT_REGEX.captures(line) {
        if let Some(field) = StatField::from_label(&captures[1]) {
            return Some(RsyncEvent::Stat {
                field,
                value: parse_stat_value(&captures[2], line),
                line: line.to_string(),
            });
        }
    }

    if SCAN_REGEX.is_match(line) {
        return Some(RsyncEvent::ScanProgress {
            line: line.to_string(),
        });
    }

    Some(RsyncEvent::Text(line.to_string()))
}

fn deletion_path(line: &str) -> Option<&str> {
    let rest = line
        .strip_prefix("*deleting")
        .or_else(|| line.strip_prefix("deleting "))?;
    let path = rest.trim();
    (!path.is_empty()).then_some(path)
}

const ITEMIZE_TYPES: &[u8] = b"fdLDS";
const ITEMIZE_UPDATES: &[u8] = b"<>ch.";
const ITEMIZE_ATTRS: &[u8] = b".+ ?cstTpoguaxnb";

/// Splits `YXcstpoguax path` into code and path. rsync 3 prints an
/// 11-character code, rsync 2.6 a 9-character one.
fn split_itemized(line: &str) -> Option<(&str, &str)> {
    let bytes = line.as_bytes();
    if bytes.len() < 3 || !ITEMIZE_UPDATES.contains(&bytes[0]) || !ITEMIZE_TYPES.contains(&bytes[1]) {
        return None;
    }

    for width in [11usize, 9] {
        if bytes.len() > width
            && bytes[width] == b' '
            && bytes[2..width].iter().all(|b| ITEMIZE_ATTRS.contains(b))
        {
            let path = line[width + 1..].trim();
            if !path.is_empty() {
                return Some((&line[..width], path));
            }
        }
    }
    None
}

fn parse_stat_value(raw: &str, line: &str) -> u64 {
    let token = raw.split_whitespace().next().unwrap_or("").replace(',', "");
    match token.parse::<u64>() {
        Ok(value) => value,
        Err(_) => {
            warn!("Unparseable rsync statistic, treating as 0: {}", line);
            0
        }
    }
}
