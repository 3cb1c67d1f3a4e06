use std::collections::{HashSet, VecDeque};

/// Human-readable transcript of one rsync run.
///
/// Keeps the most recent `max_lines` lines, drops lone `.` directory
/// markers, and records each distinct error line once. Error text is
/// bounded by the same limit; overflow is only counted.
#[derive(Debug, Clone)]
pub struct ReportBuffer {
    lines: VecDeque<String>,
    max_lines: usize,
    dropped: u64,
    pending: Vec<String>,
    errors: Vec<String>,
    seen_errors: HashSet<String>,
    omitted_errors: u64,
}

impl ReportBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            max_lines: max_lines.max(1),
            dropped: 0,
            pending: Vec::new(),
            errors: Vec::new(),
            seen_errors: HashSet::new(),
            omitted_errors: 0,
        }
    }

    /// Returns whether the line was kept.
    pub fn push_line(&mut self, line: &str) -> bool {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() || trimmed.trim() == "." {
            return false;
        }
        self.append(trimmed.to_string());
        true
    }

    /// Records an error line in both the error text and the transcript.
    /// Exact repeats are ignored while the error text has room.
    pub fn push_error(&mut self, line: &str) -> bool {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() || self.seen_errors.contains(trimmed) {
            return false;
        }
        if self.errors.len() >= self.max_lines {
            self.omitted_errors += 1;
        } else {
            self.seen_errors.insert(trimmed.to_string());
            self.errors.push(trimmed.to_string());
        }
        self.append(trimmed.to_string());
        true
    }

    fn append(&mut self, line: String) {
        if self.lines.len() >= self.max_lines {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.pending.push(line.clone());
        self.lines.push_back(line);
    }

    /// Lines appended since the previous call.
    pub fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn error_text(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        let mut text = self.errors.join("\n");
        if self.omitted_errors > 0 {
            text.push_str(&format!("\n... {} further error lines omitted ...", self.omitted_errors));
        }
        Some(text)
    }

    #[cfg(test)]
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn text(&self) -> String {
        let mut text = String::new();
        if self.dropped > 0 {
            text.push_str(&format!("... {} earlier lines omitted ...\n", self.dropped));
        }
        for line in &self.lines {
            text.push_str(line);
            text.push('\n');
        }
        text
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.pending.clear();
        self.errors.clear();
        self.seen_errors.clear();
        self.omitted_errors = 0;
        self.dropped = 0;
    }
}
