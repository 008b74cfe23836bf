use std::fs;
use std::io;
use std::path::Path;

use super::detection::UNKNOWN_LABEL;

/// Maps a backend's numeric class index to a human-readable label.
///
/// Loaded from a UTF-8 file with one label per line; the index is the
/// 0-based line number.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn new(labels: Vec<String>) -> Self {
        Self { labels }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        // `lines()` strips "\n" and "\r\n" and never yields a trailing empty line.
        Self::new(text.lines().map(str::to_string).collect())
    }

    /// Label for `index`, or `"UNKNOWN"` when it falls outside the table.
    pub fn get(&self, index: i64) -> &str {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.labels.get(i))
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
