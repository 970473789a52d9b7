use crate::constants::frame::{BLOCK_START_MARKER, FIELD_DELIMITER};

/// Decides which lines of a raw response carry frame data.
///
/// The console mixes echoed commands, prompts and status chatter into the
/// same stream as the data lines, and firmware variants differ in how they
/// separate fields. Implementations encapsulate one variant's framing rules so
/// the parser itself never looks at raw characters.
pub trait LineClassifier {
    /// Narrows the raw response to the region that may contain data lines.
    fn body<'a>(&self, raw: &'a str) -> &'a str {
        raw
    }

    /// Returns `true` if the (trimmed) line belongs to the frame.
    fn qualifies(&self, line: &str) -> bool;

    /// Splits a qualifying line into its non-empty, trimmed fields.
    fn fields<'a>(&self, line: &'a str) -> Vec<&'a str>;
}

/// The framing used by the Pylontech debug console.
///
/// A line qualifies when it contains the field delimiter, or when it is a bare
/// unsigned integer (the footer counters are printed that way on some
/// firmware). If a block start marker is configured, only the text after its
/// last occurrence is considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimiterClassifier {
    delimiter: char,
    block_start: Option<char>,
}

impl DelimiterClassifier {
    pub fn new(delimiter: char, block_start: Option<char>) -> Self {
        Self {
            delimiter,
            block_start,
        }
    }

    pub fn delimiter(&self) -> char {
        self.delimiter
    }
}

impl Default for DelimiterClassifier {
    fn default() -> Self {
        Self::new(FIELD_DELIMITER, Some(BLOCK_START_MARKER))
    }
}

impl LineClassifier for DelimiterClassifier {
    fn body<'a>(&self, raw: &'a str) -> &'a str {
        match self.block_start.and_then(|marker| raw.rfind(marker)) {
            Some(idx) => &raw[idx + 1..],
            None => raw,
        }
    }

    fn qualifies(&self, line: &str) -> bool {
        let line = line.trim();
        if line.contains(self.delimiter) {
            return true;
        }
        !line.is_empty() && line.bytes().all(|b| b.is_ascii_digit())
    }

    fn fields<'a>(&self, line: &'a str) -> Vec<&'a str> {
        line.split(self.delimiter)
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .collect()
    }
}
