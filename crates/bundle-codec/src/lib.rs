//! Command bundle protocol.
//!
//! A bundle is an ordered set of named sub-queries, each a shell command.
//! When composed into a single command line, every sub-query's output is
//! bracketed by sentinel marker lines so the combined output can be split
//! back into per-name sections:
//!
//! ```text
//! echo '<START CPU>' && iostat && echo '<END CPU>' && echo '<START MEM>' && free -h && echo '<END MEM>'
//! ```
//!
//! The ` && ` chaining is load-bearing: if a sub-command fails, the later
//! markers are never printed and the splitter reports the first missing
//! marker instead of returning a partial section map.

use std::collections::BTreeMap;

use thiserror::Error;

/// Split bundle output: sub-query name to the text between its markers.
pub type SectionMap = BTreeMap<String, String>;

/// Errors from splitting combined output back into sections.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BundleError {
    /// The `<START name>` line for a declared sub-query was not found.
    #[error("missing '<START {0}>' marker in output")]
    MissingStart(String),
    /// The `<END name>` line for a declared sub-query was not found after
    /// its start marker.
    #[error("missing '<END {0}>' marker in output")]
    MissingEnd(String),
}

/// An ordered mapping from sub-query name to command text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBundle {
    entries: Vec<(String, String)>,
}

impl CommandBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a named sub-query. Order is preserved in the composed command.
    pub fn push(&mut self, name: impl Into<String>, command: impl Into<String>) {
        self.entries.push((name.into(), command.into()));
    }

    /// Builder-style [`push`](Self::push).
    pub fn with(mut self, name: impl Into<String>, command: impl Into<String>) -> Self {
        self.push(name, command);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sub-query names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// The exact start marker line for a sub-query.
    pub fn start_marker(name: &str) -> String {
        format!("<START {name}>")
    }

    /// The exact end marker line for a sub-query.
    pub fn end_marker(name: &str) -> String {
        format!("<END {name}>")
    }

    /// Compose the single command line executing every sub-query with its
    /// output bracketed by marker lines.
    pub fn compose(&self) -> String {
        self.entries
            .iter()
            .map(|(name, command)| {
                format!(
                    "echo '{}' && {} && echo '{}'",
                    Self::start_marker(name),
                    command,
                    Self::end_marker(name)
                )
            })
            .collect::<Vec<_>>()
            .join(" && ")
    }

    /// Split the raw combined output into one section per declared sub-query.
    ///
    /// Markers must appear as whole lines, exactly as emitted by
    /// [`compose`](Self::compose). A missing marker for any declared name is
    /// an error; text outside marker pairs is ignored.
    pub fn split_output(&self, raw: &str) -> Result<SectionMap, BundleError> {
        let lines: Vec<&str> = raw.lines().collect();
        let mut sections = SectionMap::new();
        for (name, _) in &self.entries {
            let start = Self::start_marker(name);
            let end = Self::end_marker(name);
            let start_idx = lines
                .iter()
                .position(|line| *line == start)
                .ok_or_else(|| BundleError::MissingStart(name.clone()))?;
            let end_idx = lines[start_idx + 1..]
                .iter()
                .position(|line| *line == end)
                .map(|offset| start_idx + 1 + offset)
                .ok_or_else(|| BundleError::MissingEnd(name.clone()))?;
            sections.insert(name.clone(), lines[start_idx + 1..end_idx].join("\n"));
        }
        Ok(sections)
    }
}
