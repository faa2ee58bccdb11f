//! Bounded record of which ACME directories issued certificates for this
//! host, one entry per line on disk. Purely informational for operators, so
//! every IO problem here is a soft failure.

use crate::time::current_time_truncated;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::warn;
use url::Url;

pub const MAX_HISTORY_ENTRIES: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub timestamp: OffsetDateTime,
    pub directory_uri: Url,
}

#[derive(Debug)]
pub struct AcmeHistory {
    path: PathBuf,
    entries: VecDeque<HistoryEntry>,
}

impl AcmeHistory {
    /// Loads the history file, or starts empty if it is missing or
    /// unreadable. A fresh install has no file yet, so only surprising
    /// failures are logged.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut entries = VecDeque::new();
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                for line in contents.lines() {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_line(line) {
                        Some(entry) => entries.push_back(entry),
                        None => {
                            warn!(
                                "Ignoring malformed line in history file {}: {line}",
                                path.display()
                            );
                        }
                    }
                }
                while entries.len() > MAX_HISTORY_ENTRIES {
                    entries.pop_front();
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    "ACME history file {} could not be read ({e}), starting with empty history",
                    path.display()
                );
            }
        }
        Self { path, entries }
    }

    /// Records that `directory_uri` issued (or was asked to issue) a
    /// certificate. The oldest entry is evicted beyond the cap.
    pub fn append(&mut self, directory_uri: &Url) {
        let entry = HistoryEntry {
            timestamp: current_time_truncated(),
            directory_uri: directory_uri.clone(),
        };
        self.entries.push_back(entry);
        while self.entries.len() > MAX_HISTORY_ENTRIES {
            self.entries.pop_front();
        }
        self.persist();
    }

    /// All recorded directory URIs, oldest first.
    pub fn directory_uris(&self) -> Vec<&Url> {
        self.entries.iter().map(|e| &e.directory_uri).collect()
    }

    pub fn last_directory_uri(&self) -> Option<&Url> {
        self.entries.back().map(|e| &e.directory_uri)
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    fn persist(&self) {
        if let Some(parent) = self.path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            warn!(
                "Could not create directory {} for the ACME history file: {e}",
                parent.display()
            );
            return;
        }
        let mut contents = String::new();
        for entry in &self.entries {
            let timestamp = entry
                .timestamp
                .format(&Rfc3339)
                .unwrap_or_else(|_| entry.timestamp.to_string());
            contents.push_str(&timestamp);
            contents.push(' ');
            contents.push_str(entry.directory_uri.as_str());
            contents.push('\n');
        }
        if let Err(e) = std::fs::write(&self.path, contents) {
            warn!(
                "ACME history file {} could not be written: {e}",
                self.path.display()
            );
        }
    }
}

fn parse_line(line: &str) -> Option<HistoryEntry> {
    let (timestamp, uri) = line.split_once(' ')?;
    let timestamp = OffsetDateTime::parse(timestamp, &Rfc3339).ok()?;
    let directory_uri = Url::parse(uri.trim()).ok()?;
    Some(HistoryEntry {
        timestamp,
        directory_uri,
    })
}
