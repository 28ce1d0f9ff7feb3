//! Persistent highscore list.
//!
//! A small best-times table serialized with bincode. Loaded once at startup
//! and written back on shutdown; a missing or unreadable file just means a
//! fresh list, the server never refuses to start over it.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How many entries the table keeps.
pub const MAX_ENTRIES: usize = 10;

/// One finished round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighscoreEntry {
    /// Round duration, lower is better.
    pub time_millis: u64,
    pub username: String,
}

/// Best round times, ascending, at most [`MAX_ENTRIES`] long.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Highscore {
    entries: Vec<HighscoreEntry>,
}

impl Highscore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the table from disk, falling back to an empty one if the file
    /// is missing or does not deserialize.
    pub fn load(path: &Path) -> Self {
        match std::fs::read(path) {
            Ok(bytes) => match bincode::deserialize::<Highscore>(&bytes) {
                Ok(highscore) => {
                    info!(
                        "Loaded {} highscore entries from {}",
                        highscore.entries.len(),
                        path.display()
                    );
                    highscore
                }
                Err(e) => {
                    warn!(
                        "Highscore file {} is corrupt ({}), starting fresh",
                        path.display(),
                        e
                    );
                    Self::new()
                }
            },
            Err(_) => {
                info!("No highscore file at {}, starting fresh", path.display());
                Self::new()
            }
        }
    }

    /// Writes the table back to disk.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, bytes)?;
        info!(
            "Saved {} highscore entries to {}",
            self.entries.len(),
            path.display()
        );
        Ok(())
    }

    /// Inserts a result, keeping the list sorted ascending and trimmed to
    /// [`MAX_ENTRIES`]. Returns true if the result made the table.
    pub fn add(&mut self, time_millis: u64, username: &str) -> bool {
        let entry = HighscoreEntry {
            time_millis,
            username: username.to_string(),
        };
        let pos = self
            .entries
            .partition_point(|e| e.time_millis <= entry.time_millis);
        if pos >= MAX_ENTRIES {
            return false;
        }
        self.entries.insert(pos, entry);
        self.entries.truncate(MAX_ENTRIES);
        true
    }

    pub fn entries(&self) -> &[HighscoreEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
