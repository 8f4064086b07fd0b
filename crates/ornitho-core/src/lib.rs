//! Core sighting model and pure text helpers for the ornitho notifier.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ornitho-core";

/// One listing block as it comes off a page: a location header and the
/// species lines underneath it, in feed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPageRecord {
    pub location: String,
    pub species: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl RawPageRecord {
    pub fn new(location: impl Into<String>, species: Vec<String>, date: Option<String>) -> Self {
        Self {
            location: location.into(),
            species,
            date,
        }
    }

    pub fn key(&self) -> SightingKey {
        SightingKey {
            location: self.location.clone(),
            date: self.date.clone(),
        }
    }
}

/// What a page source hands back on each pull.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageEvent {
    Record(RawPageRecord),
    /// No more pages. Whatever is still being accumulated is complete.
    EndOfFeed,
    /// The page could not be read as a whole (no date could be resolved).
    /// Whatever is still being accumulated may be incomplete and must be dropped.
    TransientMiss,
}

/// Grouping key for merging consecutive records. A missing date is part of
/// the key: undated records only merge with other undated records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SightingKey {
    pub location: String,
    pub date: Option<String>,
}

/// Merged species list for one location (and date). Unit of notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sighting {
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    pub species: Vec<String>,
}

impl Sighting {
    pub fn key(&self) -> SightingKey {
        SightingKey {
            location: self.location.clone(),
            date: self.date.clone(),
        }
    }

    pub fn has_key(&self, key: &SightingKey) -> bool {
        self.location == key.location && self.date == key.date
    }

    pub fn comarca(&self) -> Option<&str> {
        comarca(&self.location)
    }
}

impl From<RawPageRecord> for Sighting {
    fn from(record: RawPageRecord) -> Self {
        Self {
            location: record.location,
            date: record.date,
            species: record.species,
        }
    }
}

/// Persisted "already sent" state. Serialized untagged: a single JSON object
/// for the cursor shape, a JSON array for the history shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SentState {
    Cursor(Sighting),
    History(Vec<Sighting>),
}

impl Default for SentState {
    fn default() -> Self {
        SentState::History(Vec::new())
    }
}

impl SentState {
    /// The stopping point for the single-cursor policy. A history-shaped
    /// state carries no cursor.
    pub fn cursor(&self) -> Option<&Sighting> {
        match self {
            SentState::Cursor(s) => Some(s),
            SentState::History(_) => None,
        }
    }

    /// Everything previously seen, for the full-set policy. A cursor counts
    /// as a one-element history.
    pub fn history(&self) -> &[Sighting] {
        match self {
            SentState::Cursor(s) => std::slice::from_ref(s),
            SentState::History(items) => items,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.history().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no parenthesised name in {0:?}")]
    NotFound(String),
}

/// Comarca code embedded in a location name, e.g. `"Sant Cugat (VAL)"` -> `VAL`.
/// Only parenthesised groups of exactly three uppercase ASCII letters count;
/// the last such group wins.
pub fn comarca(location: &str) -> Option<&str> {
    let bytes = location.as_bytes();
    let mut found = None;
    let mut i = 0;
    while i + 4 < bytes.len() {
        if bytes[i] == b'('
            && bytes[i + 4] == b')'
            && bytes[i + 1..i + 4].iter().all(u8::is_ascii_uppercase)
        {
            found = Some(&location[i + 1..i + 4]);
            i += 5;
            continue;
        }
        i += 1;
    }
    found
}

/// Inner text of the last top-level parenthesis group in a species line,
/// e.g. `"Gavià argentat (Larus michahellis)"` -> `Larus michahellis`.
pub fn scientific_name(species: &str) -> Result<&str, ParseError> {
    let not_found = || ParseError::NotFound(species.to_string());
    let mut depth = 0usize;
    let mut open_at = None;
    let mut last = None;
    for (idx, ch) in species.char_indices() {
        match ch {
            '(' => {
                if depth == 0 {
                    open_at = Some(idx);
                }
                depth += 1;
            }
            ')' => {
                // Stray closer.
                if depth == 0 {
                    continue;
                }
                depth -= 1;
                if depth == 0 {
                    if let Some(start) = open_at.take() {
                        last = Some((start + 1, idx));
                    }
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(not_found());
    }
    match last {
        Some((start, end)) => {
            let inner = species[start..end].trim();
            if inner.is_empty() {
                Err(not_found())
            } else {
                Ok(inner)
            }
        }
        None => Err(not_found()),
    }
}

/// Species line shown to the user, with the common name appended when known.
pub fn display_species(raw: &str, common: Option<&str>) -> String {
    match common {
        Some(name) if !name.trim().is_empty() => format!("{raw} - {}", name.trim()),
        _ => raw.to_string(),
    }
}

/// Text block printed for one notified sighting.
pub fn render_notification(sighting: &Sighting) -> String {
    let mut out = format!("Location: {}\n", sighting.location);
    if let Some(date) = &sighting.date {
        out.push_str(&format!("Date: {date}\n"));
    }
    out.push_str(&format!("Comarca: {}\n", sighting.comarca().unwrap_or("-")));
    for species in &sighting.species {
        out.push_str("  ");
        out.push_str(species);
        out.push('\n');
    }
    out
}
