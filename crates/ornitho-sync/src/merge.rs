//! Coalescing of consecutive listing records into sightings.

use ornitho_adapters::{translate_record, AdapterError, NameLookup, PageSource};
use ornitho_core::{PageEvent, RawPageRecord, Sighting};
use tracing::{debug, warn};

/// Keeps one open sighting and closes it when a record with another key
/// arrives. Species are concatenated in arrival order, duplicates included.
#[derive(Debug, Default)]
pub struct SightingMerger {
    open: Option<Sighting>,
}

impl SightingMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one record. Returns the previous sighting if this record closed it.
    pub fn push(&mut self, record: RawPageRecord) -> Option<Sighting> {
        if let Some(open) = self.open.as_mut() {
            if open.has_key(&record.key()) {
                open.species.extend(record.species);
                return None;
            }
        }
        self.open.replace(Sighting::from(record))
    }

    /// End of feed: the open sighting is complete.
    pub fn finish(&mut self) -> Option<Sighting> {
        self.open.take()
    }

    /// Transient miss: the open sighting may be incomplete, drop it.
    pub fn abandon(&mut self) {
        if let Some(dropped) = self.open.take() {
            debug!(
                location = %dropped.location,
                species = dropped.species.len(),
                "dropping open sighting after transient miss"
            );
        }
    }
}

/// Iterator adapter over an in-memory event sequence.
#[derive(Debug)]
pub struct MergedSightings<I> {
    events: I,
    merger: SightingMerger,
    done: bool,
}

pub fn merge_sightings<I>(events: I) -> MergedSightings<I::IntoIter>
where
    I: IntoIterator<Item = PageEvent>,
{
    MergedSightings {
        events: events.into_iter(),
        merger: SightingMerger::new(),
        done: false,
    }
}

impl<I: Iterator<Item = PageEvent>> Iterator for MergedSightings<I> {
    type Item = Sighting;

    fn next(&mut self) -> Option<Sighting> {
        if self.done {
            return None;
        }
        loop {
            match self.events.next() {
                Some(PageEvent::Record(record)) => {
                    if let Some(closed) = self.merger.push(record) {
                        return Some(closed);
                    }
                }
                Some(PageEvent::EndOfFeed) | None => {
                    self.done = true;
                    return self.merger.finish();
                }
                Some(PageEvent::TransientMiss) => {
                    self.done = true;
                    self.merger.abandon();
                    return None;
                }
            }
        }
    }
}

/// Async counterpart of [`MergedSightings`] that pulls from a [`PageSource`]
/// only when the next sighting is requested.
pub struct SightingStream<'a> {
    source: &'a mut dyn PageSource,
    lookup: Option<&'a dyn NameLookup>,
    merger: SightingMerger,
    records: usize,
    done: bool,
    ended_on_miss: bool,
}

impl<'a> SightingStream<'a> {
    pub fn new(source: &'a mut dyn PageSource) -> Self {
        Self {
            source,
            lookup: None,
            merger: SightingMerger::new(),
            records: 0,
            done: false,
            ended_on_miss: false,
        }
    }

    /// Translate species names before merging.
    pub fn with_lookup(mut self, lookup: &'a dyn NameLookup) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn records_pulled(&self) -> usize {
        self.records
    }

    pub fn ended_on_miss(&self) -> bool {
        self.ended_on_miss
    }

    pub fn pages_fetched(&self) -> usize {
        self.source.pages_fetched()
    }

    pub async fn next(&mut self) -> Result<Option<Sighting>, AdapterError> {
        if self.done {
            return Ok(None);
        }
        loop {
            match self.source.next_event().await? {
                PageEvent::Record(record) => {
                    self.records += 1;
                    let record = match self.lookup {
                        Some(lookup) => translate_record(record, lookup),
                        None => record,
                    };
                    if let Some(closed) = self.merger.push(record) {
                        return Ok(Some(closed));
                    }
                }
                PageEvent::EndOfFeed => {
                    self.done = true;
                    return Ok(self.merger.finish());
                }
                PageEvent::TransientMiss => {
                    warn!(records = self.records, "feed ended on a transient miss");
                    self.done = true;
                    self.ended_on_miss = true;
                    self.merger.abandon();
                    return Ok(None);
                }
            }
        }
    }
}
