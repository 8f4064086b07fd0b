//! Page source contracts, the ornitho.cat listing adapter and species name lookup.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use ornitho_core::{display_species, scientific_name, PageEvent, RawPageRecord};
use ornitho_storage::{FetchError, HttpFetcher, PolitenessDelay};
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "ornitho-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Pull-based feed of listing records. Each call yields the next record, or
/// one of the two terminal sentinels.
#[async_trait]
pub trait PageSource: Send {
    async fn next_event(&mut self) -> Result<PageEvent, AdapterError>;

    /// Number of listing pages actually retrieved so far.
    fn pages_fetched(&self) -> usize {
        0
    }
}

/// Replays a fixed list of events, then reports end of feed forever.
#[derive(Debug, Clone, Default)]
pub struct ScriptedPageSource {
    events: VecDeque<PageEvent>,
    pulled: usize,
}

impl ScriptedPageSource {
    pub fn new(events: impl IntoIterator<Item = PageEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
            pulled: 0,
        }
    }

    pub fn from_records(records: impl IntoIterator<Item = RawPageRecord>) -> Self {
        Self::new(records.into_iter().map(PageEvent::Record))
    }

    /// How many events have been handed out, sentinels included.
    pub fn pulled(&self) -> usize {
        self.pulled
    }
}

#[async_trait]
impl PageSource for ScriptedPageSource {
    async fn next_event(&mut self) -> Result<PageEvent, AdapterError> {
        self.pulled += 1;
        Ok(self.events.pop_front().unwrap_or(PageEvent::EndOfFeed))
    }
}

/// One location block as parsed from a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingBlock {
    pub location: String,
    pub date: Option<String>,
    pub species: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedPage {
    pub blocks: Vec<ListingBlock>,
    /// Date header in effect at the end of the page; carried into the next page.
    pub last_date: Option<String>,
    pub skipped_blocks: usize,
}

impl ParsedPage {
    /// Records in page order. The first block without a resolvable date
    /// turns into a `TransientMiss` and ends the page.
    pub fn into_events(self) -> Vec<PageEvent> {
        let mut events = Vec::with_capacity(self.blocks.len());
        for block in self.blocks {
            if block.date.is_none() {
                events.push(PageEvent::TransientMiss);
                break;
            }
            events.push(PageEvent::Record(RawPageRecord::new(
                block.location,
                block.species,
                block.date,
            )));
        }
        events
    }
}

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn element_text(el: &ElementRef<'_>) -> String {
    normalize_ws(&el.text().collect::<String>())
}

fn has_class(el: &ElementRef<'_>, class: &str) -> bool {
    el.value().classes().any(|c| c == class)
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))
}

/// Species line for one observation row: the row text with the scientific
/// name moved into a trailing parenthesis group.
fn species_line(row: &ElementRef<'_>, sci_sel: &Selector) -> Option<String> {
    let text = element_text(row);
    if text.is_empty() {
        return None;
    }
    let Some(sci) = row.select(sci_sel).next().map(|n| element_text(&n)) else {
        return Some(text);
    };
    let sci = sci.trim_matches(|c| c == '(' || c == ')').trim().to_string();
    if sci.is_empty() {
        return Some(text);
    }
    let without = normalize_ws(&text.replacen(&format!("({sci})"), "", 1).replacen(&sci, "", 1));
    if without.is_empty() {
        Some(format!("({sci})"))
    } else {
        Some(format!("{without} ({sci})"))
    }
}

/// Parse one ornitho listing page. Blocks are `div.listSubmenu` (location)
/// followed by `div.listObservation` (one species per child element);
/// `div.listTop` headers set the date for the blocks after them.
pub fn parse_listing_page(html: &str, carried_date: Option<&str>) -> Result<ParsedPage, AdapterError> {
    let document = Html::parse_document(html);
    let sections = parse_selector("div.listTop, div.listSubmenu, div.listObservation")?;
    let sci_sel = parse_selector("span.sci_name")?;

    let mut page = ParsedPage {
        last_date: carried_date.map(ToString::to_string),
        ..Default::default()
    };
    let mut pending_location: Option<String> = None;

    for section in document.select(&sections) {
        if has_class(&section, "listTop") {
            // An empty header is a new day we cannot read.
            let date = element_text(&section);
            page.last_date = (!date.is_empty()).then_some(date);
        } else if has_class(&section, "listSubmenu") {
            if let Some(orphan) = pending_location.take() {
                warn!(location = %orphan, "location block without observations, skipping");
                page.skipped_blocks += 1;
            }
            pending_location = Some(element_text(&section));
        } else if has_class(&section, "listObservation") {
            let Some(location) = pending_location.take() else {
                warn!("observation list without a location header, skipping");
                page.skipped_blocks += 1;
                continue;
            };
            if location.is_empty() {
                warn!("observation block with an empty location, skipping");
                page.skipped_blocks += 1;
                continue;
            }
            let species = section
                .children()
                .filter_map(ElementRef::wrap)
                .filter_map(|row| species_line(&row, &sci_sel))
                .collect::<Vec<_>>();
            if species.is_empty() {
                warn!(location = %location, "observation block without species, skipping");
                page.skipped_blocks += 1;
                continue;
            }
            page.blocks.push(ListingBlock {
                location,
                date: page.last_date.clone(),
                species,
            });
        }
    }

    if let Some(orphan) = pending_location {
        warn!(location = %orphan, "trailing location block without observations, skipping");
        page.skipped_blocks += 1;
    }

    Ok(page)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingConfig {
    pub base_url: String,
    pub days_offset: u32,
    pub items_per_page: u32,
    pub max_pages: usize,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.ornitho.cat/index.php".to_string(),
            days_offset: 2,
            items_per_page: 20,
            max_pages: 10,
        }
    }
}

impl ListingConfig {
    pub fn page_url(&self, page: usize) -> String {
        format!(
            "{}?m_id=4&sp_DOffset={}&mp_item_per_page={}&mp_current_page={}",
            self.base_url, self.days_offset, self.items_per_page, page
        )
    }
}

#[derive(Debug)]
enum ListingBackend {
    Http { http: HttpFetcher, delay: PolitenessDelay },
    /// `page-<n>.html` files in a directory; the first missing file ends the feed.
    Fixtures { dir: PathBuf },
}

/// Lazily paginated ornitho listing. Pages are only requested once every
/// record of the previous page has been handed out.
#[derive(Debug)]
pub struct OrnithoListingSource {
    backend: ListingBackend,
    config: ListingConfig,
    buffer: VecDeque<PageEvent>,
    next_page: usize,
    carried_date: Option<String>,
    pages_fetched: usize,
    finished: bool,
}

impl OrnithoListingSource {
    pub fn http(http: HttpFetcher, config: ListingConfig, delay: PolitenessDelay) -> Self {
        Self::with_backend(ListingBackend::Http { http, delay }, config)
    }

    pub fn fixtures(dir: impl Into<PathBuf>, max_pages: usize) -> Self {
        let config = ListingConfig {
            max_pages,
            ..Default::default()
        };
        Self::with_backend(ListingBackend::Fixtures { dir: dir.into() }, config)
    }

    fn with_backend(backend: ListingBackend, config: ListingConfig) -> Self {
        Self {
            backend,
            config,
            buffer: VecDeque::new(),
            next_page: 1,
            carried_date: None,
            pages_fetched: 0,
            finished: false,
        }
    }

    async fn load_page(&self, page: usize) -> Result<Option<String>, AdapterError> {
        match &self.backend {
            ListingBackend::Http { http, delay } => {
                if page > 1 {
                    delay.wait().await;
                }
                let url = self.config.page_url(page);
                debug!(page, url = %url, "fetching listing page");
                let resp = http.fetch_text(&url).await?;
                Ok(Some(resp.body))
            }
            ListingBackend::Fixtures { dir } => {
                let path = dir.join(format!("page-{page}.html"));
                match tokio::fs::read_to_string(&path).await {
                    Ok(text) => Ok(Some(text)),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(err) => Err(anyhow::Error::new(err)
                        .context(format!("reading fixture page {}", path.display()))
                        .into()),
                }
            }
        }
    }
}

#[async_trait]
impl PageSource for OrnithoListingSource {
    async fn next_event(&mut self) -> Result<PageEvent, AdapterError> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                if !matches!(event, PageEvent::Record(_)) {
                    self.finished = true;
                    self.buffer.clear();
                }
                return Ok(event);
            }
            if self.finished {
                return Ok(PageEvent::EndOfFeed);
            }

            let page = self.next_page;
            if page > self.config.max_pages {
                info!(max_pages = self.config.max_pages, "page limit reached");
                self.finished = true;
                return Ok(PageEvent::EndOfFeed);
            }

            let Some(html) = self.load_page(page).await? else {
                self.finished = true;
                return Ok(PageEvent::EndOfFeed);
            };
            self.pages_fetched += 1;
            self.next_page += 1;

            let parsed = parse_listing_page(&html, self.carried_date.as_deref())?;
            debug!(
                page,
                blocks = parsed.blocks.len(),
                skipped = parsed.skipped_blocks,
                "parsed listing page"
            );
            if parsed.blocks.is_empty() && parsed.skipped_blocks == 0 {
                self.finished = true;
                return Ok(PageEvent::EndOfFeed);
            }
            self.carried_date = parsed.last_date.clone();
            self.buffer.extend(parsed.into_events());
        }
    }

    fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

/// Scientific-name to common-name lookup.
pub trait NameLookup: Send + Sync {
    fn common_name(&self, scientific: &str) -> Option<String>;
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NamesFile {
    #[serde(default)]
    names: HashMap<String, String>,
}

/// Fixed lookup table, usually loaded from a YAML file of the form
/// `names: { "Larus michahellis": "Gavià argentat" }`.
#[derive(Debug, Clone, Default)]
pub struct TableNameLookup {
    names: HashMap<String, String>,
}

impl TableNameLookup {
    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            names: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// A missing file yields an empty table.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "names file not found, common names disabled");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let file: NamesFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self { names: file.names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl NameLookup for TableNameLookup {
    fn common_name(&self, scientific: &str) -> Option<String> {
        self.names.get(scientific.trim()).cloned()
    }
}

/// Memoising wrapper around another lookup. The cache belongs to whoever owns
/// the wrapper; with a capacity set, new entries stop being admitted once full.
#[derive(Debug)]
pub struct CachedNameLookup<L> {
    inner: L,
    capacity: Option<usize>,
    cache: Mutex<HashMap<String, Option<String>>>,
}

impl<L: NameLookup> CachedNameLookup<L> {
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            capacity: None,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn bounded(inner: L, capacity: usize) -> Self {
        Self {
            inner,
            capacity: Some(capacity),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl<L: NameLookup> NameLookup for CachedNameLookup<L> {
    fn common_name(&self, scientific: &str) -> Option<String> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = cache.get(scientific) {
            return hit.clone();
        }
        let value = self.inner.common_name(scientific);
        if self.capacity.map_or(true, |cap| cache.len() < cap) {
            cache.insert(scientific.to_string(), value.clone());
        }
        value
    }
}

/// Append common names to each species line of a record.
pub fn translate_record(record: RawPageRecord, lookup: &dyn NameLookup) -> RawPageRecord {
    let species = record
        .species
        .into_iter()
        .map(|raw| {
            let common = scientific_name(&raw)
                .ok()
                .and_then(|sci| lookup.common_name(sci));
            display_species(&raw, common.as_deref())
        })
        .collect();
    RawPageRecord {
        species,
        ..record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_dir() -> PathBuf {
        workspace_root().join("fixtures").join("ornitho").join("listing")
    }

    fn record(location: &str, date: &str, species: &[&str]) -> PageEvent {
        PageEvent::Record(RawPageRecord::new(
            location,
            species.iter().map(|s| s.to_string()).collect(),
            Some(date.to_string()),
        ))
    }

    #[test]
    fn parses_blocks_with_dates_and_scientific_names() {
        let html = r#"
            <div class="listTop">Dijous,  15 d'octubre</div>
            <div class="listSubmenu">Sant Cugat (VOC)</div>
            <div class="listObservation">
                <div><b>3</b> Gavià argentat <span class="sci_name">Larus michahellis</span></div>
                <div>Pit-roig <span class="sci_name">(Erithacus rubecula)</span></div>
            </div>
        "#;
        let page = parse_listing_page(html, None).unwrap();
        assert_eq!(page.skipped_blocks, 0);
        assert_eq!(
            page.blocks,
            vec![ListingBlock {
                location: "Sant Cugat (VOC)".into(),
                date: Some("Dijous, 15 d'octubre".into()),
                species: vec![
                    "3 Gavià argentat (Larus michahellis)".into(),
                    "Pit-roig (Erithacus rubecula)".into(),
                ],
            }]
        );
        assert_eq!(page.last_date.as_deref(), Some("Dijous, 15 d'octubre"));
    }

    #[test]
    fn malformed_blocks_are_skipped_not_fatal() {
        let html = r#"
            <div class="listTop">d1</div>
            <div class="listObservation"><div>orphan</div></div>
            <div class="listSubmenu">   </div>
            <div class="listObservation"><div>x</div></div>
            <div class="listSubmenu">No species</div>
            <div class="listObservation"><div>  </div></div>
            <div class="listSubmenu">Good</div>
            <div class="listObservation"><div>Merla (Turdus merula)</div></div>
            <div class="listSubmenu">Trailing</div>
        "#;
        let page = parse_listing_page(html, None).unwrap();
        assert_eq!(page.skipped_blocks, 4);
        assert_eq!(page.blocks.len(), 1);
        assert_eq!(page.blocks[0].location, "Good");
        assert_eq!(page.blocks[0].species, vec!["Merla (Turdus merula)".to_string()]);
    }

    #[test]
    fn undated_block_becomes_transient_miss() {
        let html = r#"
            <div class="listSubmenu">A</div>
            <div class="listObservation"><div>Merla (Turdus merula)</div></div>
        "#;
        let events = parse_listing_page(html, None).unwrap().into_events();
        assert_eq!(events, vec![PageEvent::TransientMiss]);

        let events = parse_listing_page(html, Some("d0")).unwrap().into_events();
        assert_eq!(events, vec![record("A", "d0", &["Merla (Turdus merula)"])]);
    }

    #[test]
    fn page_url_carries_pagination_parameters() {
        let config = ListingConfig::default();
        assert_eq!(
            config.page_url(3),
            "https://www.ornitho.cat/index.php?m_id=4&sp_DOffset=2&mp_item_per_page=20&mp_current_page=3"
        );
    }

    #[tokio::test]
    async fn fixture_source_spans_pages_and_ends_on_missing_page() {
        let mut source = OrnithoListingSource::fixtures(fixture_dir(), 10);
        let mut events = Vec::new();
        loop {
            let event = source.next_event().await.unwrap();
            let done = !matches!(event, PageEvent::Record(_));
            events.push(event);
            if done {
                break;
            }
        }
        assert_eq!(source.pages_fetched(), 2);

        let snapshot_path = workspace_root()
            .join("fixtures")
            .join("ornitho")
            .join("listing")
            .join("snapshot.json");
        let expected: Vec<RawPageRecord> =
            serde_json::from_str(&std::fs::read_to_string(snapshot_path).unwrap()).unwrap();
        let mut expected = expected.into_iter().map(PageEvent::Record).collect::<Vec<_>>();
        expected.push(PageEvent::EndOfFeed);
        assert_eq!(events, expected);
        assert_eq!(source.next_event().await.unwrap(), PageEvent::EndOfFeed);
    }

    #[tokio::test]
    async fn fixture_source_respects_page_limit() {
        let mut source = OrnithoListingSource::fixtures(fixture_dir(), 1);
        let mut records = 0;
        while let PageEvent::Record(_) = source.next_event().await.unwrap() {
            records += 1;
        }
        assert_eq!(source.pages_fetched(), 1);
        assert_eq!(records, 2);
    }

    #[tokio::test]
    async fn fixture_source_ends_with_transient_miss_when_first_page_is_undated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("page-1.html"),
            r#"<div class="listSubmenu">A</div><div class="listObservation"><div>x (y)</div></div>"#,
        )
        .unwrap();
        let mut source = OrnithoListingSource::fixtures(dir.path(), 5);
        assert_eq!(source.next_event().await.unwrap(), PageEvent::TransientMiss);
        assert_eq!(source.next_event().await.unwrap(), PageEvent::EndOfFeed);
        assert_eq!(source.pages_fetched(), 1);
    }

    #[tokio::test]
    async fn fixture_source_delivers_dated_blocks_before_transient_miss() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("page-1.html"),
            r#"
            <div class="listTop">d1</div>
            <div class="listSubmenu">A</div><div class="listObservation"><div>x (y)</div></div>
            <div class="listSubmenu">B</div><div class="listObservation"><div>z (w)</div></div>
            <div class="listTop"> </div>
            <div class="listSubmenu">C</div><div class="listObservation"><div>u (v)</div></div>
            <div class="listTop">d0</div>
            <div class="listSubmenu">D</div><div class="listObservation"><div>t (s)</div></div>
            "#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("page-2.html"),
            r#"<div class="listTop">d0</div><div class="listSubmenu">E</div><div class="listObservation"><div>q (r)</div></div>"#,
        )
        .unwrap();

        let mut source = OrnithoListingSource::fixtures(dir.path(), 5);
        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(source.next_event().await.unwrap());
        }
        assert_eq!(
            events,
            vec![
                record("A", "d1", &["x (y)"]),
                record("B", "d1", &["z (w)"]),
                PageEvent::TransientMiss,
            ]
        );
        for _ in 0..3 {
            assert_eq!(source.next_event().await.unwrap(), PageEvent::EndOfFeed);
        }
        assert_eq!(source.pages_fetched(), 1);
    }

    #[tokio::test]
    async fn scripted_source_replays_then_ends() {
        let mut source = ScriptedPageSource::new(vec![record("A", "d", &["x"]), PageEvent::TransientMiss]);
        assert!(matches!(source.next_event().await.unwrap(), PageEvent::Record(_)));
        assert_eq!(source.next_event().await.unwrap(), PageEvent::TransientMiss);
        assert_eq!(source.next_event().await.unwrap(), PageEvent::EndOfFeed);
        assert_eq!(source.pulled(), 3);
    }

    #[test]
    fn table_lookup_loads_yaml_and_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("names.yaml");
        std::fs::write(&path, "names:\n  Larus michahellis: Yellow-legged Gull\n").unwrap();
        let table = TableNameLookup::from_yaml_file(&path).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.common_name("Larus michahellis").as_deref(), Some("Yellow-legged Gull"));
        assert_eq!(table.common_name("Turdus merula"), None);

        let missing = TableNameLookup::from_yaml_file(dir.path().join("missing.yaml")).unwrap();
        assert!(missing.is_empty());
    }

    struct CountingLookup {
        calls: AtomicUsize,
    }

    impl NameLookup for CountingLookup {
        fn common_name(&self, scientific: &str) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (scientific == "Turdus merula").then(|| "Blackbird".to_string())
        }
    }

    #[test]
    fn cached_lookup_memoises_hits_and_misses() {
        let cached = CachedNameLookup::new(CountingLookup { calls: AtomicUsize::new(0) });
        for _ in 0..3 {
            assert_eq!(cached.common_name("Turdus merula").as_deref(), Some("Blackbird"));
            assert_eq!(cached.common_name("Unknown"), None);
        }
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.cached_entries(), 2);
    }

    #[test]
    fn bounded_cache_stops_admitting_entries() {
        let cached = CachedNameLookup::bounded(CountingLookup { calls: AtomicUsize::new(0) }, 1);
        cached.common_name("a");
        cached.common_name("b");
        cached.common_name("b");
        assert_eq!(cached.cached_entries(), 1);
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn translate_record_appends_known_common_names() {
        let lookup = TableNameLookup::from_pairs([("Turdus merula", "Blackbird")]);
        let record = RawPageRecord::new(
            "A",
            vec!["Merla (Turdus merula)".to_string(), "Pit-roig".to_string()],
            Some("d".to_string()),
        );
        let translated = translate_record(record, &lookup);
        assert_eq!(
            translated.species,
            vec!["Merla (Turdus merula) - Blackbird".to_string(), "Pit-roig".to_string()]
        );
        assert_eq!(translated.date.as_deref(), Some("d"));
    }
}
