//! Monitoring engine: catalog, quotas, per-source tickers and the scrape cycle.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, TimeZone, Utc};
use croner::Cron;
use licita_adapters::{
    is_valid_at, normalize_record, AuthRegistry, CompiledSelectors, ParseError,
};
use licita_core::{
    MonitoringEvent, MonitoringSource, MonitoringStats, OpportunityFilter, OpportunityStatus,
    ScrapedOpportunity, SourceHealth, SourceState, SourceStats, WatchList,
};
use licita_storage::{
    Deduplicator, FetchError, HttpClientConfig, HttpFetcher, InMemoryOpportunityStore,
    OpportunityStore, PageFetcher, PersistenceError, PgOpportunityStore, RequestBudget,
    DEFAULT_LIST_LIMIT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "licita-sync";

const SEED_SOURCES_YAML: &str = include_str!("../../../sources.yaml");

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) licita-monitor/0.1";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    pub database_url: Option<String>,
    pub sources_path: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub run_on_start: bool,
    pub event_capacity: usize,
    pub web_port: u16,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            sources_path: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 30,
            run_on_start: false,
            event_capacity: 1024,
            web_port: 8000,
        }
    }
}

impl MonitoringConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            sources_path: std::env::var("LICITA_SOURCES_PATH").ok().map(PathBuf::from),
            user_agent: std::env::var("LICITA_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: std::env::var("LICITA_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            run_on_start: std::env::var("LICITA_RUN_ON_START")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.run_on_start),
            event_capacity: std::env::var("LICITA_EVENT_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|v: &usize| *v > 0)
                .unwrap_or(defaults.event_capacity),
            web_port: std::env::var("LICITA_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("source {0} already exists")]
    DuplicateId(String),
    #[error("unknown source {0}")]
    UnknownSource(String),
    #[error("invalid source {source_id}: {message}")]
    Invalid { source_id: String, message: String },
    #[error(transparent)]
    Selector(#[from] ParseError),
    #[error(transparent)]
    Cadence(#[from] CadenceError),
    #[error("malformed source catalog: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("source {0} already has a cycle in flight")]
    Busy(String),
    #[error("invalid watch-list: {0}")]
    InvalidWatchList(String),
    #[error("unknown watch-list {0}")]
    UnknownWatchList(Uuid),
}

// ---------------------------------------------------------------------------
// Cadence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported cadence {expr:?}: {reason}")]
pub struct CadenceError {
    pub expr: String,
    pub reason: String,
}

const CRON_FALLBACK_DELAY: Duration = Duration::from_secs(3600);

/// When a source's ticker fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    /// Five-field cron expression evaluated in local time.
    Cron(String),
}

impl Cadence {
    pub fn parse(expr: &str) -> Result<Self, CadenceError> {
        let trimmed = expr.trim();
        let fail = |reason: String| CadenceError {
            expr: expr.to_string(),
            reason,
        };

        let pattern = match trimmed {
            "" => return Err(fail("empty expression".into())),
            "@hourly" => "0 * * * *",
            "@daily" | "@midnight" => "0 0 * * *",
            "@weekly" => "0 0 * * 0",
            "@monthly" => "0 0 1 * *",
            other if !other.contains(char::is_whitespace) => {
                return parse_shorthand(other)
                    .ok_or_else(|| fail("expected an interval like 30s, 15m, 2h or 1d".into()));
            }
            other => other,
        };
        if pattern.split_whitespace().count() != 5 {
            return Err(fail("cron expressions need five fields".into()));
        }
        Cron::new(pattern)
            .parse()
            .map_err(|err| fail(err.to_string()))?;
        Ok(Self::Cron(pattern.to_string()))
    }

    /// Time to wait from `now` until the next firing.
    pub fn next_delay<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Duration {
        match self {
            Self::Every(interval) => *interval,
            Self::Cron(pattern) => Cron::new(pattern)
                .parse()
                .and_then(|cron| cron.find_next_occurrence(now, false))
                .ok()
                .and_then(|next| next.signed_duration_since(now).to_std().ok())
                .unwrap_or_else(|| {
                    warn!(pattern = %pattern, "no upcoming cron occurrence; retrying in an hour");
                    CRON_FALLBACK_DELAY
                }),
        }
    }
}

impl FromStr for Cadence {
    type Err = CadenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_shorthand(text: &str) -> Option<Cadence> {
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = text.split_at(split);
    let n: u64 = digits.parse().ok().filter(|n| *n > 0)?;
    let secs = match unit {
        "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3600)?,
        "d" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Cadence::Every(Duration::from_secs(secs)))
}

// ---------------------------------------------------------------------------
// Source catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceCatalogFile {
    pub sources: Vec<MonitoringSource>,
}

pub fn parse_catalog(yaml: &str) -> Result<Vec<MonitoringSource>, CatalogError> {
    let file: SourceCatalogFile = serde_yaml::from_str(yaml)?;
    Ok(file.sources)
}

/// The portals shipped with the binary.
pub fn seed_sources() -> Result<Vec<MonitoringSource>, CatalogError> {
    parse_catalog(SEED_SOURCES_YAML)
}

pub fn load_sources(config: &MonitoringConfig) -> anyhow::Result<Vec<MonitoringSource>> {
    match &config.sources_path {
        Some(path) => {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            parse_catalog(&yaml).with_context(|| format!("parsing {}", path.display()))
        }
        None => seed_sources().context("parsing embedded sources.yaml"),
    }
}

/// Checks everything a cycle relies on and returns the parsed cadence.
pub fn validate_source(source: &MonitoringSource) -> Result<Cadence, CatalogError> {
    let invalid = |message: String| CatalogError::Invalid {
        source_id: source.id.clone(),
        message,
    };
    for (field, value) in [("id", &source.id), ("name", &source.name), ("url", &source.url)] {
        if value.trim().is_empty() {
            return Err(invalid(format!("{field} must not be empty")));
        }
    }
    Url::parse(&source.url.replace("{page}", "1"))
        .map_err(|e| invalid(format!("url {}: {e}", source.url)))?;
    if source.limits.max_pages == 0 {
        return Err(invalid("max_pages must be at least 1".to_string()));
    }
    if source.limits.daily_limit == 0 {
        return Err(invalid("daily_limit must be at least 1".to_string()));
    }
    CompiledSelectors::compile(&source.selectors)?;
    Ok(Cadence::parse(&source.update_frequency)?)
}

/// A catalog entry plus the flag that keeps its cycles from overlapping.
#[derive(Debug)]
pub struct SourceSlot {
    source: RwLock<MonitoringSource>,
    busy: AtomicBool,
}

impl SourceSlot {
    fn new(source: MonitoringSource) -> Arc<Self> {
        Arc::new(Self {
            source: RwLock::new(source),
            busy: AtomicBool::new(false),
        })
    }

    pub async fn snapshot(&self) -> MonitoringSource {
        self.source.read().await.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn state(&self) -> SourceState {
        if !self.source.read().await.is_active {
            SourceState::Inactive
        } else if self.is_busy() {
            SourceState::Scraping
        } else {
            SourceState::Active
        }
    }

    /// Claims the slot for one cycle; `None` while another cycle holds it.
    pub fn try_begin(self: &Arc<Self>) -> Option<CycleGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                slot: Arc::clone(self),
            })
    }
}

/// Releases the slot on drop, even if the cycle future is dropped early.
#[derive(Debug)]
pub struct CycleGuard {
    slot: Arc<SourceSlot>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.slot.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceView {
    #[serde(flatten)]
    pub source: MonitoringSource,
    pub state: SourceState,
}

#[derive(Debug, Default)]
pub struct SourceCatalog {
    slots: RwLock<BTreeMap<String, Arc<SourceSlot>>>,
}

impl SourceCatalog {
    pub fn from_sources(sources: Vec<MonitoringSource>) -> Result<Self, CatalogError> {
        let mut slots = BTreeMap::new();
        for source in sources {
            validate_source(&source)?;
            if slots.contains_key(&source.id) {
                return Err(CatalogError::DuplicateId(source.id));
            }
            slots.insert(source.id.clone(), SourceSlot::new(source));
        }
        Ok(Self {
            slots: RwLock::new(slots),
        })
    }

    pub async fn add(&self, source: MonitoringSource) -> Result<MonitoringSource, CatalogError> {
        validate_source(&source)?;
        let mut slots = self.slots.write().await;
        if slots.contains_key(&source.id) {
            return Err(CatalogError::DuplicateId(source.id));
        }
        slots.insert(source.id.clone(), SourceSlot::new(source.clone()));
        Ok(source)
    }

    pub async fn slot(&self, id: &str) -> Option<Arc<SourceSlot>> {
        self.slots.read().await.get(id).cloned()
    }

    pub async fn get(&self, id: &str) -> Option<MonitoringSource> {
        match self.slot(id).await {
            Some(slot) => Some(slot.snapshot().await),
            None => None,
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.read().await.is_empty()
    }

    pub async fn views(&self) -> Vec<SourceView> {
        let slots: Vec<Arc<SourceSlot>> = self.slots.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            out.push(SourceView {
                state: slot.state().await,
                source: slot.snapshot().await,
            });
        }
        out
    }

    pub async fn active_sources(&self) -> Vec<MonitoringSource> {
        self.views()
            .await
            .into_iter()
            .filter(|v| v.source.is_active)
            .map(|v| v.source)
            .collect()
    }

    pub async fn set_active(&self, id: &str, active: bool) -> Result<MonitoringSource, CatalogError> {
        let slot = self
            .slot(id)
            .await
            .ok_or_else(|| CatalogError::UnknownSource(id.to_string()))?;
        let mut source = slot.source.write().await;
        source.is_active = active;
        Ok(source.clone())
    }

    /// Folds one finished cycle into the source's health counters.
    pub async fn record_cycle(
        &self,
        id: &str,
        found: usize,
        elapsed: Duration,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) {
        if let Some(slot) = self.slot(id).await {
            let mut source = slot.source.write().await;
            StatsAggregator::record_cycle(&mut source.health, found, elapsed, error, now);
        }
    }
}

// ---------------------------------------------------------------------------
// Quota tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct DailyCount {
    day: NaiveDate,
    requests: u32,
}

/// Per-source request counters that roll over at local midnight.
#[derive(Debug, Default)]
pub struct QuotaTracker {
    counters: Mutex<HashMap<String, DailyCount>>,
}

fn local_today() -> NaiveDate {
    Local::now().date_naive()
}

impl QuotaTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn can_run(&self, source_id: &str, daily_limit: u32) -> bool {
        self.can_run_on(source_id, daily_limit, local_today()).await
    }

    pub async fn can_run_on(&self, source_id: &str, daily_limit: u32, day: NaiveDate) -> bool {
        self.used_on(source_id, day).await < daily_limit
    }

    pub async fn used_on(&self, source_id: &str, day: NaiveDate) -> u32 {
        self.counters
            .lock()
            .await
            .get(source_id)
            .filter(|c| c.day == day)
            .map(|c| c.requests)
            .unwrap_or(0)
    }

    pub async fn record(&self, source_id: &str) {
        self.record_on(source_id, local_today()).await
    }

    pub async fn record_on(&self, source_id: &str, day: NaiveDate) {
        let mut counters = self.counters.lock().await;
        let count = current_count(&mut counters, source_id, day);
        count.requests = count.requests.saturating_add(1);
    }

    /// Checks and records in one step so a request is never counted twice.
    pub async fn try_acquire(&self, source_id: &str, daily_limit: u32) -> bool {
        self.try_acquire_on(source_id, daily_limit, local_today()).await
    }

    pub async fn try_acquire_on(&self, source_id: &str, daily_limit: u32, day: NaiveDate) -> bool {
        let mut counters = self.counters.lock().await;
        let count = current_count(&mut counters, source_id, day);
        if count.requests >= daily_limit {
            return false;
        }
        count.requests += 1;
        true
    }
}

fn current_count<'a>(
    counters: &'a mut HashMap<String, DailyCount>,
    source_id: &str,
    day: NaiveDate,
) -> &'a mut DailyCount {
    let count = counters
        .entry(source_id.to_string())
        .or_insert(DailyCount { day, requests: 0 });
    if count.day != day {
        *count = DailyCount { day, requests: 0 };
    }
    count
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

const BRAZILIAN_STATES: [&str; 27] = [
    "AC", "AL", "AP", "AM", "BA", "CE", "DF", "ES", "GO", "MA", "MT", "MS", "MG", "PA", "PB", "PR",
    "PE", "PI", "RJ", "RN", "RS", "RO", "RR", "SC", "SP", "SE", "TO",
];

/// State abbreviation (UF) mentioned last in a location string.
pub fn state_of(location: &str) -> Option<&'static str> {
    location
        .split(|c: char| !c.is_ascii_alphabetic())
        .rev()
        .find_map(|token| BRAZILIAN_STATES.iter().copied().find(|uf| *uf == token))
}

pub struct StatsAggregator;

impl StatsAggregator {
    pub const SUCCESS_RATE_ALPHA: f64 = 0.1;
    pub const UPCOMING_WINDOW_DAYS: i64 = 7;

    pub fn record_cycle(
        health: &mut SourceHealth,
        found: usize,
        elapsed: Duration,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) {
        health.cycles_run += 1;
        health.last_update = Some(now);
        health.total_scraped += found as u64;

        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        health.average_response_time_ms +=
            (elapsed_ms - health.average_response_time_ms) / health.cycles_run as f64;

        let outcome = if error.is_none() { 100.0 } else { 0.0 };
        health.success_rate = (1.0 - Self::SUCCESS_RATE_ALPHA) * health.success_rate
            + Self::SUCCESS_RATE_ALPHA * outcome;
        health.last_error = error.map(str::to_string);
    }

    pub fn compute(
        sources: &[SourceView],
        opportunities: &[ScrapedOpportunity],
        now: DateTime<Utc>,
    ) -> MonitoringStats {
        let today = now.with_timezone(&Local).date_naive();
        let horizon = now + chrono::Duration::days(Self::UPCOMING_WINDOW_DAYS);

        let mut per_source: HashMap<&str, usize> = HashMap::new();
        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut values = Vec::new();
        let mut new_today = 0;
        let mut upcoming_deadlines = 0;

        for opp in opportunities {
            *per_source.entry(opp.source_id.as_str()).or_default() += 1;
            if let Some(uf) = opp.location.as_deref().and_then(state_of) {
                *by_state.entry(uf.to_string()).or_default() += 1;
            }
            if let Some(category) = opp.category.as_deref().filter(|c| !c.trim().is_empty()) {
                *by_category.entry(category.to_string()).or_default() += 1;
            }
            if let Some(value) = opp.value {
                values.push(value);
            }
            if opp.discovered_at.with_timezone(&Local).date_naive() == today {
                new_today += 1;
            }
            if opp.status == OpportunityStatus::Open && opp.deadline > now && opp.deadline <= horizon {
                upcoming_deadlines += 1;
            }
        }

        let by_source = sources
            .iter()
            .map(|view| {
                let s = &view.source;
                let stats = SourceStats {
                    name: s.name.clone(),
                    state: view.state,
                    opportunities: per_source.get(s.id.as_str()).copied().unwrap_or(0),
                    total_scraped: s.health.total_scraped,
                    success_rate: s.health.success_rate,
                    average_response_time_ms: s.health.average_response_time_ms,
                    last_update: s.health.last_update,
                    last_error: s.health.last_error.clone(),
                };
                (s.id.clone(), stats)
            })
            .collect();

        MonitoringStats {
            total_sources: sources.len(),
            active_sources: sources.iter().filter(|v| v.source.is_active).count(),
            total_opportunities: opportunities.len(),
            new_today,
            by_source,
            by_state,
            by_category,
            average_value: (!values.is_empty())
                .then(|| values.iter().sum::<f64>() / values.len() as f64),
            upcoming_deadlines,
        }
    }
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// In-process fan-out of lifecycle events. Lagging receivers lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<MonitoringEvent>,
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.sender.subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn emit(&self, event: MonitoringEvent) -> usize {
        debug!(event = event.name(), "emit");
        self.sender.send(event).unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// A cancellable timer for one source.
#[derive(Debug, Clone)]
pub struct Ticker {
    pub source_id: String,
    pub cadence: Cadence,
}

impl Ticker {
    pub fn new(source_id: impl Into<String>, cadence: Cadence) -> Self {
        Self {
            source_id: source_id.into(),
            cadence,
        }
    }

    pub fn next_delay(&self) -> Duration {
        self.cadence.next_delay(&Local::now())
    }

    async fn run(self, engine: Arc<EngineInner>, cancel: CancellationToken) {
        debug!(source_id = %self.source_id, cadence = ?self.cadence, "ticker started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.next_delay()) => {}
            }
            engine.trigger(&self.source_id).await;
        }
        debug!(source_id = %self.source_id, "ticker stopped");
    }
}

#[derive(Debug)]
struct Tickers {
    root: CancellationToken,
    per_source: HashMap<String, CancellationToken>,
}

#[derive(Debug, Default)]
struct Scheduler {
    tickers: Mutex<Option<Tickers>>,
    tasks: TaskTracker,
}

impl Scheduler {
    async fn is_running(&self) -> bool {
        self.tickers.lock().await.is_some()
    }

    async fn start(&self, engine: &Arc<EngineInner>, sources: &[MonitoringSource]) -> bool {
        let mut guard = self.tickers.lock().await;
        if guard.is_some() {
            return false;
        }
        let mut tickers = Tickers {
            root: CancellationToken::new(),
            per_source: HashMap::new(),
        };
        for source in sources {
            self.spawn_ticker(engine, &mut tickers, source);
        }
        *guard = Some(tickers);
        true
    }

    fn spawn_ticker(&self, engine: &Arc<EngineInner>, tickers: &mut Tickers, source: &MonitoringSource) {
        let cadence = match Cadence::parse(&source.update_frequency) {
            Ok(cadence) => cadence,
            Err(err) => {
                error!(source_id = %source.id, error = %err, "not scheduling source");
                return;
            }
        };
        let token = tickers.root.child_token();
        if let Some(previous) = tickers.per_source.insert(source.id.clone(), token.clone()) {
            previous.cancel();
        }
        let ticker = Ticker::new(source.id.clone(), cadence);
        self.tasks.spawn(ticker.run(Arc::clone(engine), token));
    }

    async fn add(&self, engine: &Arc<EngineInner>, source: &MonitoringSource) {
        if let Some(tickers) = self.tickers.lock().await.as_mut() {
            self.spawn_ticker(engine, tickers, source);
        }
    }

    async fn remove(&self, source_id: &str) {
        if let Some(tickers) = self.tickers.lock().await.as_mut() {
            if let Some(token) = tickers.per_source.remove(source_id) {
                token.cancel();
            }
        }
    }

    /// Cancels every ticker; cycles already running are left alone.
    async fn stop(&self) -> bool {
        match self.tickers.lock().await.take() {
            Some(tickers) => {
                tickers.root.cancel();
                true
            }
            None => false,
        }
    }

    async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub source_id: String,
    pub pages_fetched: u32,
    pub total_found: usize,
    pub new_count: usize,
    #[serde(skip)]
    pub new_opportunities: Vec<ScrapedOpportunity>,
    pub error: Option<String>,
    pub quota_exhausted: bool,
    pub elapsed_ms: u64,
}

impl CycleReport {
    fn new(cycle_id: Uuid, source_id: &str) -> Self {
        Self {
            cycle_id,
            source_id: source_id.to_string(),
            pages_fetched: 0,
            total_found: 0,
            new_count: 0,
            new_opportunities: Vec::new(),
            error: None,
            quota_exhausted: false,
            elapsed_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSourceResult {
    pub success: bool,
    pub opportunities_found: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Started,
    Missed,
    Inactive,
    Unknown,
}

struct EngineInner {
    config: MonitoringConfig,
    catalog: SourceCatalog,
    quota: QuotaTracker,
    fetcher: Arc<dyn PageFetcher>,
    auth: AuthRegistry,
    store: Arc<dyn OpportunityStore>,
    dedup: Deduplicator,
    events: EventBus,
    scheduler: Scheduler,
    watch_lists: RwLock<Vec<WatchList>>,
}

/// Explicitly constructed monitoring engine; clones share state.
#[derive(Clone)]
pub struct MonitoringEngine {
    inner: Arc<EngineInner>,
}

impl MonitoringEngine {
    pub fn new(
        config: MonitoringConfig,
        sources: Vec<MonitoringSource>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn OpportunityStore>,
        auth: AuthRegistry,
    ) -> Result<Self, CatalogError> {
        let catalog = SourceCatalog::from_sources(sources)?;
        let events = EventBus::with_capacity(config.event_capacity);
        Ok(Self {
            inner: Arc::new(EngineInner {
                catalog,
                quota: QuotaTracker::new(),
                fetcher,
                auth,
                dedup: Deduplicator::new(Arc::clone(&store)),
                store,
                events,
                scheduler: Scheduler::default(),
                watch_lists: RwLock::new(Vec::new()),
                config,
            }),
        })
    }

    /// Real HTTP fetcher; Postgres when `DATABASE_URL` is set, memory otherwise.
    pub async fn from_config(config: MonitoringConfig) -> anyhow::Result<Self> {
        let sources = load_sources(&config)?;
        let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let store: Arc<dyn OpportunityStore> = match &config.database_url {
            Some(url) => {
                let pg = PgOpportunityStore::connect(url)
                    .await
                    .context("connecting to postgres")?;
                pg.migrate().await?;
                Arc::new(pg)
            }
            None => {
                info!("DATABASE_URL not set; opportunities are kept in memory");
                Arc::new(InMemoryOpportunityStore::new())
            }
        };
        Ok(Self::new(config, sources, fetcher, store, AuthRegistry::default())?)
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitoringEvent> {
        self.inner.events.subscribe()
    }

    pub async fn is_running(&self) -> bool {
        self.inner.scheduler.is_running().await
    }

    /// Starts one ticker per active source. False if already running.
    pub async fn start(&self) -> bool {
        let sources = self.inner.catalog.active_sources().await;
        if !self.inner.scheduler.start(&self.inner, &sources).await {
            return false;
        }
        info!(sources = sources.len(), "monitoring started");
        self.inner.events.emit(MonitoringEvent::MonitoringStarted);
        if self.inner.config.run_on_start {
            for source in &sources {
                self.inner.trigger(&source.id).await;
            }
        }
        true
    }

    /// Cancels future ticks without waiting for in-flight cycles.
    pub async fn stop(&self) -> bool {
        if !self.inner.scheduler.stop().await {
            return false;
        }
        info!("monitoring stopped");
        self.inner.events.emit(MonitoringEvent::MonitoringStopped);
        true
    }

    /// `stop` plus waiting for in-flight cycles to finish.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.scheduler.drain().await;
    }

    pub async fn trigger(&self, source_id: &str) -> TickOutcome {
        self.inner.trigger(source_id).await
    }

    /// Runs one cycle now, outside the scheduler.
    pub async fn run_cycle(&self, source_id: &str) -> Result<CycleReport, EngineError> {
        let slot = self
            .inner
            .catalog
            .slot(source_id)
            .await
            .ok_or_else(|| CatalogError::UnknownSource(source_id.to_string()))?;
        let Some(_guard) = slot.try_begin() else {
            return Err(EngineError::Busy(source_id.to_string()));
        };
        Ok(self.inner.execute_cycle(&slot).await)
    }

    pub async fn add_custom_source(&self, mut source: MonitoringSource) -> Result<MonitoringSource, EngineError> {
        source.health = SourceHealth::default();
        let added = self.inner.catalog.add(source).await?;
        info!(source_id = %added.id, "custom source added");
        if added.is_active {
            self.inner.scheduler.add(&self.inner, &added).await;
        }
        Ok(added)
    }

    pub async fn activate_source(&self, source_id: &str) -> Result<MonitoringSource, EngineError> {
        let source = self.inner.catalog.set_active(source_id, true).await?;
        self.inner.scheduler.add(&self.inner, &source).await;
        info!(source_id, "source activated");
        Ok(source)
    }

    pub async fn deactivate_source(&self, source_id: &str) -> Result<MonitoringSource, EngineError> {
        let source = self.inner.catalog.set_active(source_id, false).await?;
        self.inner.scheduler.remove(source_id).await;
        info!(source_id, "source deactivated");
        Ok(source)
    }

    pub async fn list_sources(&self) -> Vec<SourceView> {
        self.inner.catalog.views().await
    }

    pub async fn get_source(&self, source_id: &str) -> Option<SourceView> {
        let slot = self.inner.catalog.slot(source_id).await?;
        Some(SourceView {
            state: slot.state().await,
            source: slot.snapshot().await,
        })
    }

    /// Dry run of the first page: nothing is persisted or emitted, but the
    /// request still counts against the daily quota.
    pub async fn test_source(&self, source_id: &str) -> Result<TestSourceResult, EngineError> {
        let source = self
            .inner
            .catalog
            .get(source_id)
            .await
            .ok_or_else(|| CatalogError::UnknownSource(source_id.to_string()))?;
        let span = info_span!("test_source", source_id);
        Ok(self.inner.check_source(&source).instrument(span).await)
    }

    pub async fn get_monitoring_stats(&self) -> Result<MonitoringStats, EngineError> {
        let sources = self.inner.catalog.views().await;
        let opportunities = self.inner.store.list(&OpportunityFilter::default()).await?;
        Ok(StatsAggregator::compute(&sources, &opportunities, Utc::now()))
    }

    /// Defaults to open listings, at most fifty, soonest deadline first.
    pub async fn list_opportunities(
        &self,
        mut filter: OpportunityFilter,
    ) -> Result<Vec<ScrapedOpportunity>, EngineError> {
        filter.status.get_or_insert(OpportunityStatus::Open);
        filter.limit.get_or_insert(DEFAULT_LIST_LIMIT);
        Ok(self.inner.store.list(&filter).await?)
    }

    /// Registers a saved search; new opportunities matching it carry its id
    /// in their `opportunity:found` event.
    pub async fn add_watch_list(&self, watch: WatchList) -> Result<WatchList, EngineError> {
        if watch.name.trim().is_empty() {
            return Err(EngineError::InvalidWatchList("name is required".into()));
        }
        if let (Some(min), Some(max)) = (watch.min_value, watch.max_value) {
            if min > max {
                return Err(EngineError::InvalidWatchList(format!(
                    "min_value {min} exceeds max_value {max}"
                )));
            }
        }
        let mut lists = self.inner.watch_lists.write().await;
        if lists.iter().any(|w| w.id == watch.id) {
            return Err(EngineError::InvalidWatchList(format!("id {} already registered", watch.id)));
        }
        info!(watch_list = %watch.id, name = %watch.name, "watch-list registered");
        lists.push(watch.clone());
        Ok(watch)
    }

    pub async fn list_watch_lists(&self) -> Vec<WatchList> {
        self.inner.watch_lists.read().await.clone()
    }

    pub async fn remove_watch_list(&self, id: Uuid) -> Result<WatchList, EngineError> {
        let mut lists = self.inner.watch_lists.write().await;
        let index = lists
            .iter()
            .position(|w| w.id == id)
            .ok_or(EngineError::UnknownWatchList(id))?;
        info!(watch_list = %id, "watch-list removed");
        Ok(lists.remove(index))
    }
}

impl EngineInner {
    async fn trigger(self: &Arc<Self>, source_id: &str) -> TickOutcome {
        let Some(slot) = self.catalog.slot(source_id).await else {
            warn!(source_id, "tick for unknown source");
            return TickOutcome::Unknown;
        };
        if slot.state().await == SourceState::Inactive {
            return TickOutcome::Inactive;
        }
        let Some(guard) = slot.try_begin() else {
            warn!(source_id, "previous cycle still running; missed tick");
            return TickOutcome::Missed;
        };
        let engine = Arc::clone(self);
        self.scheduler.tasks.spawn(async move {
            engine.execute_cycle(&slot).await;
            drop(guard);
        });
        TickOutcome::Started
    }

    async fn execute_cycle(&self, slot: &SourceSlot) -> CycleReport {
        let source = slot.snapshot().await;
        let cycle_id = Uuid::new_v4();
        let span = info_span!("source_cycle", source_id = %source.id, cycle_id = %cycle_id);
        self.cycle(source, cycle_id).instrument(span).await
    }

    async fn cycle(&self, source: MonitoringSource, cycle_id: Uuid) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::new(cycle_id, &source.id);

        if !self.quota.can_run(&source.id, source.limits.daily_limit).await {
            info!(daily_limit = source.limits.daily_limit, "daily quota exhausted; skipping cycle");
            report.quota_exhausted = true;
        } else if let Err(message) = self.collect_pages(&source, &mut report).await {
            report.error = Some(message);
        }

        let elapsed = started.elapsed();
        report.elapsed_ms = elapsed.as_millis() as u64;
        self.catalog
            .record_cycle(&source.id, report.total_found, elapsed, report.error.as_deref(), Utc::now())
            .await;

        match &report.error {
            None => {
                info!(
                    pages = report.pages_fetched,
                    total_found = report.total_found,
                    new_count = report.new_count,
                    elapsed_ms = report.elapsed_ms,
                    "cycle finished"
                );
                self.events.emit(MonitoringEvent::SourceScraped {
                    source_id: source.id.clone(),
                    total_found: report.total_found,
                    new_count: report.new_count,
                });
            }
            Some(error) => {
                warn!(error = %error, elapsed_ms = report.elapsed_ms, "cycle failed");
                self.events.emit(MonitoringEvent::SourceError {
                    source_id: source.id.clone(),
                    error: error.clone(),
                });
            }
        }
        report
    }

    /// Errors returned here end the cycle; later-page fetch failures only skip that page.
    async fn collect_pages(&self, source: &MonitoringSource, report: &mut CycleReport) -> Result<(), String> {
        let session = self.auth.authenticate(source).await.map_err(|e| e.to_string())?;
        let selectors = CompiledSelectors::compile(&source.selectors).map_err(|e| e.to_string())?;
        let delay = Duration::from_millis(source.limits.request_delay_ms);
        let budget = self.budget_for(source);

        for page in 1..=source.limits.max_pages {
            if page > 1 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let raw_page = match self.fetcher.fetch_page(source, page, &session, &budget).await {
                Ok(raw_page) => raw_page,
                Err(FetchError::BudgetExhausted) => {
                    info!(page, "daily quota reached mid-cycle");
                    report.quota_exhausted = true;
                    break;
                }
                Err(err) if page == 1 => return Err(err.to_string()),
                Err(err) => {
                    warn!(page, error = %err, "page fetch failed; skipping page");
                    continue;
                }
            };
            report.pages_fetched += 1;

            let candidates = valid_opportunities(&selectors, &raw_page.body, source, Utc::now());
            if candidates.is_empty() {
                debug!(page, "no valid records; end of pagination");
                break;
            }
            report.total_found += candidates.len();

            for opportunity in candidates {
                self.accept(opportunity, report).await;
            }
        }
        Ok(())
    }

    async fn accept(&self, opportunity: ScrapedOpportunity, report: &mut CycleReport) {
        match self.dedup.accept(&opportunity).await {
            Ok(true) => {
                let watch_lists = self.matching_watch_lists(&opportunity).await;
                debug!(
                    hash = %opportunity.hash,
                    title = %opportunity.title,
                    watch_lists = watch_lists.len(),
                    "new opportunity"
                );
                self.events.emit(MonitoringEvent::OpportunityFound {
                    opportunity: Box::new(opportunity.clone()),
                    watch_lists,
                });
                report.new_count += 1;
                report.new_opportunities.push(opportunity);
            }
            Ok(false) => debug!(hash = %opportunity.hash, "already known"),
            Err(err) => error!(hash = %opportunity.hash, error = %err, "failed to persist opportunity"),
        }
    }

    async fn matching_watch_lists(&self, opportunity: &ScrapedOpportunity) -> Vec<Uuid> {
        self.watch_lists
            .read()
            .await
            .iter()
            .filter(|w| w.matches(opportunity))
            .map(|w| w.id)
            .collect()
    }

    fn budget_for<'a>(&'a self, source: &'a MonitoringSource) -> DailyBudget<'a> {
        DailyBudget {
            quota: &self.quota,
            source_id: &source.id,
            daily_limit: source.limits.daily_limit,
        }
    }

    async fn check_source(&self, source: &MonitoringSource) -> TestSourceResult {
        let failed = |error: String| TestSourceResult {
            success: false,
            opportunities_found: 0,
            error: Some(error),
        };
        let session = match self.auth.authenticate(source).await {
            Ok(session) => session,
            Err(err) => return failed(err.to_string()),
        };
        let selectors = match CompiledSelectors::compile(&source.selectors) {
            Ok(selectors) => selectors,
            Err(err) => return failed(err.to_string()),
        };
        match self.fetcher.fetch_page(source, 1, &session, &self.budget_for(source)).await {
            Ok(raw_page) => {
                let found = valid_opportunities(&selectors, &raw_page.body, source, Utc::now()).len();
                info!(opportunities_found = found, "source test finished");
                TestSourceResult {
                    success: true,
                    opportunities_found: found,
                    error: None,
                }
            }
            Err(FetchError::BudgetExhausted) => failed("daily quota exhausted".to_string()),
            Err(err) => {
                warn!(error = %err, "source test failed");
                failed(err.to_string())
            }
        }
    }
}

/// Charges every outbound request, retries included, to the source's daily quota.
struct DailyBudget<'a> {
    quota: &'a QuotaTracker,
    source_id: &'a str,
    daily_limit: u32,
}

#[async_trait]
impl<'a> RequestBudget for DailyBudget<'a> {
    async fn try_acquire(&self) -> bool {
        self.quota.try_acquire(self.source_id, self.daily_limit).await
    }
}

fn valid_opportunities(
    selectors: &CompiledSelectors,
    body: &str,
    source: &MonitoringSource,
    now: DateTime<Utc>,
) -> Vec<ScrapedOpportunity> {
    selectors
        .extract_document(body)
        .iter()
        .map(|raw| normalize_record(raw, source, now))
        .filter(|opp| {
            let valid = is_valid_at(opp, now);
            if !valid {
                debug!(title = %opp.title, deadline = %opp.deadline, "record failed validity check");
            }
            valid
        })
        .collect()
}
