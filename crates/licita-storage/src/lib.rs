//! HTTP page fetching, the opportunity store contract and hash deduplication.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use licita_core::{
    MonitoringSource, OpportunityFilter, OpportunityStatus, RawPage, ScrapedOpportunity, Session,
};
use reqwest::header::{ACCEPT_LANGUAGE, COOKIE};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "licita-storage";

pub const DEFAULT_LIST_LIMIT: usize = 50;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Fetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid source url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("fetcher is shutting down")]
    ShuttingDown,
    #[error("request budget exhausted")]
    BudgetExhausted,
}

/// Per-request allowance consulted before every outbound request,
/// retries included.
#[async_trait]
pub trait RequestBudget: Send + Sync {
    /// Claims one request. False once the budget is spent.
    async fn try_acquire(&self) -> bool;
}

/// Budget that never runs out.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmetered;

#[async_trait]
impl RequestBudget for Unmetered {
    async fn try_acquire(&self) -> bool {
        true
    }
}

/// Retrieves one listing page of one source.
///
/// Implementations claim one unit of `budget` per request they send and
/// return [`FetchError::BudgetExhausted`] when the first claim fails.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        source: &MonitoringSource,
        page: u32,
        session: &Session,
        budget: &dyn RequestBudget,
    ) -> Result<RawPage, FetchError>;
}

/// URL of the given page: a `{page}` placeholder wins, otherwise the page
/// number replaces or appends the source's page query parameter.
pub fn page_url(source: &MonitoringSource, page: u32) -> Result<String, FetchError> {
    let invalid = |message: String| FetchError::InvalidUrl {
        url: source.url.clone(),
        message,
    };
    if source.url.contains("{page}") {
        let rendered = source.url.replace("{page}", &page.to_string());
        Url::parse(&rendered).map_err(|e| invalid(e.to_string()))?;
        return Ok(rendered);
    }

    let mut url = Url::parse(&source.url).map_err(|e| invalid(e.to_string()))?;
    let param = source.pagination.page_param.as_str();
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| k != param)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair(param, &page.to_string());
    Ok(url.to_string())
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// Request for `url` with the session's credentials applied.
    pub fn request(&self, url: &str, session: &Session) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .get(url)
            .header(ACCEPT_LANGUAGE, "pt-BR,pt;q=0.9");
        if let Some(token) = &session.bearer_token {
            req = req.bearer_auth(token);
        } else if let Some(basic) = &session.basic {
            req = req.basic_auth(&basic.username, Some(&basic.password));
        }
        if !session.cookies.is_empty() {
            req = req.header(COOKIE, session.cookies.join("; "));
        }
        req
    }

    /// Retries stop early, returning the last failure, once `budget` refuses
    /// another request.
    async fn fetch_with_retries(
        &self,
        url: &str,
        session: &Session,
        budget: &dyn RequestBudget,
    ) -> Result<String, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::ShuttingDown)?;

        if !budget.try_acquire().await {
            return Err(FetchError::BudgetExhausted);
        }

        let mut attempt = 0usize;
        loop {
            let failure = match self.request(url, session).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp.text().await?),
                Ok(resp) => {
                    let status = resp.status();
                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    };
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(failure);
                    }
                    warn!(status = status.as_u16(), attempt, "retryable http status");
                    failure
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request(err));
                    }
                    warn!(error = %err, attempt, "retryable request error");
                    FetchError::Request(err)
                }
            };

            if attempt >= self.backoff.max_retries {
                return Err(failure);
            }
            if !budget.try_acquire().await {
                debug!(attempt, "request budget spent; giving up on retries");
                return Err(failure);
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(
        &self,
        source: &MonitoringSource,
        page: u32,
        session: &Session,
        budget: &dyn RequestBudget,
    ) -> Result<RawPage, FetchError> {
        let url = page_url(source, page)?;
        let span = info_span!("http_fetch", source_id = %source.id, page, url = %url);
        let body = self
            .fetch_with_retries(&url, session, budget)
            .instrument(span)
            .await?;
        debug!(source_id = %source.id, page, bytes = body.len(), "fetched page");
        Ok(RawPage {
            source_id: source.id.clone(),
            page,
            url,
            body,
            fetched_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Opportunity store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt row {id}: {message}")]
    CorruptRow { id: String, message: String },
    #[error("{0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The storage-layer unique constraint on `hash` rejected the row.
    Duplicate,
}

/// Narrow read/write contract of the persisted opportunity store.
///
/// Implementations must enforce uniqueness of `hash` themselves; the
/// engine's check-then-insert is not atomic across concurrent sources.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<ScrapedOpportunity>, PersistenceError>;

    async fn find_by_title_entity_source(
        &self,
        title: &str,
        entity: &str,
        source_id: &str,
    ) -> Result<Option<ScrapedOpportunity>, PersistenceError>;

    async fn insert(&self, opportunity: &ScrapedOpportunity) -> Result<InsertOutcome, PersistenceError>;

    /// Matching rows ordered by deadline, soonest first.
    async fn list(&self, filter: &OpportunityFilter) -> Result<Vec<ScrapedOpportunity>, PersistenceError>;
}

#[derive(Debug, Default)]
pub struct InMemoryOpportunityStore {
    by_hash: RwLock<HashMap<String, ScrapedOpportunity>>,
}

impl InMemoryOpportunityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.by_hash.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.by_hash.read().await.is_empty()
    }
}

#[async_trait]
impl OpportunityStore for InMemoryOpportunityStore {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<ScrapedOpportunity>, PersistenceError> {
        Ok(self.by_hash.read().await.get(hash).cloned())
    }

    async fn find_by_title_entity_source(
        &self,
        title: &str,
        entity: &str,
        source_id: &str,
    ) -> Result<Option<ScrapedOpportunity>, PersistenceError> {
        Ok(self
            .by_hash
            .read()
            .await
            .values()
            .find(|o| o.title == title && o.entity == entity && o.source_id == source_id)
            .cloned())
    }

    async fn insert(&self, opportunity: &ScrapedOpportunity) -> Result<InsertOutcome, PersistenceError> {
        let mut rows = self.by_hash.write().await;
        if rows.contains_key(&opportunity.hash) {
            return Ok(InsertOutcome::Duplicate);
        }
        rows.insert(opportunity.hash.clone(), opportunity.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn list(&self, filter: &OpportunityFilter) -> Result<Vec<ScrapedOpportunity>, PersistenceError> {
        let mut out: Vec<ScrapedOpportunity> = self
            .by_hash
            .read()
            .await
            .values()
            .filter(|o| filter.matches(o))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.deadline.cmp(&b.deadline).then_with(|| a.title.cmp(&b.title)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

const OPPORTUNITY_COLUMNS: &str = "id, source_id, external_id, title, entity, value, deadline, status, link, \
     category, location, modality, publish_date, description, raw_data, hash, discovered_at, \
     review_required, review_reasons";

/// Postgres-backed store; `UNIQUE (hash)` closes the cross-source insert race.
#[derive(Debug, Clone)]
pub struct PgOpportunityStore {
    pool: PgPool,
}

impl PgOpportunityStore {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running scraped_opportunities migrations")
    }

    async fn fetch_optional_where(
        &self,
        mut query: QueryBuilder<'_, Postgres>,
    ) -> Result<Option<ScrapedOpportunity>, PersistenceError> {
        query.push(" LIMIT 1");
        let row = query.build().fetch_optional(&self.pool).await?;
        row.as_ref().map(opportunity_from_row).transpose()
    }
}

fn opportunity_from_row(row: &PgRow) -> Result<ScrapedOpportunity, PersistenceError> {
    let id: Uuid = row.try_get("id")?;
    let status_text: String = row.try_get("status")?;
    let status = OpportunityStatus::from_db(&status_text).ok_or_else(|| PersistenceError::CorruptRow {
        id: id.to_string(),
        message: format!("unknown status {status_text}"),
    })?;
    let deadline: DateTime<Utc> = row.try_get("deadline")?;
    Ok(ScrapedOpportunity {
        id,
        source_id: row.try_get("source_id")?,
        external_id: row.try_get("external_id")?,
        title: row.try_get("title")?,
        entity: row.try_get("entity")?,
        value: row.try_get("value")?,
        deadline,
        status,
        link: row.try_get("link")?,
        category: row.try_get("category")?,
        location: row.try_get("location")?,
        modality: row.try_get("modality")?,
        publish_date: row.try_get("publish_date")?,
        description: row.try_get("description")?,
        raw_data: row.try_get("raw_data")?,
        hash: row.try_get("hash")?,
        discovered_at: row.try_get("discovered_at")?,
        review_required: row.try_get("review_required")?,
        review_reasons: row.try_get("review_reasons")?,
    })
}

fn select_all() -> QueryBuilder<'static, Postgres> {
    QueryBuilder::new(format!(
        "SELECT {OPPORTUNITY_COLUMNS} FROM scraped_opportunities WHERE TRUE"
    ))
}

#[async_trait]
impl OpportunityStore for PgOpportunityStore {
    async fn find_by_hash(&self, hash: &str) -> Result<Option<ScrapedOpportunity>, PersistenceError> {
        let mut query = select_all();
        query.push(" AND hash = ").push_bind(hash.to_string());
        self.fetch_optional_where(query).await
    }

    async fn find_by_title_entity_source(
        &self,
        title: &str,
        entity: &str,
        source_id: &str,
    ) -> Result<Option<ScrapedOpportunity>, PersistenceError> {
        let mut query = select_all();
        query
            .push(" AND title = ")
            .push_bind(title.to_string())
            .push(" AND entity = ")
            .push_bind(entity.to_string())
            .push(" AND source_id = ")
            .push_bind(source_id.to_string());
        self.fetch_optional_where(query).await
    }

    async fn insert(&self, o: &ScrapedOpportunity) -> Result<InsertOutcome, PersistenceError> {
        let result = sqlx::query(
            r#"
            INSERT INTO scraped_opportunities (
                id, source_id, external_id, title, entity, value, deadline, status, link,
                category, location, modality, publish_date, description, raw_data, hash,
                discovered_at, review_required, review_reasons
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (hash) DO NOTHING
            "#,
        )
        .bind(o.id)
        .bind(&o.source_id)
        .bind(&o.external_id)
        .bind(&o.title)
        .bind(&o.entity)
        .bind(o.value)
        .bind(o.deadline)
        .bind(o.status.as_str())
        .bind(&o.link)
        .bind(&o.category)
        .bind(&o.location)
        .bind(&o.modality)
        .bind(o.publish_date)
        .bind(&o.description)
        .bind(&o.raw_data)
        .bind(&o.hash)
        .bind(o.discovered_at)
        .bind(o.review_required)
        .bind(&o.review_reasons)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::Duplicate)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }

    async fn list(&self, filter: &OpportunityFilter) -> Result<Vec<ScrapedOpportunity>, PersistenceError> {
        let mut query = select_all();
        if let Some(status) = filter.status {
            query.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(source_id) = &filter.source_id {
            query.push(" AND source_id = ").push_bind(source_id.clone());
        }
        if let Some(region) = &filter.region {
            query.push(" AND location ILIKE ").push_bind(format!("%{region}%"));
        }
        if let Some(category) = &filter.category {
            query.push(" AND category ILIKE ").push_bind(format!("%{category}%"));
        }
        if let Some(min) = filter.value_min {
            query.push(" AND value >= ").push_bind(min);
        }
        if let Some(max) = filter.value_max {
            query.push(" AND value <= ").push_bind(max);
        }
        query.push(" ORDER BY deadline ASC, title ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }
        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(opportunity_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Deduplicator
// ---------------------------------------------------------------------------

/// Content-hash identity check against the persisted store.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn OpportunityStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn OpportunityStore>) -> Self {
        Self { store }
    }

    /// Stable digest of (title, entity, deadline day).
    pub fn hash(title: &str, entity: &str, deadline: DateTime<Utc>) -> String {
        let material = format!(
            "{}\u{1f}{}\u{1f}{}",
            title.trim(),
            entity.trim(),
            deadline.format("%Y-%m-%d")
        );
        sha256_hex(material.as_bytes())
    }

    /// True when neither the hash nor the (title, entity, source) tuple is stored yet.
    pub async fn is_new(
        &self,
        hash: &str,
        title: &str,
        entity: &str,
        source_id: &str,
    ) -> Result<bool, PersistenceError> {
        if self.store.find_by_hash(hash).await?.is_some() {
            return Ok(false);
        }
        let existing = self
            .store
            .find_by_title_entity_source(title, entity, source_id)
            .await?;
        Ok(existing.is_none())
    }

    /// Pre-checks and inserts; true only when this call created the row.
    pub async fn accept(&self, opportunity: &ScrapedOpportunity) -> Result<bool, PersistenceError> {
        let fresh = self
            .is_new(
                &opportunity.hash,
                &opportunity.title,
                &opportunity.entity,
                &opportunity.source_id,
            )
            .await?;
        if !fresh {
            return Ok(false);
        }
        match self.store.insert(opportunity).await? {
            InsertOutcome::Inserted => Ok(true),
            InsertOutcome::Duplicate => {
                debug!(hash = %opportunity.hash, "insert lost race to a concurrent source");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use licita_core::{
        Authentication, BasicCredentials, Pagination, SelectorConfig, SourceHealth, SourceLimits,
        SourceType,
    };

    fn source(url: &str) -> MonitoringSource {
        MonitoringSource {
            id: "comprasnet".into(),
            name: "ComprasNet".into(),
            source_type: SourceType::Federal,
            url: url.into(),
            selectors: SelectorConfig {
                container: "tr".into(),
                title: "td".into(),
                entity: "td".into(),
                deadline: "td".into(),
                link: "a@href".into(),
                status: None,
                value: None,
                category: None,
                location: None,
                publish_date: None,
                description: None,
                external_id: None,
                modality: None,
            },
            update_frequency: "1h".into(),
            is_active: true,
            limits: SourceLimits::default(),
            authentication: Authentication::None,
            pagination: Pagination::default(),
            health: SourceHealth::default(),
        }
    }

    fn opportunity(title: &str, source_id: &str, day: u32) -> ScrapedOpportunity {
        let deadline = Utc.with_ymd_and_hms(2031, 3, day, 0, 0, 0).single().unwrap();
        ScrapedOpportunity {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            external_id: format!("{title}-{day}"),
            title: title.into(),
            entity: "Ministério da Saúde".into(),
            value: Some(10_000.0),
            deadline,
            status: OpportunityStatus::Open,
            link: "https://example.test/x".into(),
            category: None,
            location: Some("Brasília - DF".into()),
            modality: None,
            publish_date: deadline,
            description: None,
            raw_data: "<tr></tr>".into(),
            hash: Deduplicator::hash(title, "Ministério da Saúde", deadline),
            discovered_at: Utc::now(),
            review_required: false,
            review_reasons: vec![],
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    /// Answers every connection with `status_line` and counts the requests.
    async fn serve_status(status_line: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = socket.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        (format!("http://{addr}/licitacoes"), hits)
    }

    struct CountingBudget {
        remaining: AtomicUsize,
    }

    #[async_trait]
    impl RequestBudget for CountingBudget {
        async fn try_acquire(&self) -> bool {
            self.remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            backoff: BackoffPolicy {
                max_retries: 4,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..HttpClientConfig::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn retries_stop_when_the_budget_runs_out() {
        let (url, hits) = serve_status("503 Service Unavailable").await;
        let budget = CountingBudget {
            remaining: AtomicUsize::new(2),
        };

        let err = quick_fetcher()
            .fetch_page(&source(&url), 1, &Session::default(), &budget)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }), "{err}");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(budget.remaining.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn spent_budget_sends_nothing() {
        let (url, hits) = serve_status("200 OK").await;
        let budget = CountingBudget {
            remaining: AtomicUsize::new(0),
        };

        let err = quick_fetcher()
            .fetch_page(&source(&url), 1, &Session::default(), &budget)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::BudgetExhausted));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_fetch_claims_one_request() {
        let (url, hits) = serve_status("200 OK").await;
        let budget = CountingBudget {
            remaining: AtomicUsize::new(5),
        };

        let page = quick_fetcher()
            .fetch_page(&source(&url), 3, &Session::default(), &budget)
            .await
            .unwrap();

        assert_eq!(page.body, "ok");
        assert!(page.url.ends_with("page=3"), "{}", page.url);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(budget.remaining.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn page_url_sets_or_replaces_the_page_parameter() {
        let src = source("https://portal.test/licitacoes?uf=SP&page=9");
        assert_eq!(page_url(&src, 2).unwrap(), "https://portal.test/licitacoes?uf=SP&page=2");

        let mut src = source("https://portal.test/licitacoes");
        src.pagination.page_param = "pagina".into();
        assert_eq!(page_url(&src, 1).unwrap(), "https://portal.test/licitacoes?pagina=1");

        let src = source("https://portal.test/lista/{page}/");
        assert_eq!(page_url(&src, 3).unwrap(), "https://portal.test/lista/3/");

        let src = source("not a url");
        assert!(matches!(page_url(&src, 1), Err(FetchError::InvalidUrl { .. })));
    }

    #[test]
    fn request_applies_session_credentials() {
        let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let session = Session {
            cookies: vec!["a=1".into(), "b=2".into()],
            bearer_token: Some("tok".into()),
            basic: None,
        };
        let req = fetcher.request("https://portal.test/", &session).build().unwrap();
        assert_eq!(req.headers()["authorization"], "Bearer tok");
        assert_eq!(req.headers()["cookie"], "a=1; b=2");

        let session = Session {
            basic: Some(BasicCredentials {
                username: "u".into(),
                password: "p".into(),
            }),
            ..Session::default()
        };
        let req = fetcher.request("https://portal.test/", &session).build().unwrap();
        assert!(req.headers()["authorization"].to_str().unwrap().starts_with("Basic "));
        assert!(req.headers().get("cookie").is_none());
    }

    #[test]
    fn content_hash_is_stable_and_ignores_time_of_day() {
        let morning = Utc.with_ymd_and_hms(2031, 3, 1, 8, 0, 0).single().unwrap();
        let evening = Utc.with_ymd_and_hms(2031, 3, 1, 20, 0, 0).single().unwrap();
        let a = Deduplicator::hash("Pregão 12/2031", "INSS", morning);
        assert_eq!(a, Deduplicator::hash(" Pregão 12/2031 ", "INSS", evening));
        assert_ne!(a, Deduplicator::hash("Pregão 13/2031", "INSS", morning));
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn dedup_checks_hash_and_title_entity_source_tuple() {
        let store = Arc::new(InMemoryOpportunityStore::new());
        let dedup = Deduplicator::new(store.clone());
        let first = opportunity("Aquisição de vacinas", "comprasnet", 10);

        assert!(dedup.accept(&first).await.unwrap());
        assert!(!dedup.accept(&first).await.unwrap());

        // Same listing re-scraped with a different deadline day: tuple match.
        let moved = opportunity("Aquisição de vacinas", "comprasnet", 12);
        assert!(!dedup
            .is_new(&moved.hash, &moved.title, &moved.entity, &moved.source_id)
            .await
            .unwrap());

        // Mirrored on another portal: hash match.
        let mut mirrored = first.clone();
        mirrored.source_id = "licitacoes-e".into();
        assert!(!dedup.accept(&mirrored).await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn in_memory_store_enforces_unique_hash_and_orders_listing() {
        let store = InMemoryOpportunityStore::new();
        let late = opportunity("Obra de pavimentação", "bec-sp", 20);
        let early = opportunity("Compra de papel", "bec-sp", 5);
        assert_eq!(store.insert(&late).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&early).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&late).await.unwrap(), InsertOutcome::Duplicate);

        let all = store.list(&OpportunityFilter::default()).await.unwrap();
        assert_eq!(all.iter().map(|o| o.title.as_str()).collect::<Vec<_>>(), vec![
            "Compra de papel",
            "Obra de pavimentação"
        ]);

        let limited = store
            .list(&OpportunityFilter {
                limit: Some(1),
                region: Some("df".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }
}
