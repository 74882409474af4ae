//! Selector-driven extraction, value normalization and authentication plugins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use licita_core::{
    AuthKind, Authentication, BasicCredentials, MonitoringSource, OpportunityStatus, RawRecord,
    ScrapedOpportunity, SelectorConfig, Session,
};
use licita_storage::Deduplicator;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "licita-adapters";

/// Days added to `now` when a deadline cannot be parsed.
pub const DEFAULT_DEADLINE_DAYS: i64 = 30;
pub const DESCRIPTION_MAX_CHARS: usize = 500;

pub const REVIEW_DEADLINE_DEFAULTED: &str = "deadline_defaulted";
pub const REVIEW_STATUS_UNRECOGNIZED: &str = "status_unrecognized";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid selector `{selector}` for field {field}: {message}")]
    InvalidSelector {
        field: String,
        selector: String,
        message: String,
    },
}

#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("source {source_id} is missing {kind:?} credentials: {message}")]
    MissingCredentials {
        source_id: String,
        kind: AuthKind,
        message: String,
    },
    #[error("no authentication provider registered for {0:?}")]
    NoProvider(AuthKind),
    #[error("login failed for {source_id}: {message}")]
    LoginFailed { source_id: String, message: String },
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Locator {
    selector: Option<Selector>,
    attr: Option<String>,
}

impl Locator {
    fn parse(field: &str, raw: &str) -> Result<Self, ParseError> {
        let raw = raw.trim();
        let (css, attr) = match raw.rsplit_once('@') {
            Some((css, attr)) if is_attr_name(attr) => (css.trim(), Some(attr.to_string())),
            _ => (raw, None),
        };
        let selector = if css.is_empty() {
            None
        } else {
            Some(compile_selector(field, css)?)
        };
        Ok(Self { selector, attr })
    }

    fn read(&self, element: ElementRef<'_>) -> Option<String> {
        let target = match &self.selector {
            Some(sel) => element.select(sel).next()?,
            None => element,
        };
        match &self.attr {
            Some(attr) => target.value().attr(attr).and_then(text_or_none),
            None => text_or_none(&target.text().collect::<Vec<_>>().join(" ")),
        }
    }
}

fn is_attr_name(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':'))
}

fn compile_selector(field: &str, css: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| ParseError::InvalidSelector {
        field: field.to_string(),
        selector: css.to_string(),
        message: e.to_string(),
    })
}

/// Trims and collapses whitespace; empty results become `None`.
fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// A source's selector configuration compiled once per page.
#[derive(Debug)]
pub struct CompiledSelectors {
    container: Selector,
    title: Locator,
    entity: Locator,
    deadline: Locator,
    link: Locator,
    status: Option<Locator>,
    value: Option<Locator>,
    category: Option<Locator>,
    location: Option<Locator>,
    publish_date: Option<Locator>,
    description: Option<Locator>,
    external_id: Option<Locator>,
    modality: Option<Locator>,
}

impl CompiledSelectors {
    pub fn compile(config: &SelectorConfig) -> Result<Self, ParseError> {
        let optional = |field: &str, raw: &Option<String>| -> Result<Option<Locator>, ParseError> {
            raw.as_deref().map(|r| Locator::parse(field, r)).transpose()
        };
        Ok(Self {
            container: compile_selector("container", config.container.trim())?,
            title: Locator::parse("title", &config.title)?,
            entity: Locator::parse("entity", &config.entity)?,
            deadline: Locator::parse("deadline", &config.deadline)?,
            link: Locator::parse("link", &config.link)?,
            status: optional("status", &config.status)?,
            value: optional("value", &config.value)?,
            category: optional("category", &config.category)?,
            location: optional("location", &config.location)?,
            publish_date: optional("publish_date", &config.publish_date)?,
            description: optional("description", &config.description)?,
            external_id: optional("external_id", &config.external_id)?,
            modality: optional("modality", &config.modality)?,
        })
    }

    pub fn extract_document(&self, html: &str) -> Vec<RawRecord> {
        let document = Html::parse_document(html);
        let mut out = Vec::new();
        for (index, container) in document.select(&self.container).enumerate() {
            let read_opt = |locator: &Option<Locator>| locator.as_ref().and_then(|l| l.read(container));
            let title = self.title.read(container);
            let entity = self.entity.read(container);
            let deadline = self.deadline.read(container);
            let link = self.link.read(container);

            let (Some(title), Some(entity), Some(deadline), Some(link)) = (title, entity, deadline, link)
            else {
                debug!(index, "dropping listing with missing title/entity/deadline/link");
                continue;
            };

            out.push(RawRecord {
                title,
                entity,
                deadline,
                link,
                status: read_opt(&self.status),
                value: read_opt(&self.value),
                category: read_opt(&self.category),
                location: read_opt(&self.location),
                publish_date: read_opt(&self.publish_date),
                description: read_opt(&self.description),
                external_id: read_opt(&self.external_id),
                modality: read_opt(&self.modality),
                fragment: container.html(),
            });
        }
        out
    }
}

/// Applies a selector configuration to raw markup, one record per container.
///
/// Records missing any of title, entity, deadline or link are dropped.
pub fn extract(html: &str, selectors: &SelectorConfig) -> Result<Vec<RawRecord>, ParseError> {
    Ok(CompiledSelectors::compile(selectors)?.extract_document(html))
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})-(\d{1,2})-(\d{1,2})").expect("valid ISO date regex"));
static DMY_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d{1,2})([/.\-])(\d{1,2})([/.\-])(\d{4})").expect("valid day-month-year regex")
});

/// `DD/MM/YYYY`, `DD-MM-YYYY`, `DD.MM.YYYY` or `YYYY-MM-DD`, anywhere in the text.
pub fn parse_date_strict(text: &str) -> Option<NaiveDate> {
    if let Some(caps) = ISO_DATE.captures(text) {
        let year = caps[1].parse().ok()?;
        let month = caps[2].parse().ok()?;
        let day = caps[3].parse().ok()?;
        if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
            return Some(date);
        }
    }
    DMY_DATE.captures_iter(text).find_map(|caps| {
        if caps[2] != caps[4] {
            return None;
        }
        let day = caps[1].parse().ok()?;
        let month = caps[3].parse().ok()?;
        let year = caps[5].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, day)
    })
}

/// Local midnight of `date`, the same zone quota rollover and `new_today` use.
pub fn start_of_local_day(date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    Local
        .from_local_datetime(&midnight)
        .earliest()
        // midnight skipped by a DST jump
        .or_else(|| Local.from_local_datetime(&(midnight + Duration::hours(1))).earliest())
        .map(|local| local.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

pub fn parse_date_at(text: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    parse_date_strict(text)
        .map(start_of_local_day)
        .unwrap_or_else(|| now + Duration::days(DEFAULT_DEADLINE_DAYS))
}

/// Parses a listing date; unparsable text falls back to `now + 30 days`.
pub fn parse_date(text: &str) -> DateTime<Utc> {
    parse_date_at(text, Utc::now())
}

/// Parses a currency amount written with the Brazilian convention
/// (`.` thousands, `,` decimal), e.g. `R$ 1.234,56` -> `1234.56`.
/// A dot is always a thousands separator, so `12.50` reads as `1250`.
pub fn parse_value(text: &str) -> Option<f64> {
    let canonical: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == ',')
        .map(|c| if c == ',' { '.' } else { c })
        .collect();
    if !canonical.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }
    let value: f64 = canonical.trim_matches('.').parse().ok()?;
    value.is_finite().then_some(value)
}

/// Keyword classification; `None` when no keyword set matched.
pub fn classify_status(text: &str) -> Option<OpportunityStatus> {
    let lower = text.to_lowercase();
    if lower.trim().is_empty() {
        return None;
    }
    if lower.contains("cancelad") {
        return Some(OpportunityStatus::Cancelled);
    }
    if lower.contains("suspens") {
        return Some(OpportunityStatus::Suspended);
    }
    if ["inativ", "encerrad", "fechad", "conclu", "homologad"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return Some(OpportunityStatus::Closed);
    }
    if ["aberto", "aberta", "andamento", "ativo", "ativa"]
        .iter()
        .any(|k| lower.contains(k))
    {
        return Some(OpportunityStatus::Open);
    }
    None
}

/// Status with the documented default: anything unrecognized is `CLOSED`.
pub fn normalize_status(text: &str) -> OpportunityStatus {
    classify_status(text).unwrap_or(OpportunityStatus::Closed)
}

pub fn is_valid_at(opportunity: &ScrapedOpportunity, now: DateTime<Utc>) -> bool {
    !opportunity.title.trim().is_empty()
        && !opportunity.entity.trim().is_empty()
        && !opportunity.link.trim().is_empty()
        && opportunity.deadline > now
}

/// True iff title, entity and link are present and the deadline is still ahead.
pub fn is_valid(opportunity: &ScrapedOpportunity) -> bool {
    is_valid_at(opportunity, Utc::now())
}

/// Resolves a possibly relative listing link against the source URL.
pub fn resolve_link(base: &str, href: &str) -> String {
    match Url::parse(base).and_then(|b| b.join(href)) {
        Ok(url) => url.to_string(),
        Err(_) => href.to_string(),
    }
}

fn truncate_chars(value: String, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value,
    }
}

/// Turns one raw record into a typed opportunity, applying every fallback rule.
pub fn normalize_record(
    raw: &RawRecord,
    source: &MonitoringSource,
    now: DateTime<Utc>,
) -> ScrapedOpportunity {
    let mut review_reasons = Vec::new();

    let deadline = match parse_date_strict(&raw.deadline) {
        Some(date) => start_of_local_day(date),
        None => {
            review_reasons.push(REVIEW_DEADLINE_DEFAULTED.to_string());
            now + Duration::days(DEFAULT_DEADLINE_DAYS)
        }
    };

    let status_text = raw.status.as_deref().unwrap_or_default();
    let status = match classify_status(status_text) {
        Some(status) => status,
        None => {
            if !status_text.trim().is_empty() {
                review_reasons.push(REVIEW_STATUS_UNRECOGNIZED.to_string());
            }
            OpportunityStatus::Closed
        }
    };

    let link = resolve_link(&source.url, &raw.link);
    let title = raw.title.trim().to_string();
    let entity = raw.entity.trim().to_string();
    let hash = Deduplicator::hash(&title, &entity, deadline);

    ScrapedOpportunity {
        id: Uuid::new_v4(),
        source_id: source.id.clone(),
        external_id: raw.external_id.clone().unwrap_or_else(|| link.clone()),
        value: raw.value.as_deref().and_then(parse_value),
        deadline,
        status,
        category: raw.category.clone(),
        location: raw.location.clone(),
        modality: raw.modality.clone(),
        publish_date: raw
            .publish_date
            .as_deref()
            .and_then(parse_date_strict)
            .map(start_of_local_day)
            .unwrap_or(now),
        description: raw
            .description
            .clone()
            .map(|d| truncate_chars(d, DESCRIPTION_MAX_CHARS)),
        raw_data: raw.fragment.clone(),
        review_required: !review_reasons.is_empty(),
        review_reasons,
        discovered_at: now,
        title,
        entity,
        link,
        hash,
    }
}

// ---------------------------------------------------------------------------
// Authentication plugins
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, source: &MonitoringSource) -> Result<Session, AuthenticationError>;
}

/// Builds a session straight from the credentials stored on the source.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticCredentialsAuth;

#[async_trait]
impl AuthProvider for StaticCredentialsAuth {
    async fn authenticate(&self, source: &MonitoringSource) -> Result<Session, AuthenticationError> {
        let missing = |kind: AuthKind, message: &str| AuthenticationError::MissingCredentials {
            source_id: source.id.clone(),
            kind,
            message: message.to_string(),
        };
        match &source.authentication {
            Authentication::None => Ok(Session::default()),
            Authentication::Basic { username, password } => Ok(Session {
                basic: Some(BasicCredentials {
                    username: username.clone(),
                    password: password.clone(),
                }),
                ..Session::default()
            }),
            Authentication::ApiKey { key } if !key.trim().is_empty() => Ok(Session {
                bearer_token: Some(key.clone()),
                ..Session::default()
            }),
            Authentication::ApiKey { .. } => Err(missing(AuthKind::ApiKey, "empty api key")),
            Authentication::Session { cookies } if !cookies.is_empty() => Ok(Session {
                cookies: cookies.clone(),
                ..Session::default()
            }),
            Authentication::Session { .. } => Err(missing(
                AuthKind::Session,
                "no session cookies; register a login provider for this source",
            )),
            Authentication::Oauth {
                access_token: Some(token),
                ..
            } => Ok(Session {
                bearer_token: Some(token.clone()),
                ..Session::default()
            }),
            Authentication::Oauth { .. } => Err(missing(
                AuthKind::Oauth,
                "no access token; register a token provider for this source",
            )),
        }
    }
}

/// Resolves the provider for a source: per-source override first, then by strategy tag.
#[derive(Clone)]
pub struct AuthRegistry {
    by_kind: HashMap<AuthKind, Arc<dyn AuthProvider>>,
    by_source: HashMap<String, Arc<dyn AuthProvider>>,
}

impl Default for AuthRegistry {
    fn default() -> Self {
        let static_auth: Arc<dyn AuthProvider> = Arc::new(StaticCredentialsAuth);
        let by_kind = [
            AuthKind::None,
            AuthKind::Basic,
            AuthKind::Oauth,
            AuthKind::Session,
            AuthKind::ApiKey,
        ]
        .into_iter()
        .map(|kind| (kind, static_auth.clone()))
        .collect();
        Self {
            by_kind,
            by_source: HashMap::new(),
        }
    }
}

impl AuthRegistry {
    pub fn empty() -> Self {
        Self {
            by_kind: HashMap::new(),
            by_source: HashMap::new(),
        }
    }

    pub fn with_provider(mut self, kind: AuthKind, provider: Arc<dyn AuthProvider>) -> Self {
        self.by_kind.insert(kind, provider);
        self
    }

    pub fn with_source_provider(
        mut self,
        source_id: impl Into<String>,
        provider: Arc<dyn AuthProvider>,
    ) -> Self {
        self.by_source.insert(source_id.into(), provider);
        self
    }

    pub async fn authenticate(&self, source: &MonitoringSource) -> Result<Session, AuthenticationError> {
        let kind = source.authentication.kind();
        let provider = self
            .by_source
            .get(&source.id)
            .or_else(|| self.by_kind.get(&kind))
            .ok_or(AuthenticationError::NoProvider(kind))?;
        provider.authenticate(source).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use licita_core::{Pagination, SourceHealth, SourceLimits, SourceType};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).single().unwrap()
    }

    fn selectors() -> SelectorConfig {
        SelectorConfig {
            container: "div.licitacao-card".into(),
            title: "h3".into(),
            entity: "span.orgao".into(),
            deadline: "span.data".into(),
            link: "a.detalhes@href".into(),
            status: Some("span.situacao".into()),
            value: Some("span.valor".into()),
            category: None,
            location: Some("@data-uf".into()),
            publish_date: None,
            description: None,
            external_id: Some("@data-id".into()),
            modality: None,
        }
    }

    fn source() -> MonitoringSource {
        MonitoringSource {
            id: "licitacoes-e".into(),
            name: "Licitações-e".into(),
            source_type: SourceType::EmpresaPublica,
            url: "https://www.licitacoes-e.com.br/aop/lista".into(),
            selectors: selectors(),
            update_frequency: "0 */2 * * *".into(),
            is_active: true,
            limits: SourceLimits::default(),
            authentication: Authentication::None,
            pagination: Pagination::default(),
            health: SourceHealth::default(),
        }
    }

    const CARDS: &str = r#"
        <html><body>
          <div class="licitacao-card" data-id="BB-1" data-uf="SP">
            <h3>  Pregão eletrônico
                  de material de escritório </h3>
            <span class="orgao">Banco do Brasil</span>
            <span class="data">Abertura: 15/08/2025</span>
            <span class="valor">R$ 1.234,56</span>
            <span class="situacao">Aberto</span>
            <a class="detalhes" href="/aop/lic/1">ver</a>
          </div>
          <div class="licitacao-card" data-id="BB-2">
            <h3>Sem órgão</h3>
            <span class="data">20/08/2025</span>
            <a class="detalhes" href="/aop/lic/2">ver</a>
          </div>
        </body></html>
    "#;

    #[test]
    fn extract_reads_text_attributes_and_drops_incomplete_records() {
        let records = extract(CARDS, &selectors()).unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.title, "Pregão eletrônico de material de escritório");
        assert_eq!(rec.entity, "Banco do Brasil");
        assert_eq!(rec.link, "/aop/lic/1");
        assert_eq!(rec.external_id.as_deref(), Some("BB-1"));
        assert_eq!(rec.location.as_deref(), Some("SP"));
        assert!(rec.fragment.contains("licitacao-card"));
    }

    #[test]
    fn extract_rejects_invalid_selector() {
        let mut bad = selectors();
        bad.container = "div[".into();
        let err = extract(CARDS, &bad).unwrap_err();
        assert!(matches!(err, ParseError::InvalidSelector { ref field, .. } if field == "container"));
    }

    #[test]
    fn parse_date_accepts_day_first_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 8, 15).unwrap();
        let local_day = |text| parse_date(text).with_timezone(&Local).date_naive();
        assert_eq!(local_day("15/08/2025"), expected);
        assert_eq!(local_day("15-08-2025"), expected);
        assert_eq!(local_day("15.08.2025"), expected);
        assert_eq!(parse_date_strict("Abertura em 15/08/2025 às 10h"), Some(expected));
        assert_eq!(parse_date_strict("2025-08-15"), Some(expected));
        assert_eq!(parse_date_strict("15/08-2025"), None);
        assert_eq!(parse_date_strict("31/02/2025"), None);
    }

    #[test]
    fn deadlines_fall_on_local_midnight() {
        let deadline = parse_date("15/08/2025");
        let local = deadline.with_timezone(&Local);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2025, 8, 15).unwrap());
        assert_eq!(local.time(), NaiveTime::MIN);

        let eve = Local
            .with_ymd_and_hms(2025, 8, 14, 23, 0, 0)
            .earliest()
            .unwrap()
            .with_timezone(&Utc);
        assert!(eve < deadline);
        assert_eq!(start_of_local_day(NaiveDate::from_ymd_opt(2025, 8, 15).unwrap()), deadline);
    }

    #[test]
    fn parse_date_falls_back_to_thirty_days_ahead() {
        let now = fixed_now();
        assert_eq!(parse_date_at("xyz", now), now + Duration::days(30));
    }

    #[test]
    fn parse_value_handles_brazilian_convention() {
        assert_eq!(parse_value("R$ 1.234,56"), Some(1234.56));
        assert_eq!(parse_value("R$ 1.500.000,00"), Some(1_500_000.0));
        assert_eq!(parse_value("1.234"), Some(1234.0));
        assert_eq!(parse_value("12,5"), Some(12.5));
        assert_eq!(parse_value("12.50"), Some(1250.0));
        assert_eq!(parse_value(""), None);
        assert_eq!(parse_value("sigiloso"), None);
    }

    #[test]
    fn normalize_status_matches_keywords_and_defaults_to_closed() {
        assert_eq!(normalize_status("Aberto"), OpportunityStatus::Open);
        assert_eq!(normalize_status("Em andamento"), OpportunityStatus::Open);
        assert_eq!(normalize_status("Cancelado"), OpportunityStatus::Cancelled);
        assert_eq!(normalize_status("SUSPENSO"), OpportunityStatus::Suspended);
        assert_eq!(normalize_status("Inativo"), OpportunityStatus::Closed);
        assert_eq!(normalize_status("Aberto (cancelado)"), OpportunityStatus::Cancelled);
        assert_eq!(normalize_status("Em andamento - suspensa"), OpportunityStatus::Suspended);
        assert_eq!(normalize_status(""), OpportunityStatus::Closed);
        assert_eq!(classify_status("desconhecido"), None);
    }

    #[test]
    fn normalize_record_resolves_link_and_flags_fallbacks() {
        let now = fixed_now();
        let records = extract(CARDS, &selectors()).unwrap();
        let opp = normalize_record(&records[0], &source(), now);
        assert_eq!(opp.link, "https://www.licitacoes-e.com.br/aop/lic/1");
        assert_eq!(opp.value, Some(1234.56));
        assert_eq!(opp.status, OpportunityStatus::Open);
        assert_eq!(opp.external_id, "BB-1");
        assert_eq!(opp.publish_date, now);
        assert!(!opp.review_required);
        assert_eq!(opp.hash, Deduplicator::hash(&opp.title, &opp.entity, opp.deadline));

        let mut raw = records[0].clone();
        raw.deadline = "a definir".into();
        raw.status = Some("em análise".into());
        let flagged = normalize_record(&raw, &source(), now);
        assert_eq!(flagged.deadline, now + Duration::days(30));
        assert_eq!(flagged.status, OpportunityStatus::Closed);
        assert_eq!(
            flagged.review_reasons,
            vec![REVIEW_DEADLINE_DEFAULTED.to_string(), REVIEW_STATUS_UNRECOGNIZED.to_string()]
        );
    }

    #[test]
    fn is_valid_rejects_past_or_present_deadlines() {
        let now = fixed_now();
        let records = extract(CARDS, &selectors()).unwrap();
        let mut opp = normalize_record(&records[0], &source(), now);
        assert!(is_valid_at(&opp, now));
        opp.deadline = now;
        assert!(!is_valid_at(&opp, now));
        opp.deadline = now + Duration::days(1);
        opp.link = "  ".into();
        assert!(!is_valid_at(&opp, now));
    }

    #[tokio::test]
    async fn static_auth_maps_strategies_to_sessions() {
        let registry = AuthRegistry::default();
        let mut src = source();

        src.authentication = Authentication::ApiKey { key: "k-123".into() };
        let session = registry.authenticate(&src).await.unwrap();
        assert_eq!(session.bearer_token.as_deref(), Some("k-123"));

        src.authentication = Authentication::Session {
            cookies: vec!["JSESSIONID=abc".into()],
        };
        let session = registry.authenticate(&src).await.unwrap();
        assert_eq!(session.cookies, vec!["JSESSIONID=abc".to_string()]);

        src.authentication = Authentication::Oauth {
            access_token: None,
            token_url: None,
        };
        assert!(matches!(
            registry.authenticate(&src).await,
            Err(AuthenticationError::MissingCredentials { kind: AuthKind::Oauth, .. })
        ));
    }

    struct FixedLogin;

    #[async_trait]
    impl AuthProvider for FixedLogin {
        async fn authenticate(&self, _source: &MonitoringSource) -> Result<Session, AuthenticationError> {
            Ok(Session {
                cookies: vec!["login=ok".into()],
                ..Session::default()
            })
        }
    }

    #[tokio::test]
    async fn source_override_wins_over_strategy_provider() {
        let registry = AuthRegistry::empty().with_source_provider("licitacoes-e", Arc::new(FixedLogin));
        let mut src = source();
        src.authentication = Authentication::Session { cookies: vec![] };
        let session = registry.authenticate(&src).await.unwrap();
        assert_eq!(session.cookies, vec!["login=ok".to_string()]);

        src.id = "other".into();
        assert!(matches!(
            registry.authenticate(&src).await,
            Err(AuthenticationError::NoProvider(AuthKind::Session))
        ));
    }
}
