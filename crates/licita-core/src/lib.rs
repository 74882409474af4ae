//! Core domain model for the procurement monitor: sources, opportunities, events and stats.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "licita-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    Federal,
    Estadual,
    Municipal,
    Tribunal,
    EmpresaPublica,
}

/// Field-to-locator map applied to one listing page.
///
/// A locator is `"<css>"` (text of the first match inside the container),
/// `"<css>@<attr>"` (attribute of the first match) or `"@<attr>"` (attribute
/// of the container element itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SelectorConfig {
    pub container: String,
    pub title: String,
    pub entity: String,
    pub deadline: String,
    pub link: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub publish_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub modality: Option<String>,
}

impl SelectorConfig {
    /// Every non-container locator paired with the field it feeds.
    pub fn field_locators(&self) -> Vec<(&'static str, &str)> {
        let mut out = vec![
            ("title", self.title.as_str()),
            ("entity", self.entity.as_str()),
            ("deadline", self.deadline.as_str()),
            ("link", self.link.as_str()),
        ];
        let optional = [
            ("status", &self.status),
            ("value", &self.value),
            ("category", &self.category),
            ("location", &self.location),
            ("publish_date", &self.publish_date),
            ("description", &self.description),
            ("external_id", &self.external_id),
            ("modality", &self.modality),
        ];
        for (name, locator) in optional {
            if let Some(locator) = locator {
                out.push((name, locator.as_str()));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLimits {
    pub max_pages: u32,
    pub request_delay_ms: u64,
    pub daily_limit: u32,
}

impl Default for SourceLimits {
    fn default() -> Self {
        Self {
            max_pages: 5,
            request_delay_ms: 2_000,
            daily_limit: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthKind {
    None,
    Basic,
    Oauth,
    Session,
    ApiKey,
}

/// Authentication strategy tag plus the credentials that strategy needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Authentication {
    #[default]
    None,
    Basic {
        username: String,
        password: String,
    },
    Oauth {
        #[serde(default)]
        access_token: Option<String>,
        #[serde(default)]
        token_url: Option<String>,
    },
    Session {
        #[serde(default)]
        cookies: Vec<String>,
    },
    ApiKey {
        key: String,
    },
}

impl Authentication {
    pub fn kind(&self) -> AuthKind {
        match self {
            Self::None => AuthKind::None,
            Self::Basic { .. } => AuthKind::Basic,
            Self::Oauth { .. } => AuthKind::Oauth,
            Self::Session { .. } => AuthKind::Session,
            Self::ApiKey { .. } => AuthKind::ApiKey,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page_param: String,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page_param: "page".to_string(),
        }
    }
}

/// Mutable health counters, folded in after every cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHealth {
    pub last_update: Option<DateTime<Utc>>,
    pub total_scraped: u64,
    /// Rolling success rate in percent.
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub last_error: Option<String>,
    pub cycles_run: u64,
}

impl Default for SourceHealth {
    fn default() -> Self {
        Self {
            last_update: None,
            total_scraped: 0,
            success_rate: 100.0,
            average_response_time_ms: 0.0,
            last_error: None,
            cycles_run: 0,
        }
    }
}

/// Identity and scraping behavior of one external portal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringSource {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub source_type: SourceType,
    pub url: String,
    pub selectors: SelectorConfig,
    pub update_frequency: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub limits: SourceLimits,
    #[serde(default)]
    pub authentication: Authentication,
    #[serde(default)]
    pub pagination: Pagination,
    #[serde(default)]
    pub health: SourceHealth,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceState {
    Inactive,
    Active,
    Scraping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpportunityStatus {
    Open,
    Closed,
    Suspended,
    Cancelled,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Suspended => "SUSPENDED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            "SUSPENDED" => Some(Self::Suspended),
            "CANCELLED" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// Credentials resolved for one cycle and applied to every page request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Session {
    pub cookies: Vec<String>,
    pub bearer_token: Option<String>,
    pub basic: Option<BasicCredentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPage {
    pub source_id: String,
    pub page: u32,
    pub url: String,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
}

/// Raw field strings pulled out of one listing container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RawRecord {
    pub title: String,
    pub entity: String,
    pub deadline: String,
    pub link: String,
    pub status: Option<String>,
    pub value: Option<String>,
    pub category: Option<String>,
    pub location: Option<String>,
    pub publish_date: Option<String>,
    pub description: Option<String>,
    pub external_id: Option<String>,
    pub modality: Option<String>,
    /// Outer HTML of the container, kept for audit.
    pub fragment: String,
}

/// One normalized listing. Immutable once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedOpportunity {
    pub id: Uuid,
    pub source_id: String,
    pub external_id: String,
    pub title: String,
    pub entity: String,
    pub value: Option<f64>,
    pub deadline: DateTime<Utc>,
    pub status: OpportunityStatus,
    pub link: String,
    pub category: Option<String>,
    pub location: Option<String>,
    pub modality: Option<String>,
    pub publish_date: DateTime<Utc>,
    pub description: Option<String>,
    pub raw_data: String,
    pub hash: String,
    pub discovered_at: DateTime<Utc>,
    pub review_required: bool,
    #[serde(default)]
    pub review_reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum MonitoringEvent {
    #[serde(rename = "source:scraped")]
    SourceScraped {
        source_id: String,
        total_found: usize,
        new_count: usize,
    },
    #[serde(rename = "source:error")]
    SourceError { source_id: String, error: String },
    #[serde(rename = "opportunity:found")]
    OpportunityFound {
        opportunity: Box<ScrapedOpportunity>,
        /// Ids of the active watch-lists the opportunity matched.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        watch_lists: Vec<Uuid>,
    },
    #[serde(rename = "monitoring:started")]
    MonitoringStarted,
    #[serde(rename = "monitoring:stopped")]
    MonitoringStopped,
}

impl MonitoringEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SourceScraped { .. } => "source:scraped",
            Self::SourceError { .. } => "source:error",
            Self::OpportunityFound { .. } => "opportunity:found",
            Self::MonitoringStarted => "monitoring:started",
            Self::MonitoringStopped => "monitoring:stopped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OpportunityFilter {
    pub region: Option<String>,
    pub category: Option<String>,
    pub value_min: Option<f64>,
    pub value_max: Option<f64>,
    pub status: Option<OpportunityStatus>,
    pub source_id: Option<String>,
    pub limit: Option<usize>,
}

impl OpportunityFilter {
    pub fn matches(&self, opportunity: &ScrapedOpportunity) -> bool {
        if let Some(status) = self.status {
            if opportunity.status != status {
                return false;
            }
        }
        if let Some(source_id) = &self.source_id {
            if &opportunity.source_id != source_id {
                return false;
            }
        }
        if !contains_ci(opportunity.location.as_deref(), self.region.as_deref()) {
            return false;
        }
        if !contains_ci(opportunity.category.as_deref(), self.category.as_deref()) {
            return false;
        }
        if self.value_min.is_some() || self.value_max.is_some() {
            let Some(value) = opportunity.value else {
                return false;
            };
            if self.value_min.is_some_and(|min| value < min) {
                return false;
            }
            if self.value_max.is_some_and(|max| value > max) {
                return false;
            }
        }
        true
    }
}

/// A saved search. Empty lists and absent bounds match everything; a
/// non-empty list matches when any one of its entries does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchList {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    /// Case-insensitive substrings of the title or description.
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl WatchList {
    pub fn matches(&self, opportunity: &ScrapedOpportunity) -> bool {
        if !self.is_active {
            return false;
        }
        let value_range = OpportunityFilter {
            value_min: self.min_value,
            value_max: self.max_value,
            ..OpportunityFilter::default()
        };
        value_range.matches(opportunity)
            && any_or_empty(&self.regions, |region| {
                contains_ci(opportunity.location.as_deref(), Some(region))
            })
            && any_or_empty(&self.categories, |category| {
                contains_ci(opportunity.category.as_deref(), Some(category))
            })
            && any_or_empty(&self.keywords, |keyword| {
                contains_ci(Some(&opportunity.title), Some(keyword))
                    || contains_ci(opportunity.description.as_deref(), Some(keyword))
            })
    }
}

fn any_or_empty(needles: &[String], pred: impl Fn(&str) -> bool) -> bool {
    let mut needles = needles.iter().map(|n| n.trim()).filter(|n| !n.is_empty()).peekable();
    needles.peek().is_none() || needles.any(pred)
}

fn contains_ci(haystack: Option<&str>, needle: Option<&str>) -> bool {
    match (haystack, needle) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(h), Some(n)) => h.to_lowercase().contains(&n.to_lowercase()),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStats {
    pub name: String,
    pub state: SourceState,
    pub opportunities: usize,
    pub total_scraped: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MonitoringStats {
    pub total_sources: usize,
    pub active_sources: usize,
    pub total_opportunities: usize,
    pub new_today: usize,
    pub by_source: BTreeMap<String, SourceStats>,
    pub by_state: BTreeMap<String, usize>,
    pub by_category: BTreeMap<String, usize>,
    pub average_value: Option<f64>,
    pub upcoming_deadlines: usize,
}
