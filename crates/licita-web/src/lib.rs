//! JSON control surface over the monitoring engine.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use licita_core::{MonitoringSource, OpportunityFilter, OpportunityStatus, WatchList};
use licita_sync::{CatalogError, EngineError, MonitoringEngine};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "licita-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: MonitoringEngine,
}

impl AppState {
    pub fn new(engine: MonitoringEngine) -> Self {
        Self { engine }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OpportunitiesQuery {
    region: Option<String>,
    category: Option<String>,
    value_min: Option<f64>,
    value_max: Option<f64>,
    status: Option<OpportunityStatus>,
    source: Option<String>,
    limit: Option<usize>,
}

impl From<OpportunitiesQuery> for OpportunityFilter {
    fn from(q: OpportunitiesQuery) -> Self {
        Self {
            region: q.region.filter(|v| !v.is_empty()),
            category: q.category.filter(|v| !v.is_empty()),
            value_min: q.value_min,
            value_max: q.value_max,
            status: q.status,
            source_id: q.source.filter(|v| !v.is_empty()),
            limit: q.limit,
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/sources", get(list_sources_handler).post(add_source_handler))
        .route("/sources/{id}/test", post(test_source_handler))
        .route("/sources/{id}/activate", post(activate_handler))
        .route("/sources/{id}/deactivate", post(deactivate_handler))
        .route("/stats", get(stats_handler))
        .route("/opportunities", get(opportunities_handler))
        .route("/watch-lists", get(list_watch_lists_handler).post(add_watch_list_handler))
        .route("/watch-lists/{id}", delete(remove_watch_list_handler))
        .route("/monitoring/start", post(start_handler))
        .route("/monitoring/stop", post(stop_handler))
        .with_state(Arc::new(state))
}

pub async fn serve<F>(engine: MonitoringEngine, port: u16, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "control surface listening");
    axum::serve(listener, app(AppState::new(engine)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({
        "status": "ok",
        "monitoring": state.engine.is_running().await,
    }))
    .into_response()
}

async fn list_sources_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.list_sources().await).into_response()
}

async fn add_source_handler(
    State(state): State<Arc<AppState>>,
    Json(source): Json<MonitoringSource>,
) -> Response {
    match state.engine.add_custom_source(source).await {
        Ok(added) => (StatusCode::CREATED, Json(added)).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn test_source_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.test_source(&id).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn activate_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.activate_source(&id).await {
        Ok(source) => Json(source).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn deactivate_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.engine.deactivate_source(&id).await {
        Ok(source) => Json(source).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.get_monitoring_stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    match state.engine.list_opportunities(query.into()).await {
        Ok(rows) => Json(rows).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn list_watch_lists_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.engine.list_watch_lists().await).into_response()
}

async fn add_watch_list_handler(
    State(state): State<Arc<AppState>>,
    Json(watch): Json<WatchList>,
) -> Response {
    match state.engine.add_watch_list(watch).await {
        Ok(added) => (StatusCode::CREATED, Json(added)).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn remove_watch_list_handler(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> Response {
    match state.engine.remove_watch_list(id).await {
        Ok(removed) => Json(removed).into_response(),
        Err(err) => engine_error(err),
    }
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Response {
    let changed = state.engine.start().await;
    Json(json!({ "running": true, "changed": changed })).into_response()
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Response {
    let changed = state.engine.stop().await;
    Json(json!({ "running": false, "changed": changed })).into_response()
}

fn engine_error(err: EngineError) -> Response {
    let status = match &err {
        EngineError::Catalog(CatalogError::UnknownSource(_)) | EngineError::UnknownWatchList(_) => {
            StatusCode::NOT_FOUND
        }
        EngineError::Catalog(CatalogError::DuplicateId(_)) | EngineError::Busy(_) => StatusCode::CONFLICT,
        EngineError::Catalog(_) | EngineError::InvalidWatchList(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Persistence(_) => {
            error!(error = %err, "store unavailable");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::Utc;
    use http_body_util::BodyExt;
    use licita_adapters::AuthRegistry;
    use licita_core::{
        Authentication, Pagination, RawPage, SelectorConfig, Session, SourceHealth, SourceLimits,
        SourceType,
    };
    use licita_storage::{FetchError, InMemoryOpportunityStore, PageFetcher, RequestBudget};
    use licita_sync::MonitoringConfig;
    use serde_json::Value;
    use tower::ServiceExt;

    const PAGE: &str = r#"<html><body>
        <div class="item"><h3>Pregão 1</h3><span class="orgao">Câmara Municipal</span>
          <span class="prazo">10/10/2099</span><span class="local">Santos - SP</span>
          <span class="situacao">Aberto</span><a href="/1">ver</a></div>
        <div class="item"><h3>Pregão 2</h3><span class="orgao">Câmara Municipal</span>
          <span class="prazo">11/10/2099</span><span class="local">Natal - RN</span>
          <span class="situacao">Aberto</span><a href="/2">ver</a></div>
      </body></html>"#;

    struct OnePageFetcher;

    #[async_trait]
    impl PageFetcher for OnePageFetcher {
        async fn fetch_page(
            &self,
            source: &MonitoringSource,
            page: u32,
            _session: &Session,
            budget: &dyn RequestBudget,
        ) -> Result<RawPage, FetchError> {
            if !budget.try_acquire().await {
                return Err(FetchError::BudgetExhausted);
            }
            Ok(RawPage {
                source_id: source.id.clone(),
                page,
                url: source.url.clone(),
                body: if page == 1 { PAGE.to_string() } else { String::new() },
                fetched_at: Utc::now(),
            })
        }
    }

    fn source(id: &str) -> MonitoringSource {
        MonitoringSource {
            id: id.to_string(),
            name: "Câmara".to_string(),
            source_type: SourceType::Municipal,
            url: "https://camara.test/licitacoes".to_string(),
            selectors: SelectorConfig {
                container: "div.item".into(),
                title: "h3".into(),
                entity: ".orgao".into(),
                deadline: ".prazo".into(),
                link: "a@href".into(),
                status: Some(".situacao".into()),
                location: Some(".local".into()),
                ..SelectorConfig::default()
            },
            update_frequency: "15m".to_string(),
            is_active: true,
            limits: SourceLimits {
                max_pages: 2,
                request_delay_ms: 0,
                daily_limit: 10,
            },
            authentication: Authentication::None,
            pagination: Pagination::default(),
            health: SourceHealth::default(),
        }
    }

    fn engine() -> MonitoringEngine {
        MonitoringEngine::new(
            MonitoringConfig::default(),
            vec![source("camara")],
            Arc::new(OnePageFetcher),
            Arc::new(InMemoryOpportunityStore::new()),
            AuthRegistry::default(),
        )
        .unwrap()
    }

    async fn send(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn health_and_sources_listing() {
        let app = app(AppState::new(engine()));
        let (status, body) = send(app.clone(), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["monitoring"], false);

        let (status, body) = send(app, "GET", "/sources", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["id"], "camara");
        assert_eq!(body[0]["state"], "ACTIVE");
        assert_eq!(body[0]["type"], "MUNICIPAL");
    }

    #[tokio::test]
    async fn add_source_maps_catalog_errors_to_status_codes() {
        let app = app(AppState::new(engine()));
        let new_source = serde_json::to_value(source("diario")).unwrap();
        let (status, body) = send(app.clone(), "POST", "/sources", Some(new_source.clone())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["id"], "diario");

        let (status, _) = send(app.clone(), "POST", "/sources", Some(new_source)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let mut broken = serde_json::to_value(source("quebrado")).unwrap();
        broken["update_frequency"] = Value::from("whenever");
        let (status, body) = send(app, "POST", "/sources", Some(broken)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("whenever"));
    }

    #[tokio::test]
    async fn test_source_and_activation_routes() {
        let app = app(AppState::new(engine()));
        let (status, body) = send(app.clone(), "POST", "/sources/camara/test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["opportunities_found"], 2);

        let (status, _) = send(app.clone(), "POST", "/sources/nope/test", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(app.clone(), "POST", "/sources/camara/deactivate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], false);

        let (_, body) = send(app.clone(), "GET", "/sources", None).await;
        assert_eq!(body[0]["state"], "INACTIVE");

        let (status, body) = send(app, "POST", "/sources/camara/activate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_active"], true);
    }

    #[tokio::test]
    async fn opportunities_and_stats_reflect_completed_cycles() {
        let engine = engine();
        engine.run_cycle("camara").await.unwrap();
        let app = app(AppState::new(engine));

        let (status, body) = send(app.clone(), "GET", "/opportunities?region=rn&limit=5", None).await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], "Pregão 2");

        let (_, body) = send(app.clone(), "GET", "/opportunities?status=CLOSED", None).await;
        assert_eq!(body.as_array().unwrap().len(), 0);

        let (status, body) = send(app, "GET", "/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_opportunities"], 2);
        assert_eq!(body["by_state"]["SP"], 1);
        assert_eq!(body["by_source"]["camara"]["opportunities"], 2);
    }

    #[tokio::test]
    async fn monitoring_start_and_stop_are_idempotent() {
        let engine = engine();
        let app = app(AppState::new(engine.clone()));

        let (_, body) = send(app.clone(), "POST", "/monitoring/start", None).await;
        assert_eq!(body["changed"], true);
        let (_, body) = send(app.clone(), "POST", "/monitoring/start", None).await;
        assert_eq!(body["changed"], false);
        assert!(engine.is_running().await);

        let (_, body) = send(app.clone(), "POST", "/monitoring/stop", None).await;
        assert_eq!(body["changed"], true);
        let (_, body) = send(app, "POST", "/monitoring/stop", None).await;
        assert_eq!(body["changed"], false);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn watch_lists_can_be_registered_listed_and_removed() {
        let app = app(AppState::new(engine()));
        let (status, body) = send(
            app.clone(),
            "POST",
            "/watch-lists",
            Some(serde_json::json!({ "name": "Câmaras do RN", "regions": ["RN"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["id"].as_str().unwrap().to_string();
        assert_eq!(body["is_active"], true);

        let (status, _) = send(
            app.clone(),
            "POST",
            "/watch-lists",
            Some(serde_json::json!({ "name": " ", "keywords": ["pregão"] })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (_, body) = send(app.clone(), "GET", "/watch-lists", None).await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let uri = format!("/watch-lists/{id}");
        let (status, body) = send(app.clone(), "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Câmaras do RN");
        let (status, _) = send(app, "DELETE", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
