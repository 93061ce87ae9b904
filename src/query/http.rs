//! HTTP read API.
//!
//! `GET /api/v1/services/:id/flamegraph?start&end&hostname&container&format`
//! with `format` one of `tree` (default), `collapsed` or `rows`;
//! `GET /api/v1/services/:id/timeline` and `GET /api/v1/services/:id/metrics`
//! take the same window parameters. Timestamps are RFC 3339. A missing
//! `end` means now and a missing `start` means one hour before `end`.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::flamegraph::{FlameGraph, Percentiles};
use super::{QueryError, QueryService};
use crate::config::bind_addr;
use crate::store::ReadRequest;

const DEFAULT_WINDOW: TimeDelta = TimeDelta::hours(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Tree,
    Collapsed,
    Rows,
}

#[derive(Debug, Default, Deserialize)]
pub struct WindowParams {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub format: Format,
}

impl WindowParams {
    fn request(&self, service_id: u64, now: DateTime<Utc>) -> ReadRequest {
        let end = self.end.unwrap_or(now);
        let start = self.start.unwrap_or(end - DEFAULT_WINDOW);
        ReadRequest {
            service_id,
            start,
            end,
            hostname: self.hostname.clone().filter(|h| !h.is_empty()),
            container: self.container.clone().filter(|c| !c.is_empty()),
        }
    }
}

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidWindow { .. } => StatusCode::BAD_REQUEST,
            Self::TierUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Serves the read API.
pub struct QueryServer {
    addr: String,
    service: Arc<QueryService>,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl QueryServer {
    pub fn new(addr: &str, service: Arc<QueryService>) -> Self {
        Self {
            addr: addr.to_string(),
            service,
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Binds and serves in the background. Returns the bound address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind = bind_addr(&self.addr, ":8080");

        let listener = TcpListener::bind(&bind)
            .await
            .with_context(|| format!("listening on {bind}"))?;
        let local_addr = listener.local_addr().context("getting local address")?;

        let app = router(Arc::clone(&self.service));
        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "query server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "query server error");
            }
        });

        Ok(local_addr)
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        Ok(())
    }
}

pub fn router(service: Arc<QueryService>) -> Router {
    Router::new()
        .route("/api/v1/services/:id/flamegraph", get(flamegraph_handler))
        .route("/api/v1/services/:id/timeline", get(timeline_handler))
        .route("/api/v1/services/:id/metrics", get(metrics_handler))
        .with_state(service)
}

#[derive(Serialize)]
struct TreeMeta {
    service_id: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    total: u64,
    violations: u64,
    percentiles: Percentiles,
}

/// Tree response JSON. The nested tree is written iteratively.
fn tree_body(req: &ReadRequest, graph: &FlameGraph) -> Result<String> {
    let meta = TreeMeta {
        service_id: req.service_id,
        start: req.start,
        end: req.end,
        total: graph.total(),
        violations: graph.violations(),
        percentiles: graph.percentiles(),
    };
    let mut out = serde_json::to_string(&meta).context("serializing flame graph header")?;
    out.pop();
    out.push_str(",\"root\":");
    graph.write_json(&mut out);
    out.push('}');
    Ok(out)
}

/// GET /api/v1/services/:id/flamegraph
async fn flamegraph_handler(
    State(service): State<Arc<QueryService>>,
    Path(service_id): Path<u64>,
    Query(params): Query<WindowParams>,
) -> Result<Response, QueryError> {
    let req = params.request(service_id, service.now());

    let response = match params.format {
        Format::Tree => {
            let graph = service.flamegraph(&req).await?;
            match tree_body(&req, &graph) {
                Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
                Err(e) => {
                    tracing::error!(error = %e, "rendering flame graph");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                }
            }
        }
        Format::Collapsed => {
            let mut body = service.collapsed(&req).await?.join("\n");
            body.push('\n');
            ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
        }
        Format::Rows => Json(service.rows(&req).await?.rows).into_response(),
    };

    Ok(response)
}

/// GET /api/v1/services/:id/timeline
async fn timeline_handler(
    State(service): State<Arc<QueryService>>,
    Path(service_id): Path<u64>,
    Query(params): Query<WindowParams>,
) -> Result<Response, QueryError> {
    let req = params.request(service_id, service.now());
    Ok(Json(service.timeline(&req).await?).into_response())
}

/// GET /api/v1/services/:id/metrics
async fn metrics_handler(
    State(service): State<Arc<QueryService>>,
    Path(service_id): Path<u64>,
    Query(params): Query<WindowParams>,
) -> Result<Response, QueryError> {
    let req = params.request(service_id, service.now());
    Ok(Json(service.metrics_summary(&req).await?).into_response())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::clock::FixedClock;
    use crate::export::health::HealthMetrics;
    use crate::stack::hash::{path_hash, ROOT_PARENT};
    use crate::store::retention::RetentionPolicy;
    use crate::store::{MemoryStore, StackRow, Store, Tier, TieredStore};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 20, 12, 30, 0).unwrap()
    }

    async fn server() -> (QueryServer, SocketAddr, Arc<Store>) {
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let ts = now() - TimeDelta::minutes(20);
        let main = path_hash(&["main"]);
        let rows = vec![
            StackRow {
                service_id: 5,
                timestamp: ts,
                hash: main,
                parent_hash: ROOT_PARENT,
                name: Arc::from("main"),
                hostname: Arc::from("h1"),
                container: Arc::from(""),
                num_samples: 8,
            },
            StackRow {
                service_id: 5,
                timestamp: ts,
                hash: path_hash(&["main", "work"]),
                parent_hash: main,
                name: Arc::from("work \"quoted\""),
                hostname: Arc::from("h1"),
                container: Arc::from(""),
                num_samples: 6,
            },
        ];
        store.append_raw(&rows).await.expect("raw");

        let service = Arc::new(QueryService::new(
            Arc::clone(&store),
            RetentionPolicy::default(),
            Arc::new(FixedClock::new(now())),
            Arc::new(HealthMetrics::new(":0").expect("metrics")),
        ));
        let server = QueryServer::new("127.0.0.1:0", service);
        let addr = server.start().await.expect("start");
        (server, addr, store)
    }

    async fn get(addr: SocketAddr, path: &str) -> (StatusCode, String) {
        let resp = reqwest::get(format!("http://{addr}{path}"))
            .await
            .expect("request");
        let status = StatusCode::from_u16(resp.status().as_u16()).expect("status");
        (status, resp.text().await.expect("body"))
    }

    #[tokio::test]
    async fn test_tree_format() {
        let (server, addr, _) = server().await;

        let (status, body) = get(addr, "/api/v1/services/5/flamegraph").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(json["total"], 8);
        assert_eq!(json["root"]["children"][0]["name"], "main");
        assert_eq!(
            json["root"]["children"][0]["children"][0]["name"],
            "work \"quoted\""
        );
        assert_eq!(json["percentiles"]["p50"], 6);

        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_collapsed_and_rows_formats() {
        let (server, addr, _) = server().await;

        let (status, body) = get(addr, "/api/v1/services/5/flamegraph?format=collapsed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "main 2\nmain;work \"quoted\" 6\n");

        let (status, body) = get(addr, "/api/v1/services/5/flamegraph?format=rows").await;
        assert_eq!(status, StatusCode::OK);
        let rows: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(rows.as_array().map(Vec::len), Some(2));

        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (server, addr, store) = server().await;

        let (status, body) = get(
            addr,
            "/api/v1/services/5/flamegraph?start=2024-03-20T12:00:00Z&end=2024-03-20T11:00:00Z",
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("invalid window"));

        let (status, _) = get(addr, "/api/v1/services/5/flamegraph?start=yesterday").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        if let Store::Memory(mem) = store.as_ref() {
            mem.set_unavailable(Tier::Raw, true);
        }
        let (status, _) = get(addr, "/api/v1/services/5/flamegraph").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        server.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_timeline_and_metrics_endpoints() {
        let (server, addr, _) = server().await;

        let (status, body) = get(addr, "/api/v1/services/5/timeline").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "[]");

        let (status, body) = get(addr, "/api/v1/services/5/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).expect("json");
        assert_eq!(json["samples"], 0);

        server.stop().await.expect("stop");
    }

    #[test]
    fn test_default_window() {
        let req = WindowParams::default().request(1, now());
        assert_eq!(req.end, now());
        assert_eq!(req.start, now() - TimeDelta::hours(1));

        let params = WindowParams {
            hostname: Some(String::new()),
            ..Default::default()
        };
        assert!(!params.request(1, now()).has_filter());
    }
}
