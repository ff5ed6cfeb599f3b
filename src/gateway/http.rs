//! HTTP and WebSocket front door.
//!
//! Endpoints:
//! - POST /api/enqueue                 - queue a change, 202 with its tracking id
//! - GET  /api/result/{tracking_id}    - cached or archived result, 404 otherwise
//! - GET  /api/result-list             - archived results, newest first
//! - GET  /api/health                  - liveness
//! - GET  /metrics                     - Prometheus text exposition
//! - GET  /ws/{tracking_id}            - one text frame with the result, then close

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::Gateway;
use crate::archive::Archive;
use crate::model::{ChangeSubmission, TrackingId};
use crate::telemetry;

/// Shared across request handlers.
pub struct AppState {
    pub gateway: Gateway,
    pub archive: Arc<dyn Archive>,
    /// Scrape handle of the process-wide recorder, if one is installed.
    pub metrics: Option<PrometheusHandle>,
}

fn json_error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/enqueue", post(handle_enqueue))
        .route("/api/result/{tracking_id}", get(handle_result))
        .route("/api/result-list", get(handle_result_list))
        .route("/api/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .route("/ws/{tracking_id}", get(handle_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the task is cancelled.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");
    axum::serve(listener, router(state)).await
}

async fn handle_enqueue(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<ChangeSubmission>,
) -> Response {
    match state.gateway.submit(submission).await {
        Ok(tracking_id) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "tracking_id": tracking_id })),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "enqueue failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "submission queue unavailable")
        }
    }
}

async fn handle_result(
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
) -> Response {
    let tracking_id = TrackingId::from(tracking_id);
    match state.gateway.cached_result(&tracking_id).await {
        Ok(Some(result)) => return (StatusCode::OK, Json(result)).into_response(),
        Ok(None) => {}
        Err(e) => warn!(%tracking_id, error = %e, "result cache lookup failed"),
    }
    match state.archive.get(&tracking_id) {
        Ok(Some(record)) => (StatusCode::OK, Json(record.result)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "result not found"),
        Err(e) => {
            warn!(%tracking_id, error = %e, "archive lookup failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "archive unavailable")
        }
    }
}

async fn handle_result_list(State(state): State<Arc<AppState>>) -> Response {
    match state.archive.list() {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => {
            warn!(error = %e, "archive listing failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "archive unavailable")
        }
    }
}

async fn handle_health() -> impl IntoResponse {
    let response = serde_json::json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    (StatusCode::OK, Json(response))
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => json_error(StatusCode::NOT_FOUND, "metrics disabled"),
    }
}

async fn handle_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(tracking_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| deliver(socket, state, TrackingId::from(tracking_id)))
}

/// Wait for the result, send it as one text frame and close. A client that
/// goes away first just drops the wait.
async fn deliver(mut socket: WebSocket, state: Arc<AppState>, tracking_id: TrackingId) {
    debug!(%tracking_id, "result waiter connected");
    let outcome = tokio::select! {
        result = state.gateway.wait_for(&tracking_id) => Some(result),
        _ = client_gone(&mut socket) => None,
    };

    let result = match outcome {
        Some(Ok(Some(result))) => result,
        Some(Ok(None)) => return,
        Some(Err(e)) => {
            warn!(%tracking_id, error = %e, "result wait failed");
            return;
        }
        None => {
            debug!(%tracking_id, "result waiter disconnected");
            return;
        }
    };

    let payload = match serde_json::to_string(&result) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(%tracking_id, error = %e, "result encoding failed");
            return;
        }
    };
    if socket.send(Message::Text(payload.into())).await.is_ok() {
        counter!(telemetry::RESULTS_DELIVERED).increment(1);
        info!(%tracking_id, "result delivered");
    }
    let _ = socket.send(Message::Close(None)).await;
}

/// Resolves once the client closes or the connection breaks.
async fn client_gone(socket: &mut WebSocket) {
    loop {
        match socket.recv().await {
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
            Some(Ok(_)) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::to_bytes;

    use crate::archive::SledArchive;
    use crate::events::keys;
    use crate::model::{AnalysisResult, Metrics};
    use crate::substrate::Substrate;

    async fn state() -> (Substrate, Arc<AppState>) {
        let substrate = Substrate::in_memory();
        let gateway = Gateway::start(substrate.clone()).await.unwrap();
        let archive = Arc::new(SledArchive::temporary().unwrap());
        let state = AppState {
            gateway,
            archive,
            metrics: None,
        };
        (substrate, Arc::new(state))
    }

    fn result(summary: &str) -> AnalysisResult {
        AnalysisResult {
            change_summary: summary.into(),
            affected_components: vec![],
            tasks: vec![],
            risks: vec![],
            keywords: Default::default(),
            overall_description: String::new(),
            tracker_ids: vec![],
            metrics: Metrics::default(),
        }
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn enqueue_returns_accepted_with_id() {
        let (substrate, state) = state().await;
        let submission: ChangeSubmission =
            serde_json::from_str(r#"{"old_text":"a","new_text":"b","comments":"c"}"#).unwrap();

        let response = handle_enqueue(State(state), Json(submission)).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert!(body["tracking_id"].as_str().is_some_and(|s| !s.is_empty()));
        assert_eq!(
            substrate.queue.len(crate::events::SUBMISSION_QUEUE).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn result_lookup_prefers_cache_then_archive() {
        let (substrate, state) = state().await;

        let missing = handle_result(State(state.clone()), Path("nope".into())).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        state.archive.store(&"old".into(), &result("archived")).unwrap();
        let archived = handle_result(State(state.clone()), Path("old".into())).await;
        assert_eq!(body_json(archived).await["change_summary"], "archived");

        substrate
            .kv
            .set(
                &keys::result(&"new".into()),
                &serde_json::to_string(&result("cached")).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let cached = handle_result(State(state), Path("new".into())).await;
        assert_eq!(cached.status(), StatusCode::OK);
        assert_eq!(body_json(cached).await["change_summary"], "cached");
    }

    #[tokio::test]
    async fn result_list_is_newest_first() {
        let (_substrate, state) = state().await;
        state.archive.store(&"1".into(), &result("first")).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        state.archive.store(&"2".into(), &result("second")).unwrap();

        let response = handle_result_list(State(state)).await;
        let body = body_json(response).await;
        assert_eq!(body[0]["tracking_id"], "2");
        assert_eq!(body[1]["result"]["change_summary"], "first");
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let response = handle_health().await.into_response();
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn metrics_endpoint_renders_recorded_counters() {
        use metrics_exporter_prometheus::PrometheusBuilder;

        let (_substrate, disabled) = state().await;
        let response = handle_metrics(State(disabled)).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            counter!(telemetry::RESULTS_DELIVERED).increment(2);
        });
        let state = Arc::new(AppState {
            gateway: Gateway::start(Substrate::in_memory()).await.unwrap(),
            archive: Arc::new(SledArchive::temporary().unwrap()),
            metrics: Some(handle),
        });

        let response = handle_metrics(State(state)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("changeflow_results_delivered_total 2"));
    }
}
