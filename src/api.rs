// src/api.rs

//! HTTP ingress: the four check-in routes external bootstrap tooling POSTs
//! to. Grounded on `original_source/flaskapi.py`; the listen-and-shutdown
//! idiom is carried over from the teacher's `server/metrics_server.rs`.
//! Handlers enqueue onto the `Store`-backed task queue and return
//! immediately — all actual orchestration happens in `queue` workers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::{get, post}};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::ApiConfig;
use crate::error::BootstrapError;
use crate::store::Store;

#[derive(Clone)]
struct ApiState {
    store: Arc<Store>,
}

/// Mirrors the dnsmasq `--dhcp-script` callback payload; `action` is the
/// only field guaranteed present (`add`, `old`, `del`, `tftp`).
#[derive(Debug, Deserialize, Default)]
pub struct DnsmasqCheckin {
    pub action: Option<String>,
    pub macaddr: Option<String>,
    pub ipaddr: Option<String>,
    pub hostname: Option<String>,
    pub client_id: Option<String>,
    pub vendor_class: Option<String>,
    pub user_class: Option<String>,
}

/// A check-in reported in-band by the host itself during/after install.
#[derive(Debug, Deserialize, Default)]
pub struct HostCheckin {
    pub action: Option<String>,
    pub hostname: Option<String>,
    pub host_macaddr: Option<String>,
    pub host_ipaddr: Option<String>,
    pub bmc_macaddr: Option<String>,
    pub bmc_ipaddr: Option<String>,
}

async fn root() -> impl IntoResponse {
    Json(json!({ "message": "pvc-bootstrapd API" }))
}

async fn checkin_root() -> impl IntoResponse {
    Json(json!({ "message": "pvc-bootstrapd API checkin interface" }))
}

/// Malformed JSON is not a client error worth rejecting: matching the
/// original's behavior, a bad body is logged and treated as an empty
/// `{action: None}` event so a misbehaving DHCP client can't wedge the
/// checkin pipeline.
async fn checkin_dnsmasq(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    let event: DnsmasqCheckin = serde_json::from_str(&body).unwrap_or_else(|e| {
        warn!("invalid dnsmasq checkin JSON, treating as no-op: {}", e);
        DnsmasqCheckin::default()
    });
    info!("handling dnsmasq checkin: action={:?}", event.action);

    let payload = serde_json::to_string(&dnsmasq_checkin_json(&event)).unwrap_or_default();
    if let Err(e) = state.store.enqueue_task("dnsmasq_checkin", &payload).await {
        warn!("failed to enqueue dnsmasq checkin: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": "enqueue failed" })));
    }
    (StatusCode::OK, Json(json!({ "message": "received checkin from DNSMasq" })))
}

async fn checkin_host(State(state): State<ApiState>, body: String) -> impl IntoResponse {
    let event: HostCheckin = serde_json::from_str(&body).unwrap_or_else(|e| {
        warn!("invalid host checkin JSON, treating as no-op: {}", e);
        HostCheckin::default()
    });
    info!("handling host checkin: action={:?}", event.action);

    let payload = serde_json::to_string(&host_checkin_json(&event)).unwrap_or_default();
    if let Err(e) = state.store.enqueue_task("host_checkin", &payload).await {
        warn!("failed to enqueue host checkin: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "message": "enqueue failed" })));
    }
    (StatusCode::OK, Json(json!({ "message": "received checkin from Host" })))
}

fn dnsmasq_checkin_json(event: &DnsmasqCheckin) -> serde_json::Value {
    json!({
        "action": event.action,
        "macaddr": event.macaddr,
        "ipaddr": event.ipaddr,
        "hostname": event.hostname,
        "client_id": event.client_id,
        "vendor_class": event.vendor_class,
        "user_class": event.user_class,
    })
}

fn host_checkin_json(event: &HostCheckin) -> serde_json::Value {
    json!({
        "action": event.action,
        "hostname": event.hostname,
        "host_macaddr": event.host_macaddr,
        "host_ipaddr": event.host_ipaddr,
        "bmc_macaddr": event.bmc_macaddr,
        "bmc_ipaddr": event.bmc_ipaddr,
    })
}

pub fn router(store: Arc<Store>) -> Router {
    let state = ApiState { store };
    Router::new()
        .route("/", get(root))
        .route("/checkin", get(checkin_root))
        .route("/checkin/dnsmasq", post(checkin_dnsmasq))
        .route("/checkin/host", post(checkin_host))
        .with_state(state)
}

/// Serves the check-in API until shutdown is requested.
pub async fn run(
    config: &ApiConfig,
    store: Arc<Store>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), BootstrapError> {
    let app = router(store);
    let addr: SocketAddr = format!("{}:{}", config.address, config.port)
        .parse()
        .map_err(|e| BootstrapError::Runner(format!("invalid api listen address: {e}")))?;

    info!("checkin API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("checkin API shutting down");
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_store() -> Arc<Store> {
        Store::open(":memory:").unwrap()
    }

    #[tokio::test]
    async fn root_returns_message() {
        let app = router(test_store().await);
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_dnsmasq_checkin_is_accepted_as_noop() {
        let store = test_store().await;
        let app = router(store.clone());
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/checkin/dnsmasq")
                    .header("content-type", "application/json")
                    .body(Body::from("not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let leased = store.lease_next_task("worker-test").await.unwrap();
        assert!(leased.is_some());
    }

    #[tokio::test]
    async fn valid_host_checkin_enqueues_a_task() {
        let store = test_store().await;
        let app = router(store.clone());
        let body = serde_json::to_string(&json!({
            "action": "begin",
            "hostname": "n1",
        }))
        .unwrap();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/checkin/host")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let leased = store.lease_next_task("worker-test").await.unwrap().unwrap();
        assert_eq!(leased.handler, "host_checkin");
    }
}
