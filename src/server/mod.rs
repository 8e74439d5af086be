//! HTTP surface - Server-Sent Events stream per subscription plus health

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::core::clients::{Clients, ClientsError};
use crate::core::point::MetricKind;

/// Shared handler state.
#[derive(Clone)]
struct AppState {
    clients: Clients,
    metrics: Vec<MetricKind>,
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    n: Option<String>,
    m: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    clients: usize,
    max_seconds: i64,
    metrics: Vec<MetricKind>,
}

/// Missing or non-numeric parameters count as zero and fail the range check.
fn param(raw: Option<&str>) -> i64 {
    raw.and_then(|value| value.trim().parse().ok()).unwrap_or(0)
}

async fn handle_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Response {
    let n = param(params.n.as_deref());
    let m = param(params.m.as_deref());

    let subscription = match state.clients.new_client(n, m) {
        Ok(subscription) => subscription,
        Err(e) => {
            let status = match e {
                ClientsError::OutOfRange { .. } => StatusCode::BAD_REQUEST,
                ClientsError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            };
            tracing::debug!(n, m, error = %e, "subscription rejected");
            return (
                status,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    };

    tracing::info!(client = %subscription.id(), n, m, "client subscribed");
    let events = subscription
        .into_stream()
        .map(|stats| Event::default().event("stats").json_data(&*stats));

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        clients: state.clients.len(),
        max_seconds: state.clients.max_seconds(),
        metrics: state.metrics.clone(),
    })
}

/// Build the axum router.
pub fn router(clients: Clients, metrics: Vec<MetricKind>) -> Router {
    Router::new()
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .with_state(AppState { clients, metrics })
}

/// Running HTTP server with a graceful-shutdown trigger.
pub struct Server {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Server {
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("cannot listen on {addr}"))?;
        let local_addr = listener.local_addr()?;

        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await
        });

        tracing::info!(addr = %local_addr, "http server is listening");
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections; open streams keep running until their
    /// queues close.
    pub fn begin_shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }

    /// Wait up to `deadline` for in-flight connections to drain.
    pub async fn wait(mut self, deadline: Duration) -> Result<()> {
        self.begin_shutdown();
        match tokio::time::timeout(deadline, &mut self.task).await {
            Ok(joined) => joined
                .context("http server task failed")?
                .context("http server failed"),
            Err(_) => {
                tracing::warn!("http server did not drain in time, aborting it");
                self.task.abort();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::events::{command_channel, CommandReceiver, MetricsData};
    use crate::core::point::Points;
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;

    struct Harness {
        clients: Clients,
        server: Server,
        _commands: CommandReceiver,
    }

    impl Harness {
        async fn start() -> Self {
            let clock = Arc::new(ManualClock::new());
            let (tx, commands) = command_channel();
            let clients = Clients::new(600, clock, tx);
            let router = router(clients.clone(), vec![MetricKind::LoadAvg, MetricKind::Cpu]);
            let server = Server::bind("127.0.0.1:0".parse().unwrap(), router)
                .await
                .unwrap();
            Self {
                clients,
                server,
                _commands: commands,
            }
        }

        fn url(&self, path: &str) -> String {
            format!("http://{}{}", self.server.local_addr(), path)
        }
    }

    #[tokio::test]
    async fn health_reports_clients_and_metrics() {
        let harness = Harness::start().await;
        let _subscription = harness.clients.new_client(1, 1).unwrap();

        let body: serde_json::Value = reqwest::get(harness.url("/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        pretty_assertions::assert_eq!(
            body,
            serde_json::json!({
                "status": "ok",
                "clients": 1,
                "max_seconds": 600,
                "metrics": ["loadavg", "cpu"],
            })
        );
    }

    #[tokio::test]
    async fn out_of_range_parameters_are_rejected() {
        let harness = Harness::start().await;

        for query in ["/stats?n=0&m=1", "/stats?n=1&m=601", "/stats?n=x&m=1", "/stats"] {
            let response = reqwest::get(harness.url(query)).await.unwrap();
            assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST, "{query}");
            let body: serde_json::Value = response.json().await.unwrap();
            let error = body["error"].as_str().unwrap();
            assert!(error.contains("out of range"), "{error}");
        }
        assert_eq!(harness.clients.len(), 0);
    }

    #[tokio::test]
    async fn closing_registry_answers_service_unavailable() {
        let harness = Harness::start().await;
        harness.clients.stop(Duration::from_secs(1)).await;

        let response = reqwest::get(harness.url("/stats?n=1&m=1")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["error"], "service is closing");
    }

    #[tokio::test]
    async fn streams_stats_events_until_registry_stops() {
        let harness = Harness::start().await;

        let response = reqwest::get(harness.url("/stats?n=1&m=1")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(harness.clients.len(), 1);

        harness.clients.send_stats(&MetricsData {
            time: Utc.timestamp_opt(1_700_000_001, 0).unwrap(),
            points: Points::new(),
        });
        harness.clients.stop(Duration::from_secs(1)).await;

        let body = tokio::time::timeout(Duration::from_secs(5), response.text())
            .await
            .expect("stream ends")
            .unwrap();
        assert!(body.contains("event: stats"), "{body}");
        assert!(
            body.contains(r#"data: {"time":"2023-11-14T22:13:21Z"}"#),
            "{body}"
        );
    }

    #[tokio::test]
    async fn wait_returns_after_shutdown() {
        let harness = Harness::start().await;
        let addr = harness.server.local_addr();

        harness.server.wait(Duration::from_secs(1)).await.unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
