//! A small HTTP server exposing liveness, readiness and the last pass summaries.
//!
//! * `GET /healthz` answers `ok` as long as the process runs.
//! * `GET /readyz` answers `200` once every control loop completed a pass that was not aborted,
//!   `503` before that.
//! * `GET /status` returns the published [`LoopStatus`] of every loop as JSON.
use std::net::SocketAddr;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use snafu::{ResultExt, Snafu};
use tokio::{net::TcpListener, sync::watch};
use tracing::info;

use crate::{driver::LoopStatus, utils::signal::SignalWatcher};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to bind health server to {address}"))]
    Bind {
        source: std::io::Error,
        address: SocketAddr,
    },

    #[snafu(display("failed to run health server"))]
    Serve { source: std::io::Error },
}

#[derive(Clone, Debug)]
struct HealthState {
    statuses: Vec<watch::Receiver<LoopStatus>>,
}

impl HealthState {
    fn snapshot(&self) -> Vec<LoopStatus> {
        self.statuses
            .iter()
            .map(|status| status.borrow().clone())
            .collect()
    }
}

pub fn router(statuses: Vec<watch::Receiver<LoopStatus>>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness))
        .route("/status", get(status))
        .with_state(HealthState { statuses })
}

async fn readiness(State(state): State<HealthState>) -> (StatusCode, &'static str) {
    if state.snapshot().iter().all(|status| status.ready) {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn status(State(state): State<HealthState>) -> Json<Vec<LoopStatus>> {
    Json(state.snapshot())
}

pub async fn bind(address: SocketAddr) -> Result<TcpListener, Error> {
    TcpListener::bind(address)
        .await
        .context(BindSnafu { address })
}

/// Serves [`router`] on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    statuses: Vec<watch::Receiver<LoopStatus>>,
    shutdown: SignalWatcher,
) -> Result<(), Error> {
    if let Ok(address) = listener.local_addr() {
        info!(%address, "serving health endpoints");
    }

    axum::serve(listener, router(statuses))
        .with_graceful_shutdown(shutdown.handle())
        .await
        .context(ServeSnafu)
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use tower::ServiceExt as _;

    use super::*;

    async fn get_response(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(
                Request::get(uri)
                    .body(Body::empty())
                    .expect("request must build"),
            )
            .await
            .expect("router is infallible");
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body must be readable");

        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn readiness_follows_loops() {
        let (first_tx, first_rx) = watch::channel(LoopStatus::default());
        let (second_tx, second_rx) = watch::channel(LoopStatus::default());
        let router = router(vec![first_rx, second_rx]);

        assert_eq!(
            get_response(router.clone(), "/healthz").await,
            (StatusCode::OK, "ok".to_owned())
        );
        assert_eq!(
            get_response(router.clone(), "/readyz").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );

        first_tx.send_modify(|status| status.ready = true);
        assert_eq!(
            get_response(router.clone(), "/readyz").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );

        second_tx.send_modify(|status| status.ready = true);
        assert_eq!(get_response(router, "/readyz").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn status_lists_every_loop() {
        let (_tx, rx) = watch::channel(LoopStatus {
            scope: "shop".to_owned(),
            ..LoopStatus::default()
        });

        let (code, body) = get_response(router(vec![rx]), "/status").await;
        assert_eq!(code, StatusCode::OK);

        let parsed: serde_json::Value = serde_json::from_str(&body).expect("status is JSON");
        assert_eq!(parsed[0]["scope"], "shop");
        assert_eq!(parsed[0]["state"], "Idle");
        assert_eq!(parsed[0]["ready"], false);
    }
}
