// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface.
//!
//! All endpoints speak JSON under `/rpc/<service>.<method>`. Project-scoped
//! handlers take a [`ProjectScope`](auth::ProjectScope); runner callbacks
//! authenticate with a bearer JWT.

mod assets;
pub mod auth;
mod deployments;
pub mod error;
mod functions;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::assets::AssetRegistry;
use crate::deployments::DeploymentStore;
use crate::error::Error;
use crate::functions::runner_auth::RunnerAuth;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// Database pool
    pub pool: PgPool,
    /// Deployment persistence
    pub deployments: DeploymentStore,
    /// Asset registry
    pub assets: AssetRegistry,
    /// Runner JWT validation
    pub runner_auth: RunnerAuth,
    /// Notified when a deployment is created so the workflow worker polls at once
    pub workflow_wake: Arc<Notify>,
    /// Prometheus render handle, when a recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .route("/rpc/deployments.create", post(deployments::create))
        .route("/rpc/deployments.get", post(deployments::get).get(deployments::get))
        .route("/rpc/deployments.list", post(deployments::list).get(deployments::list))
        .route("/rpc/deployments.logs", get(deployments::logs))
        .route("/rpc/assets.uploadOpenAPIv3", post(assets::upload_openapiv3))
        .route("/rpc/assets.uploadImage", post(assets::upload_image))
        .route("/rpc/assets.uploadChatAttachment", post(assets::upload_chat_attachment))
        .route("/rpc/assets.uploadFunctions", post(assets::upload_functions))
        .route("/rpc/assets.list", get(assets::list))
        .route("/rpc/assets.serveImage", get(assets::serve_image))
        .route("/rpc/assets.serveOpenAPIv3", post(assets::serve_openapiv3))
        .route("/rpc/assets.serveFunction", post(assets::serve_function))
        .route("/rpc/assets.serveChatAttachment", post(assets::serve_chat_attachment))
        .route(
            crate::assets::SERVE_CHAT_ATTACHMENT_SIGNED_PATH,
            get(assets::serve_chat_attachment_signed),
        )
        .route(
            "/rpc/assets.createSignedChatAttachmentURL",
            post(assets::create_signed_chat_attachment_url),
        )
        .route("/rpc/functions.getSignedAssetURL", get(functions::get_signed_asset_url))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve `router(state)` on `addr` until `shutdown` is notified.
pub async fn serve(addr: SocketAddr, state: AppState, shutdown: Arc<Notify>) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "HTTP server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
}

async fn healthz() -> Json<Health> {
    Json(Health { status: "ok" })
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn bad_request(rejection: impl std::fmt::Display) -> Error {
    Error::BadRequest(rejection.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, FsBlobStore};
    use crate::encryption::Encryption;
    use crate::functions::credentials::FunctionCredentials;
    use crate::tokens::AssetTokens;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    async fn state() -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let pool = PgPool::connect_lazy("postgres://localhost/dummy").unwrap();
        let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let credentials = FunctionCredentials::new(pool.clone(), Encryption::new([3u8; 32]));
        let state = AppState {
            pool: pool.clone(),
            deployments: DeploymentStore::new(pool.clone()),
            assets: AssetRegistry::new(
                pool.clone(),
                blobs.clone(),
                AssetTokens::new("test-secret"),
                "http://localhost:8080",
            ),
            runner_auth: RunnerAuth::new(pool, credentials, blobs),
            workflow_wake: Arc::new(Notify::new()),
            metrics: None,
        };
        (state, dir)
    }

    #[tokio::test]
    async fn test_healthz() {
        let (state, _dir) = state().await;
        let res = router(state)
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let body = to_bytes(res.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn test_project_endpoints_require_principal() {
        let (state, _dir) = state().await;
        let res = router(state)
            .oneshot(
                Request::post("/rpc/deployments.create")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"idempotency_key":"k"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let body = to_bytes(res.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["name"], "unauthorized");
    }

    #[tokio::test]
    async fn test_runner_endpoint_requires_bearer() {
        let (state, _dir) = state().await;
        let uri = format!("/rpc/functions.getSignedAssetURL?asset_id={}", uuid::Uuid::new_v4());
        let res = router(state)
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_metrics_without_recorder() {
        let (state, _dir) = state().await;
        let res = router(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }
}
