// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployment endpoints.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::auth::ProjectScope;
use super::{AppState, bad_request};
use crate::deployments::{DEFAULT_PAGE_SIZE, Deployment, DeploymentEvent, DeploymentSummary, NewDeployment};
use crate::error::{Error, Result};

#[derive(Serialize)]
pub(super) struct DeploymentResponse {
    deployment: Deployment,
}

#[derive(Deserialize)]
pub(super) struct GetParams {
    id: Uuid,
}

#[derive(Deserialize)]
pub(super) struct PageParams {
    cursor: Option<Uuid>,
    limit: Option<i64>,
}

#[derive(Serialize)]
pub(super) struct ListResponse {
    items: Vec<DeploymentSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<Uuid>,
}

#[derive(Deserialize)]
pub(super) struct LogsParams {
    deployment_id: Uuid,
    cursor: Option<Uuid>,
    limit: Option<i64>,
}

#[derive(Serialize)]
pub(super) struct LogsResponse {
    events: Vec<DeploymentEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    next_cursor: Option<Uuid>,
}

pub(super) async fn create(
    State(state): State<AppState>,
    scope: ProjectScope,
    body: std::result::Result<Json<NewDeployment>, JsonRejection>,
) -> Result<Json<DeploymentResponse>> {
    let Json(req) = body.map_err(bad_request)?;

    let (deployment, created) = state
        .deployments
        .create(
            &scope.principal.organization_id,
            scope.project_id,
            &scope.principal.user_id,
            &req,
        )
        .await?;

    if created {
        info!(
            deployment_id = %deployment.id,
            project_id = %scope.project_id,
            "Deployment created"
        );
        state.workflow_wake.notify_one();
    }

    Ok(Json(DeploymentResponse { deployment }))
}

pub(super) async fn get(
    State(state): State<AppState>,
    scope: ProjectScope,
    params: std::result::Result<Query<GetParams>, QueryRejection>,
) -> Result<Json<DeploymentResponse>> {
    let Query(params) = params.map_err(bad_request)?;

    let deployment = state
        .deployments
        .get(scope.project_id, params.id)
        .await?
        .ok_or_else(|| Error::NotFound("deployment not found".to_string()))?;

    Ok(Json(DeploymentResponse { deployment }))
}

pub(super) async fn list(
    State(state): State<AppState>,
    scope: ProjectScope,
    params: std::result::Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<ListResponse>> {
    let Query(params) = params.map_err(bad_request)?;

    let (items, next_cursor) = state
        .deployments
        .list(
            scope.project_id,
            params.cursor,
            params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;

    Ok(Json(ListResponse { items, next_cursor }))
}

pub(super) async fn logs(
    State(state): State<AppState>,
    scope: ProjectScope,
    params: std::result::Result<Query<LogsParams>, QueryRejection>,
) -> Result<Json<LogsResponse>> {
    let Query(params) = params.map_err(bad_request)?;

    let (events, next_cursor) = state
        .deployments
        .logs(
            scope.project_id,
            params.deployment_id,
            params.cursor,
            params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;

    Ok(Json(LogsResponse { events, next_cursor }))
}
