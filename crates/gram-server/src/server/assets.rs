// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Asset endpoints.
//!
//! Uploads stream the request body into the registry; serve endpoints stream
//! the blob back with the stored content type.

use std::io;

use axum::Json;
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue,
};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::{ReaderStream, StreamReader};
use uuid::Uuid;

use super::auth::ProjectScope;
use super::{AppState, bad_request};
use crate::assets::{Asset, AssetKind, ServedAsset};
use crate::error::{Error, Result};

type QueryResult<T> = std::result::Result<Query<T>, QueryRejection>;

#[derive(Serialize)]
pub(super) struct AssetResponse {
    asset: Asset,
}

#[derive(Serialize)]
pub(super) struct AssetsResponse {
    assets: Vec<Asset>,
}

#[derive(Deserialize)]
pub(super) struct IdParams {
    id: Uuid,
}

#[derive(Deserialize)]
pub(super) struct TokenParams {
    token: String,
}

#[derive(Deserialize)]
pub(super) struct SignRequest {
    id: Uuid,
    ttl_seconds: Option<i64>,
}

#[derive(Serialize)]
pub(super) struct SignResponse {
    url: String,
    expires_at: DateTime<Utc>,
}

async fn upload(
    state: &AppState,
    scope: &ProjectScope,
    kind: AssetKind,
    headers: &HeaderMap,
    body: Body,
) -> Result<Json<AssetResponse>> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| Error::BadRequest("content-length header is required".to_string()))?;

    let reader = StreamReader::new(body.into_data_stream().map_err(io::Error::other));
    let asset = state
        .assets
        .upload(scope.project_id, kind, content_type, content_length, reader)
        .await?;

    Ok(Json(AssetResponse { asset }))
}

pub(super) async fn upload_openapiv3(
    State(state): State<AppState>,
    scope: ProjectScope,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<AssetResponse>> {
    upload(&state, &scope, AssetKind::OpenApiV3, &headers, body).await
}

pub(super) async fn upload_image(
    State(state): State<AppState>,
    scope: ProjectScope,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<AssetResponse>> {
    upload(&state, &scope, AssetKind::Image, &headers, body).await
}

pub(super) async fn upload_chat_attachment(
    State(state): State<AppState>,
    scope: ProjectScope,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<AssetResponse>> {
    upload(&state, &scope, AssetKind::ChatAttachment, &headers, body).await
}

pub(super) async fn upload_functions(
    State(state): State<AppState>,
    scope: ProjectScope,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<AssetResponse>> {
    upload(&state, &scope, AssetKind::Functions, &headers, body).await
}

pub(super) async fn list(
    State(state): State<AppState>,
    scope: ProjectScope,
) -> Result<Json<AssetsResponse>> {
    let assets = state.assets.list(scope.project_id).await?;
    Ok(Json(AssetsResponse { assets }))
}

fn stream(served: ServedAsset) -> Response {
    let ServedAsset { asset, body } = served;
    (
        [
            (CONTENT_TYPE, asset.content_type),
            (CONTENT_LENGTH, asset.content_length.to_string()),
        ],
        Body::from_stream(ReaderStream::new(body)),
    )
        .into_response()
}

pub(super) async fn serve_image(
    State(state): State<AppState>,
    params: QueryResult<IdParams>,
) -> Result<Response> {
    let Query(params) = params.map_err(bad_request)?;
    Ok(stream(state.assets.serve_image(params.id).await?))
}

async fn serve_scoped(
    state: &AppState,
    scope: &ProjectScope,
    params: QueryResult<IdParams>,
    kind: AssetKind,
) -> Result<Response> {
    let Query(params) = params.map_err(bad_request)?;
    Ok(stream(state.assets.serve(scope.project_id, params.id, kind).await?))
}

pub(super) async fn serve_openapiv3(
    State(state): State<AppState>,
    scope: ProjectScope,
    params: QueryResult<IdParams>,
) -> Result<Response> {
    serve_scoped(&state, &scope, params, AssetKind::OpenApiV3).await
}

pub(super) async fn serve_function(
    State(state): State<AppState>,
    scope: ProjectScope,
    params: QueryResult<IdParams>,
) -> Result<Response> {
    serve_scoped(&state, &scope, params, AssetKind::Functions).await
}

pub(super) async fn serve_chat_attachment(
    State(state): State<AppState>,
    scope: ProjectScope,
    params: QueryResult<IdParams>,
) -> Result<Response> {
    serve_scoped(&state, &scope, params, AssetKind::ChatAttachment).await
}

pub(super) async fn serve_chat_attachment_signed(
    State(state): State<AppState>,
    params: QueryResult<TokenParams>,
) -> Result<Response> {
    let Query(params) = params.map_err(bad_request)?;
    let served = state
        .assets
        .serve_chat_attachment_signed(&params.token)
        .await?;

    let mut res = stream(served);
    res.headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    Ok(res)
}

pub(super) async fn create_signed_chat_attachment_url(
    State(state): State<AppState>,
    scope: ProjectScope,
    body: std::result::Result<Json<SignRequest>, JsonRejection>,
) -> Result<Json<SignResponse>> {
    let Json(req) = body.map_err(bad_request)?;
    let signed = state
        .assets
        .create_signed_chat_attachment_url(scope.project_id, req.id, req.ttl_seconds)
        .await?;

    Ok(Json(SignResponse {
        url: signed.url,
        expires_at: signed.expires_at,
    }))
}
