// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runner callback endpoints.

use axum::Json;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::auth::bearer_token;
use super::{AppState, bad_request};
use crate::error::Result;

#[derive(Deserialize)]
pub(super) struct AssetParams {
    asset_id: Uuid,
}

#[derive(Serialize)]
pub(super) struct SignedAssetUrl {
    url: String,
}

/// Presigned URL for an asset of the caller's own function.
pub(super) async fn get_signed_asset_url(
    State(state): State<AppState>,
    headers: HeaderMap,
    params: std::result::Result<Query<AssetParams>, QueryRejection>,
) -> Result<Json<SignedAssetUrl>> {
    let token = bearer_token(&headers)?;
    let ctx = state.runner_auth.authenticate(token).await?;
    let Query(params) = params.map_err(bad_request)?;

    let url = state
        .runner_auth
        .signed_asset_url(&ctx, params.asset_id)
        .await?;

    Ok(Json(SignedAssetUrl {
        url: url.to_string(),
    }))
}
