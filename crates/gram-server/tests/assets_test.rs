// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the asset registry.

mod common;

use common::{PETSTORE, TestContext, zip_bytes};
use gram_server::assets::AssetKind;
use gram_server::error::{Error, ErrorKind};
use tokio::io::AsyncReadExt;
use url::Url;

#[tokio::test]
async fn test_upload_is_deduplicated_per_project() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (_, project_a) = ctx.create_project("free").await;
    let (_, project_b) = ctx.create_project("free").await;

    let first = ctx.upload_petstore(project_a).await;
    let again = ctx.upload_petstore(project_a).await;
    assert_eq!(first.id, again.id);
    assert_eq!(first.sha256, again.sha256);
    assert_eq!(first.content_length, PETSTORE.len() as i64);

    let other = ctx.upload_petstore(project_b).await;
    assert_ne!(first.id, other.id, "identical content in another project is a new asset");
    assert_eq!(first.sha256, other.sha256);

    assert_eq!(ctx.assets.list(project_a).await.unwrap().len(), 1);
    assert!(ctx.assets.get(project_b, first.id).await.unwrap().is_none());

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_stored_content_round_trips() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (_, project_id) = ctx.create_project("free").await;

    let asset = ctx.upload_petstore(project_id).await;
    let url = Url::parse(&asset.url).unwrap();
    assert!(url.path().ends_with(".yaml"), "unexpected blob path {}", url);

    let mut served = ctx
        .assets
        .serve(project_id, asset.id, AssetKind::OpenApiV3)
        .await
        .unwrap();
    let mut body = String::new();
    served.body.read_to_string(&mut body).await.unwrap();
    assert_eq!(body, PETSTORE);

    let wrong_kind = ctx.assets.serve(project_id, asset.id, AssetKind::Image).await;
    assert!(matches!(wrong_kind, Err(Error::NotFound(_))));

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_upload_rejections() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (_, project_id) = ctx.create_project("free").await;

    let err = ctx
        .upload(project_id, AssetKind::Image, "text/html", b"<html>")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedMedia);

    let err = ctx
        .upload(project_id, AssetKind::OpenApiV3, "application/yaml", b"")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let no_entrypoint = zip_bytes(&[("index.js", "console.log(1)"), ("manifest.json", "{}")]);
    let err = ctx
        .upload(project_id, AssetKind::Functions, "application/zip", &no_entrypoint)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let err = ctx
        .upload(project_id, AssetKind::Functions, "application/zip", b"not a zip at all")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    assert!(ctx.assets.list(project_id).await.unwrap().is_empty());

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_signed_chat_attachment_url() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (_, project_id) = ctx.create_project("free").await;
    let (_, other_project) = ctx.create_project("free").await;

    let asset = ctx
        .upload(project_id, AssetKind::ChatAttachment, "text/plain", b"hello there")
        .await
        .unwrap();

    let signed = ctx
        .assets
        .create_signed_chat_attachment_url(project_id, asset.id, Some(60))
        .await
        .unwrap();
    let url = Url::parse(&signed.url).unwrap();
    assert_eq!(url.path(), gram_server::assets::SERVE_CHAT_ATTACHMENT_SIGNED_PATH);
    let token = url
        .query_pairs()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
        .unwrap();

    let mut served = ctx.assets.serve_chat_attachment_signed(&token).await.unwrap();
    let mut body = String::new();
    served.body.read_to_string(&mut body).await.unwrap();
    assert_eq!(body, "hello there");

    let foreign = ctx
        .assets
        .create_signed_chat_attachment_url(other_project, asset.id, None)
        .await;
    assert!(matches!(foreign, Err(Error::NotFound(_))));

    let tampered = ctx
        .assets
        .serve_chat_attachment_signed(&format!("{}x", token))
        .await;
    assert!(tampered.is_err());

    ctx.cleanup().await;
}
