// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for deployment creation, lookup and paging.

mod common;

use common::TestContext;
use gram_server::deployments::{DeploymentStatus, NewDeployment, NewOpenApiV3Attachment};
use gram_server::error::ErrorKind;
use gram_server::workflow::WorkflowQueue;

fn request(key: &str, asset_id: uuid::Uuid) -> NewDeployment {
    NewDeployment {
        idempotency_key: key.to_string(),
        openapiv3_assets: vec![NewOpenApiV3Attachment {
            asset_id,
            name: "Petstore".to_string(),
            slug: "petstore".to_string(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_is_idempotent() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;
    let asset = ctx.upload_petstore(project_id).await;

    let req = request("build-42", asset.id);
    let (first, created) = ctx
        .deployments
        .create(&org, project_id, "user-1", &req)
        .await
        .unwrap();
    assert!(created);
    assert_eq!(first.status, DeploymentStatus::Pending);
    assert_eq!(first.openapiv3_assets.len(), 1);

    let (second, created) = ctx
        .deployments
        .create(&org, project_id, "user-2", &req)
        .await
        .unwrap();
    assert!(!created, "same idempotency key must not create a second deployment");
    assert_eq!(second.id, first.id);
    assert_eq!(second.user_id, "user-1");

    let (items, _) = ctx.deployments.list(project_id, None, 50).await.unwrap();
    assert_eq!(items.len(), 1);

    let workflows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM deployment_workflows WHERE deployment_id = $1")
            .bind(first.id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(workflows, 1, "exactly one workflow is enqueued");

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_create_rejects_foreign_assets() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;
    let (_, other_project) = ctx.create_project("free").await;
    let foreign = ctx.upload_petstore(other_project).await;

    let err = ctx
        .deployments
        .create(&org, project_id, "user-1", &request("foreign", foreign.id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let (items, _) = ctx.deployments.list(project_id, None, 50).await.unwrap();
    assert!(items.is_empty(), "a rejected request leaves nothing behind");

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_get_is_project_scoped() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;
    let (_, other_project) = ctx.create_project("free").await;
    let asset = ctx.upload_petstore(project_id).await;
    let deployment = ctx
        .create_deployment(&org, project_id, &[(&asset, "petstore")], &[])
        .await;

    assert!(ctx.deployments.get(project_id, deployment.id).await.unwrap().is_some());
    assert!(ctx.deployments.get(other_project, deployment.id).await.unwrap().is_none());

    let err = ctx
        .deployments
        .logs(other_project, deployment.id, None, 50)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_list_pages_newest_first() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;
    let asset = ctx.upload_petstore(project_id).await;

    let mut ids = Vec::new();
    for i in 0..5 {
        let (deployment, _) = ctx
            .deployments
            .create(&org, project_id, "user-1", &request(&format!("key-{}", i), asset.id))
            .await
            .unwrap();
        ids.push(deployment.id);
    }
    ids.reverse();

    let (page, next) = ctx.deployments.list(project_id, None, 2).await.unwrap();
    assert_eq!(page.iter().map(|d| d.id).collect::<Vec<_>>(), ids[..2]);
    assert_eq!(next, Some(ids[2]));

    let (page, next) = ctx.deployments.list(project_id, next, 2).await.unwrap();
    assert_eq!(page.iter().map(|d| d.id).collect::<Vec<_>>(), ids[2..4]);

    let (page, next) = ctx.deployments.list(project_id, next, 2).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(next, None);
    assert_eq!(page[0].openapiv3_asset_count, 1);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_worker_queue_claims_new_deployment() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;
    let asset = ctx.upload_petstore(project_id).await;
    let deployment = ctx
        .create_deployment(&org, project_id, &[(&asset, "petstore")], &[])
        .await;

    let queue = WorkflowQueue::new(ctx.pool.clone());
    let jobs = queue
        .claim(std::time::Duration::from_secs(60), 100)
        .await
        .unwrap();
    let job = jobs
        .iter()
        .find(|j| j.deployment_id == deployment.id)
        .expect("new deployment should be claimable");
    assert_eq!(job.project_id, project_id);
    assert_eq!(job.attempts, 1);

    let again = queue
        .claim(std::time::Duration::from_secs(60), 100)
        .await
        .unwrap();
    assert!(
        again.iter().all(|j| j.deployment_id != deployment.id),
        "a leased workflow is not claimed twice"
    );

    queue.complete(deployment.id).await.unwrap();

    ctx.cleanup().await;
}
