// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for runner deploys and reaping against the mock platform.

mod common;

use std::sync::Arc;

use common::TestContext;
use gram_server::functions::Runtime;
use gram_server::runner::mock::MockStep;
use gram_server::runner::{
    DeployRequest, MockPlatform, OrchestratorConfig, RunnerOrchestrator, RunnerStore,
};
use uuid::Uuid;

/// Create a deployment with one function and return a deploy request for it.
async fn deploy_request(ctx: &TestContext, org: &str, project_id: Uuid, slug: &str) -> DeployRequest {
    let bundle = ctx.upload_node_bundle(project_id).await;
    let deployment = ctx
        .create_deployment(org, project_id, &[], &[(&bundle, slug, "nodejs:22")])
        .await;
    let function_id: Uuid =
        sqlx::query_scalar("SELECT id FROM deployments_functions WHERE deployment_id = $1")
            .bind(deployment.id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();

    DeployRequest {
        version: "main".to_string(),
        project_id,
        deployment_id: deployment.id,
        function_id,
        function_slug: slug.to_string(),
        access_id: Uuid::new_v4(),
        runtime: Runtime::NodeJs22,
        assets: Vec::new(),
        bearer_secret: "c2VjcmV0".to_string(),
    }
}

#[tokio::test]
async fn test_redeploy_reaps_previous_runner() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;
    let req = deploy_request(&ctx, &org, project_id, "weather").await;

    let first = ctx.orchestrator.deploy(&req).await.unwrap();
    let second = ctx.orchestrator.deploy(&req).await.unwrap();
    assert_ne!(first.urn, second.urn);

    let live = RunnerStore::new(ctx.pool.clone())
        .live_for_function(project_id, req.deployment_id, req.function_id)
        .await
        .unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(ctx.platform.live_apps().await, vec![second.urn.app.clone()]);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_reap_keeps_newest_runners_per_function() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;

    let mut apps = Vec::new();
    for _ in 0..5 {
        let req = deploy_request(&ctx, &org, project_id, "weather").await;
        let result = ctx.orchestrator.deploy(&req).await.unwrap();
        apps.push(result.urn.app);
    }
    let other = deploy_request(&ctx, &org, project_id, "search").await;
    ctx.orchestrator.deploy(&other).await.unwrap();

    let outcome = ctx
        .orchestrator
        .reap(Some(project_id), 3, 50)
        .await
        .unwrap();
    assert_eq!(outcome.reaped, 2);
    assert_eq!(outcome.errors, 0);

    let mut counts = RunnerStore::new(ctx.pool.clone())
        .live_counts(project_id)
        .await
        .unwrap();
    counts.sort();
    assert_eq!(
        counts,
        vec![("search".to_string(), 1), ("weather".to_string(), 3)]
    );

    let live = ctx.platform.live_apps().await;
    assert!(!live.contains(&apps[0]) && !live.contains(&apps[1]), "oldest runners are deleted");
    assert!(apps[2..].iter().all(|a| live.contains(a)));

    // A second pass has nothing left to do.
    let outcome = ctx
        .orchestrator
        .reap(Some(project_id), 3, 50)
        .await
        .unwrap();
    assert_eq!(outcome.reaped, 0);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_failed_deploy_deletes_app() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;
    let req = deploy_request(&ctx, &org, project_id, "weather").await;

    let platform = Arc::new(MockPlatform::failing_at(MockStep::AllocateIp));
    let orchestrator = RunnerOrchestrator::new(
        ctx.pool.clone(),
        platform.clone(),
        ctx.blobs.clone(),
        OrchestratorConfig::default(),
    );
    assert!(orchestrator.deploy(&req).await.is_err());

    assert_eq!(platform.apps().await.len(), 1, "the app was created");
    assert!(platform.live_apps().await.is_empty(), "and then deleted");

    let (status, reaped): (String, bool) = sqlx::query_as(
        "SELECT status, reaped_at IS NOT NULL FROM function_runners WHERE deployment_id = $1",
    )
    .bind(req.deployment_id)
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(status, "failed");
    assert!(reaped);

    let events = ctx.event_names(req.deployment_id).await;
    assert!(events.iter().any(|e| e == "log:error"), "{:?}", events);

    ctx.cleanup().await;
}

#[tokio::test]
async fn test_failed_app_creation_records_nothing() {
    skip_if_no_db!();
    let mut ctx = TestContext::new().await.expect("Failed to create context");
    let (org, project_id) = ctx.create_project("free").await;
    let req = deploy_request(&ctx, &org, project_id, "weather").await;

    let platform = Arc::new(MockPlatform::failing_at(MockStep::CreateApp));
    let orchestrator = RunnerOrchestrator::new(
        ctx.pool.clone(),
        platform.clone(),
        ctx.blobs.clone(),
        OrchestratorConfig::default(),
    );
    assert!(orchestrator.deploy(&req).await.is_err());
    assert!(platform.apps().await.is_empty());

    let rows: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM function_runners WHERE deployment_id = $1")
            .bind(req.deployment_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(rows, 0);

    ctx.cleanup().await;
}
