// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fly.io runner platform.
//!
//! Apps, secrets and machines go through the Machines REST API; shared IP
//! allocation goes through the platform GraphQL API. Both use the same
//! bearer token.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use super::traits::*;
use crate::config::FlyConfig;
use crate::urn::RunnerKind;

/// Longest provider error body kept in an error.
const MAX_ERROR_BODY: usize = 500;

/// Fly.io Machines client.
pub struct FlyPlatform {
    client: Client,
    api_token: String,
    api_base: String,
    machines_api_base: String,
}

impl FlyPlatform {
    /// Create a client from configuration.
    pub fn new(config: &FlyConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("gram-server/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            api_token: config.api_token.clone(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            machines_api_base: config.machines_api_base.trim_end_matches('/').to_string(),
        })
    }

    fn machines_url(&self, path: &str) -> String {
        format!("{}/v1{}", self.machines_api_base, path)
    }

    async fn send_json(&self, method: reqwest::Method, url: String, body: Option<Value>) -> Result<Response> {
        let mut req = self
            .client
            .request(method, &url)
            .bearer_auth(&self.api_token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let res = req.send().await?;
        debug!(url = %url, status = %res.status(), "Fly API call");
        Ok(res)
    }
}

async fn check(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let mut message = res.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    Err(RunnerError::Api {
        status: status.as_u16(),
        message,
    })
}

fn machine_config(spec: &MachineSpec) -> Value {
    let files: Vec<Value> = spec
        .files
        .iter()
        .map(|f| json!({"guest_path": f.guest_path, "raw_value": f.raw_value, "mode": f.mode}))
        .collect();
    let autostop = if spec.autostop { "stop" } else { "off" };

    json!({
        "image": spec.image,
        "env": spec.env,
        "metadata": spec.metadata,
        "files": files,
        "guest": {
            "cpu_kind": "shared",
            "cpus": spec.cpus,
            "memory_mb": spec.memory_mb,
        },
        "services": [{
            "protocol": "tcp",
            "internal_port": spec.internal_port,
            "autostop": autostop,
            "autostart": true,
            "min_machines_running": 0,
            "ports": [{"port": 443, "handlers": ["tls"]}],
            "checks": [{
                "type": "http",
                "protocol": "http",
                "method": "GET",
                "path": spec.check.path,
                "interval": format!("{}s", spec.check.interval.as_secs()),
                "timeout": format!("{}s", spec.check.timeout.as_secs()),
                "grace_period": "5s",
            }],
            "concurrency": {"type": "connections", "soft_limit": 20},
        }],
        "restart": {"policy": "on-failure", "max_retries": spec.max_restarts},
    })
}

#[async_trait]
impl RunnerPlatform for FlyPlatform {
    fn provider(&self) -> &'static str {
        "fly"
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Fly
    }

    fn public_url(&self, app_name: &str) -> String {
        format!("https://{}.fly.dev", app_name)
    }

    async fn create_app(&self, org_slug: &str, _region: &str, network: &str) -> Result<String> {
        let app_name = format!("gram-fn-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let res = self
            .send_json(
                reqwest::Method::POST,
                self.machines_url("/apps"),
                Some(json!({"app_name": app_name, "org_slug": org_slug, "network": network})),
            )
            .await?;
        check(res).await?;
        info!(app_name = %app_name, org_slug = %org_slug, "Created Fly app");
        Ok(app_name)
    }

    async fn set_secret(&self, app_name: &str, key: &str, value: &str) -> Result<u64> {
        #[derive(Deserialize)]
        struct SetSecretResponse {
            version: Option<u64>,
        }

        let res = self
            .send_json(
                reqwest::Method::POST,
                self.machines_url(&format!("/apps/{}/secrets/{}", app_name, key)),
                Some(json!({"value": value})),
            )
            .await?;
        let body: SetSecretResponse = check(res).await?.json().await?;
        body.version
            .ok_or_else(|| RunnerError::Other(format!("{}: no version from set secret response", key)))
    }

    async fn launch_machine(
        &self,
        app_name: &str,
        region: &str,
        spec: &MachineSpec,
        min_secrets_version: Option<u64>,
    ) -> Result<String> {
        #[derive(Deserialize)]
        struct Machine {
            id: String,
        }

        let mut body = json!({
            "region": region,
            "config": machine_config(spec),
        });
        if let Some(version) = min_secrets_version {
            body["min_secrets_version"] = json!(version);
        }

        let res = self
            .send_json(
                reqwest::Method::POST,
                self.machines_url(&format!("/apps/{}/machines", app_name)),
                Some(body),
            )
            .await?;
        let machine: Machine = check(res).await?.json().await?;
        Ok(machine.id)
    }

    async fn wait_started(&self, app_name: &str, machine_id: &str, timeout: Duration) -> Result<()> {
        let url = self.machines_url(&format!(
            "/apps/{}/machines/{}/wait?state=started&timeout={}",
            app_name,
            machine_id,
            timeout.as_secs()
        ));
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .timeout(timeout + Duration::from_secs(5))
            .send()
            .await?;
        match res.status() {
            StatusCode::REQUEST_TIMEOUT => Err(RunnerError::Timeout(format!(
                "machine {} did not start within {}s",
                machine_id,
                timeout.as_secs()
            ))),
            _ => check(res).await.map(|_| ()),
        }
    }

    async fn allocate_shared_ip(&self, app_name: &str) -> Result<()> {
        let query = r#"
            mutation($input: AllocateIPAddressInput!) {
                allocateIpAddress(input: $input) { app { name } }
            }
        "#;
        let res = self
            .send_json(
                reqwest::Method::POST,
                format!("{}/graphql", self.api_base),
                Some(json!({
                    "query": query,
                    "variables": {"input": {"appId": app_name, "type": "shared_v4"}},
                })),
            )
            .await?;
        let body: Value = check(res).await?.json().await?;
        if let Some(errors) = body.get("errors").and_then(Value::as_array).filter(|e| !e.is_empty()) {
            return Err(RunnerError::Other(format!(
                "failed to allocate shared IP: {}",
                Value::Array(errors.clone())
            )));
        }
        Ok(())
    }

    async fn delete_app(&self, app_name: &str) -> Result<bool> {
        let res = self
            .send_json(
                reqwest::Method::DELETE,
                self.machines_url(&format!("/apps/{}", app_name)),
                None,
            )
            .await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(res).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn platform(server: &MockServer) -> FlyPlatform {
        FlyPlatform::new(&FlyConfig {
            api_token: "fly-token".to_string(),
            org: "gram".to_string(),
            region: "iad".to_string(),
            api_base: server.uri(),
            machines_api_base: server.uri(),
        })
        .unwrap()
    }

    fn spec() -> MachineSpec {
        MachineSpec {
            image: "ghcr.io/example/runner:1".to_string(),
            env: BTreeMap::from([("GRAM_PROJECT_ID".to_string(), "p".to_string())]),
            metadata: BTreeMap::new(),
            files: vec![MachineFile {
                guest_path: "/data/code.zip".to_string(),
                raw_value: "UEsFBg==".to_string(),
                mode: 0o444,
            }],
            internal_port: 8888,
            check: HealthCheck {
                path: "/healthz".to_string(),
                interval: Duration::from_secs(30),
                timeout: Duration::from_secs(5),
            },
            autostop: true,
            max_restarts: 5,
            cpus: 2,
            memory_mb: 512,
        }
    }

    #[tokio::test]
    async fn test_create_app_sends_org_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps"))
            .and(header("Authorization", "Bearer fly-token"))
            .and(body_partial_json(json!({"org_slug": "gram", "network": "gram-fn-x"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "a1"})))
            .expect(1)
            .mount(&server)
            .await;

        let name = platform(&server)
            .create_app("gram", "iad", "gram-fn-x")
            .await
            .unwrap();
        assert!(name.starts_with("gram-fn-"));
    }

    #[tokio::test]
    async fn test_set_secret_returns_version() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps/app1/secrets/GRAM_FUNCTION_AUTH_SECRET"))
            .and(body_partial_json(json!({"value": "c2VjcmV0"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": 7})))
            .mount(&server)
            .await;

        let version = platform(&server)
            .set_secret("app1", "GRAM_FUNCTION_AUTH_SECRET", "c2VjcmV0")
            .await
            .unwrap();
        assert_eq!(version, 7);
    }

    #[tokio::test]
    async fn test_launch_machine_sends_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps/app1/machines"))
            .and(body_partial_json(json!({
                "region": "iad",
                "min_secrets_version": 7,
                "config": {
                    "image": "ghcr.io/example/runner:1",
                    "restart": {"policy": "on-failure", "max_retries": 5}
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": "m-1"})))
            .mount(&server)
            .await;

        let id = platform(&server)
            .launch_machine("app1", "iad", &spec(), Some(7))
            .await
            .unwrap();
        assert_eq!(id, "m-1");
    }

    #[tokio::test]
    async fn test_wait_timeout_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/apps/app1/machines/m-1/wait"))
            .and(query_param("state", "started"))
            .respond_with(ResponseTemplate::new(408))
            .mount(&server)
            .await;

        let err = platform(&server)
            .wait_started("app1", "m-1", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_delete_missing_app() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v1/apps/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/v1/apps/here"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let fly = platform(&server);
        assert!(!fly.delete_app("gone").await.unwrap());
        assert!(fly.delete_app("here").await.unwrap());
    }

    #[tokio::test]
    async fn test_api_error_is_truncated() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/apps"))
            .respond_with(ResponseTemplate::new(422).set_body_string("x".repeat(2000)))
            .mount(&server)
            .await;

        let err = platform(&server)
            .create_app("gram", "iad", "net")
            .await
            .unwrap_err();
        match err {
            RunnerError::Api { status, message } => {
                assert_eq!(status, 422);
                assert_eq!(message.len(), MAX_ERROR_BODY);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_allocate_shared_ip_graphql_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"errors": [{"message": "app not found"}]})),
            )
            .mount(&server)
            .await;

        assert!(platform(&server).allocate_shared_ip("app1").await.is_err());
    }
}
