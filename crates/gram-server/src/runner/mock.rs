// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runner platform for development and tests.
//!
//! Records every call in memory and can be told to fail at a given step.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::traits::*;
use crate::urn::RunnerKind;

/// Platform call that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockStep {
    /// `create_app`
    CreateApp,
    /// `set_secret`
    SetSecret,
    /// `launch_machine`
    Launch,
    /// `wait_started`
    Wait,
    /// `allocate_shared_ip`
    AllocateIp,
    /// `delete_app`
    Delete,
}

/// State of one mock app.
#[derive(Debug, Clone, Default)]
pub struct MockApp {
    /// Organization the app was created in
    pub org_slug: String,
    /// Secrets set on the app
    pub secrets: HashMap<String, String>,
    /// Launched machine IDs
    pub machines: Vec<String>,
    /// Whether a shared IP was allocated
    pub shared_ip: bool,
    /// Whether the app was deleted
    pub deleted: bool,
}

/// Mock platform for testing.
pub struct MockPlatform {
    apps: Arc<Mutex<HashMap<String, MockApp>>>,
    counter: AtomicU64,
    fail_at: Option<MockStep>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// Create a mock platform where every call succeeds.
    pub fn new() -> Self {
        Self {
            apps: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            fail_at: None,
        }
    }

    /// Create a mock platform that fails at `step`.
    pub fn failing_at(step: MockStep) -> Self {
        Self {
            fail_at: Some(step),
            ..Self::new()
        }
    }

    /// Snapshot of all apps ever created.
    pub async fn apps(&self) -> HashMap<String, MockApp> {
        self.apps.lock().await.clone()
    }

    /// Names of apps that are not deleted.
    pub async fn live_apps(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .apps
            .lock()
            .await
            .iter()
            .filter(|(_, app)| !app.deleted)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn check(&self, step: MockStep) -> Result<()> {
        match self.fail_at {
            Some(s) if s == step => Err(RunnerError::Api {
                status: 500,
                message: format!("mock failure at {:?}", step),
            }),
            _ => Ok(()),
        }
    }

    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl RunnerPlatform for MockPlatform {
    fn provider(&self) -> &'static str {
        "local"
    }

    fn kind(&self) -> RunnerKind {
        RunnerKind::Local
    }

    fn public_url(&self, app_name: &str) -> String {
        format!("http://{}.localhost", app_name)
    }

    async fn create_app(&self, org_slug: &str, _region: &str, _network: &str) -> Result<String> {
        self.check(MockStep::CreateApp)?;
        let name = format!("mock-app-{}", self.next_id());
        self.apps.lock().await.insert(
            name.clone(),
            MockApp {
                org_slug: org_slug.to_string(),
                ..Default::default()
            },
        );
        Ok(name)
    }

    async fn set_secret(&self, app_name: &str, key: &str, value: &str) -> Result<u64> {
        self.check(MockStep::SetSecret)?;
        let mut apps = self.apps.lock().await;
        let app = apps
            .get_mut(app_name)
            .ok_or_else(|| RunnerError::Other(format!("unknown app {}", app_name)))?;
        app.secrets.insert(key.to_string(), value.to_string());
        Ok(app.secrets.len() as u64)
    }

    async fn launch_machine(
        &self,
        app_name: &str,
        _region: &str,
        _spec: &MachineSpec,
        _min_secrets_version: Option<u64>,
    ) -> Result<String> {
        self.check(MockStep::Launch)?;
        let id = format!("m-{}", self.next_id());
        let mut apps = self.apps.lock().await;
        let app = apps
            .get_mut(app_name)
            .ok_or_else(|| RunnerError::Other(format!("unknown app {}", app_name)))?;
        app.machines.push(id.clone());
        Ok(id)
    }

    async fn wait_started(&self, _app_name: &str, machine_id: &str, timeout: Duration) -> Result<()> {
        if self.fail_at == Some(MockStep::Wait) {
            return Err(RunnerError::Timeout(format!(
                "machine {} did not start within {}s",
                machine_id,
                timeout.as_secs()
            )));
        }
        Ok(())
    }

    async fn allocate_shared_ip(&self, app_name: &str) -> Result<()> {
        self.check(MockStep::AllocateIp)?;
        if let Some(app) = self.apps.lock().await.get_mut(app_name) {
            app.shared_ip = true;
        }
        Ok(())
    }

    async fn delete_app(&self, app_name: &str) -> Result<bool> {
        self.check(MockStep::Delete)?;
        match self.apps.lock().await.get_mut(app_name) {
            Some(app) if !app.deleted => {
                app.deleted = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let platform = MockPlatform::new();
        let app = platform.create_app("org", "iad", "net").await.unwrap();
        platform.set_secret(&app, "K", "V").await.unwrap();

        let apps = platform.apps().await;
        assert_eq!(apps[&app].secrets["K"], "V");
        assert_eq!(platform.live_apps().await, vec![app.clone()]);

        assert!(platform.delete_app(&app).await.unwrap());
        assert!(!platform.delete_app(&app).await.unwrap());
        assert!(platform.live_apps().await.is_empty());
    }

    #[tokio::test]
    async fn test_failing_step() {
        let platform = MockPlatform::failing_at(MockStep::SetSecret);
        let app = platform.create_app("org", "iad", "net").await.unwrap();
        assert!(platform.set_secret(&app, "K", "V").await.is_err());

        let platform = MockPlatform::failing_at(MockStep::Wait);
        let err = platform
            .wait_started("a", "m", Duration::from_secs(30))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Timeout(_)));
    }
}
