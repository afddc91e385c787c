// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function runner platforms.
//!
//! A runner is a provider app serving one function of one deployment. The
//! [`RunnerPlatform`] trait abstracts the hosting provider; the
//! [`RunnerOrchestrator`] drives deploys and reaps against it and keeps the
//! `function_runners` table in sync.
//!
//! | Provider | Implementation |
//! |----------|----------------|
//! | `fly` | [`FlyPlatform`], Fly.io Machines |
//! | `local` | [`MockPlatform`], in-memory |

pub mod fly;
pub mod mock;
mod orchestrator;
mod store;
mod traits;

use std::sync::Arc;

pub use fly::FlyPlatform;
pub use mock::MockPlatform;
pub use orchestrator::{
    BUNDLE_GUEST_PATH, DeployRequest, DeployResult, FUNCTION_AUTH_SECRET_VAR, MAX_BUNDLE_BYTES,
    OrchestratorConfig, ReapOutcome, RunnerAsset, RunnerOrchestrator,
};
pub use store::{NewRunner, RunnerRecord, RunnerStatus, RunnerStore};
pub use traits::*;

use crate::config::{FunctionsConfig, FunctionsProvider};

/// Build the platform selected by `config`.
pub fn platform_from_config(config: &FunctionsConfig) -> Result<Arc<dyn RunnerPlatform>> {
    match config.provider {
        FunctionsProvider::Mock => Ok(Arc::new(MockPlatform::new())),
        FunctionsProvider::Fly => {
            let fly = config.fly.as_ref().ok_or_else(|| {
                RunnerError::Invalid("fly provider selected without fly settings".to_string())
            })?;
            Ok(Arc::new(FlyPlatform::new(fly)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_from_config() {
        let platform = platform_from_config(&FunctionsConfig::default()).unwrap();
        assert_eq!(platform.provider(), "local");

        let config = FunctionsConfig {
            provider: FunctionsProvider::Fly,
            ..Default::default()
        };
        assert!(platform_from_config(&config).is_err());
    }
}
