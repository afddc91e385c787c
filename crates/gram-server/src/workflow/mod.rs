// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Durable deployment workflows.
//!
//! Creating a deployment enqueues a row in `deployment_workflows` in the
//! same transaction. The [`WorkflowWorker`] claims due rows and runs the
//! [`DeploymentWorkflow`]:
//!
//! ```text
//! validate ──► process ──► provision ──► deploy runners ──► complete
//!  (tier)    (extractors)  (secrets)     (preflight, fly)
//! ```
//!
//! Retryable failures are rescheduled with exponential backoff; permanent
//! failures and exhausted retries fail the deployment with a `log:error`
//! event.

mod activities;
mod queue;
mod worker;

pub use activities::{DeploymentWorkflow, WorkflowSettings};
pub use queue::{DEFAULT_MAX_ATTEMPTS, WorkflowJob, WorkflowQueue, backoff, enqueue};
pub use worker::{WorkflowWorker, WorkflowWorkerConfig};
