// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Gram Server - Deployment Pipeline
//!
//! This crate ingests API descriptions and functions bundles, turns them into
//! callable tools, and deploys function runners.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Dashboard / CLI                              │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │ JSON over HTTP (/rpc/*)
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                      gram-server (This Crate)                         │
//! │  ┌───────────┐  ┌─────────────┐  ┌────────────┐  ┌───────────────┐   │
//! │  │  Asset    │  │ Deployments │  │  Workflow  │  │    Runner     │   │
//! │  │ Registry  │  │  + events   │  │   Worker   │  │ Orchestrator  │   │
//! │  └───────────┘  └─────────────┘  └────────────┘  └───────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │                 │               │                  │
//!        ▼                 ▼               ▼                  ▼
//! ┌─────────────┐  ┌──────────────────────────────┐  ┌────────────────┐
//! │ Blob store  │  │          PostgreSQL          │  │  Fly.io apps   │
//! │ file/s3/gs  │  │ assets, deployments, tools,  │  │ (one per       │
//! └─────────────┘  │ workflows, runners           │  │  function)     │
//!                  └──────────────────────────────┘  └────────────────┘
//! ```
//!
//! # Deployment Lifecycle
//!
//! 1. Assets are uploaded once and deduplicated by SHA-256 per project.
//! 2. `deployments.create` validates attachments, commits the deployment in
//!    `pending` and enqueues a durable workflow in the same transaction.
//! 3. The workflow worker runs the OpenAPI and functions extractors with
//!    bounded concurrency, provisions function secrets, and deploys one
//!    runner app per function.
//! 4. The deployment ends `completed` or `failed`; its event log explains
//!    every step.
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `GRAM_DATABASE_URL` | Yes | - | PostgreSQL connection string |
//! | `GRAM_HTTP_PORT` | No | `8080` | HTTP port |
//! | `GRAM_SERVER_URL` | No | `http://localhost:8080` | Public base URL |
//! | `GRAM_JWT_SECRET` | Yes | - | Secret for signed asset URLs |
//! | `GRAM_ENCRYPTION_KEY` | Yes | - | Base64 AES-256 key for function secrets |
//! | `GRAM_ASSETS_URI` | No | `file://.data/assets` | Blob store location |
//! | `GRAM_FUNCTIONS_PROVIDER` | No | `mock` | `mock` or `fly` |
//!
//! # Modules
//!
//! - [`assets`]: Content-addressed asset registry
//! - [`deployments`]: Deployment records, status machine and event log
//! - [`openapi`]: OpenAPI v3 tool extraction
//! - [`functions`]: Functions bundles, manifests and runner credentials
//! - [`runner`]: Runner platforms and orchestration
//! - [`workflow`]: Durable deployment workflows
//! - [`server`]: HTTP surface

#![deny(missing_docs)]

/// Database migrations for gram-server.
///
/// ```ignore
/// use gram_server::migrations;
///
/// let pool = PgPool::connect(&database_url).await?;
/// migrations::run(&pool).await?;
/// ```
pub mod migrations;

/// Server configuration loaded from environment variables.
pub mod config;

/// Error types and the error kind taxonomy.
pub mod error;

/// Blob storage backends (local filesystem, S3, GCS).
pub mod blob_store;

/// AES-GCM sealing of secrets at rest.
pub mod encryption;

/// Signed, short-lived asset tokens.
pub mod tokens;

/// Tool, resource and runner URNs.
pub mod urn;

/// Organizations, projects and tiers.
pub mod tenancy;

/// Prometheus metrics.
pub mod metrics;

/// Content-addressed asset registry.
pub mod assets;

/// Deployment records and event log.
pub mod deployments;

/// OpenAPI v3 tool extraction.
pub mod openapi;

/// Functions bundles and runner credentials.
pub mod functions;

/// Runner platforms and the deploy/reap orchestrator.
pub mod runner;

/// Background worker that reaps superseded runners.
pub mod runner_reaper;

/// Durable deployment workflows.
pub mod workflow;

/// HTTP server.
pub mod server;

/// Embeddable runtime wiring the server and workers together.
pub mod runtime;

pub use config::Config;
pub use error::Error;
