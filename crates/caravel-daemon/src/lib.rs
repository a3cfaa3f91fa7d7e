//! Caravel Daemon Library
//!
//! Core functionality for the caravel deploy daemon:
//! - Confidential-VM backend provisioning on a remote TEE control plane
//! - Build-and-deploy pipeline with a durable SQLite-backed work queue
//! - Git host OAuth integration for webhook-driven deploys
//! - Deploy configuration management (one active config per repository)

pub mod backend;
pub mod builds;
pub mod configs;
pub mod githost;
pub mod kms;
pub mod provider;
pub mod sites;
pub mod storage;
