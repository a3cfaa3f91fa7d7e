//! Persistence layer: backends, builds, deploy configs, credentials, and the
//! durable build-job queue, all on one `SQLite` database.

mod db;
mod models;
mod queries_backends;
mod queries_builds;
mod queries_configs;
mod queue;

pub use db::{Database, DatabaseError};
pub use models::{
    BackendRow, BuildJobRow, BuildRow, BuildStatus, DeployConfigRow, NewDeployConfig,
    ProjectCredentialRow,
};
