//! Caravel Core Library
//!
//! Shared functionality for Caravel components:
//! - `SQLite` pool creation, shared `DatabaseError`, `define_database!`
//! - Tracing/logging initialization

pub mod db;
pub mod tracing_init;

pub use db::{DatabaseError, unix_timestamp};
