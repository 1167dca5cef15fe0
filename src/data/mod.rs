//! Data layer module
//!
//! Handles all local state:
//! - SQLite outcome store (durable)
//! - Three-tier on-disk user cache (lookup / profile / relationship)

mod cache;
mod database;
mod models;

pub use cache::{Coverage, UserCache};
pub use database::{Database, FailureBreakdown, StoreStats};
pub use models::*;

#[cfg(test)]
mod database_test;
