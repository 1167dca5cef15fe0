//! blockhaus - bulk account blocker for cookie-authenticated sessions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      CLI (clap, main.rs)                    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                           │
//! │  - Processing manager (batch pipeline, auto-retry)          │
//! │  - Statistics reporter                                      │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                          │
//! ┌────────────────────────────┐  ┌─────────────────────────────┐
//! │         API Layer          │  │         Data Layer          │
//! │  - GraphQL user reads      │  │  - SQLite outcome store     │
//! │  - REST block call         │  │  - Three-tier file cache    │
//! │  - Rate limits, recovery   │  │                             │
//! └────────────────────────────┘  └─────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: all outbound HTTP (client, session, headers, rate limits)
//! - `service`: processing manager and statistics reporter
//! - `data`: outcome store, user cache, domain models
//! - `retry`: pure failure classifier and backoff policy
//! - `config`: configuration management
//! - `error`: error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod retry;
pub mod service;
pub mod version;

use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, SessionStore};
use crate::data::{Database, UserCache};
use crate::error::Result;
use crate::service::Manager;

/// Explicit dependency bundle for one run
///
/// Constructed once at startup and threaded through the service layer;
/// there is no package-level mutable state.
pub struct AppContext {
    pub config: config::AppConfig,
    pub db: Database,
    pub client: ApiClient,
    pub cancel: CancellationToken,
}

impl AppContext {
    /// Open the store, load the session, and build the API client.
    ///
    /// Fails fast on an unreadable cookie jar, an unwritable persistence
    /// path, or an uncreatable cache directory.
    pub async fn new(config: config::AppConfig, cancel: CancellationToken) -> Result<Self> {
        let db = Database::open(&config.paths.database).await?;
        let session = SessionStore::load(&config.paths.cookies)?;
        let cache = UserCache::open(&config.paths.cache_dir, &config.cache)?;
        let client = ApiClient::new(
            &config.api,
            &config.throttle,
            session,
            cache,
            cancel.clone(),
        )?;

        Ok(Self {
            config,
            db,
            client,
            cancel,
        })
    }

    /// Processing manager bound to this context.
    pub fn manager(&self) -> Manager<'_> {
        Manager::new(&self.db, &self.client, self.cancel.clone())
    }
}
