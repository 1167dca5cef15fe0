//! Outbound HTTP layer
//!
//! No other module issues network I/O. `client` is the entry point; the
//! submodules cover session state, header construction, GraphQL wire
//! details, and rate-limit bookkeeping.

pub mod client;
pub mod graphql;
pub mod headers;
pub mod rate_limit;
pub mod session;

pub use client::{ApiClient, CallOutcome};
pub use session::SessionStore;
