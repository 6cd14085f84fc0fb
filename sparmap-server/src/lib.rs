//! HTTP surface for sparmap.
//!
//! Routes: `/query` (create or reuse a session), `/heatmap` (PNG tile),
//! `/pos` (nearest-object lookup), `/load` (persist the geometry cache),
//! `/clearsession` (evict one or all sessions).

pub mod config;
pub mod error;
pub mod routes;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use routes::{router, AppState};
