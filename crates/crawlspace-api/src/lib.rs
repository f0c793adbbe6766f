//! HTTP surface of the Crawlspace platform.
//!
//! Wire-compatible with the v2 scraping API: bearer-token auth, `{"data"}`
//! envelopes, camelCase shapes, and the storage/run/queue endpoint families.
//! All domain behavior lives in `crawlspace-engine`; this crate only
//! authenticates, translates shapes, and maps errors.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod server;
pub mod wire;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use server::{router, serve, AppState};
