//! HTTP route handlers for the `/v2` surface.

pub mod actors;
pub mod datasets;
pub mod key_value_stores;
pub mod logs;
pub mod request_queues;
pub mod runs;

use std::sync::Arc;

use axum::Router;
use serde::Deserialize;

use crate::server::AppState;

/// All authenticated `/v2` routes.
pub fn v2_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(actors::routes())
        .merge(runs::routes())
        .merge(logs::routes())
        .merge(datasets::routes())
        .merge(key_value_stores::routes())
        .merge(request_queues::routes())
}

/// Common `offset`/`limit` pagination query.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageQuery {
    /// Items to skip.
    #[serde(default)]
    pub offset: u64,
    /// Page size.
    #[serde(default = "default_limit")]
    pub limit: u64,
}

fn default_limit() -> u64 {
    100
}
