//! Key-value store endpoints.
//!
//! Record GET/PUT are raw-body pass-through with the declared content type;
//! a missing key answers 204 (distinguished from a missing store, which is
//! 404).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::RequestContext;
use crate::error::ApiResult;
use crate::server::AppState;
use crate::wire::{CreateStorageBody, Data, KeyInfoWire, KeyListingWire, KeyValueStoreWire};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/key-value-stores", post(create_store))
        .route(
            "/key-value-stores/:storeId",
            get(get_store).delete(delete_store),
        )
        .route("/key-value-stores/:storeId/keys", get(list_keys))
        .route(
            "/key-value-stores/:storeId/records/:key",
            get(get_record).put(put_record).delete(delete_record),
        )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListKeysQuery {
    #[serde(default = "default_key_limit")]
    limit: u64,
    #[serde(default)]
    exclusive_start_key: Option<String>,
}

fn default_key_limit() -> u64 {
    1000
}

async fn create_store(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Json(body): Json<CreateStorageBody>,
) -> ApiResult<(StatusCode, Json<Data<KeyValueStoreWire>>)> {
    let store = state
        .engine
        .kv()
        .create(&ctx.principal.id, body.name)
        .await?;
    Ok((StatusCode::CREATED, Json(Data::new(store.into()))))
}

async fn get_store(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(store_id): Path<String>,
) -> ApiResult<Json<Data<KeyValueStoreWire>>> {
    let store = state
        .engine
        .kv()
        .resolve(&ctx.principal, &store_id, false)
        .await?;
    Ok(Json(Data::new(store.into())))
}

async fn delete_store(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(store_id): Path<String>,
) -> ApiResult<StatusCode> {
    let store = state
        .engine
        .kv()
        .resolve(&ctx.principal, &store_id, false)
        .await?;
    state.engine.kv().delete_store(&store.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_keys(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(store_id): Path<String>,
    Query(query): Query<ListKeysQuery>,
) -> ApiResult<Json<Data<KeyListingWire>>> {
    let store = state
        .engine
        .kv()
        .resolve(&ctx.principal, &store_id, false)
        .await?;
    let listing = state
        .engine
        .kv()
        .list_keys(&store.id, query.limit, query.exclusive_start_key.as_deref())
        .await?;
    Ok(Json(Data::new(KeyListingWire {
        items: listing.items.into_iter().map(KeyInfoWire::from).collect(),
        is_truncated: listing.is_truncated,
        next_exclusive_start_key: listing.next_exclusive_start_key,
    })))
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path((store_id, key)): Path<(String, String)>,
) -> ApiResult<Response> {
    let store = state
        .engine
        .kv()
        .resolve(&ctx.principal, &store_id, false)
        .await?;
    match state.engine.kv().get(&store.id, &key).await? {
        Some(record) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, record.content_type)],
            record.body,
        )
            .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn put_record(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path((store_id, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<StatusCode> {
    let store = state
        .engine
        .kv()
        .resolve(&ctx.principal, &store_id, true)
        .await?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream");
    state
        .engine
        .kv()
        .put(&store.id, &key, body, content_type)
        .await?;
    Ok(StatusCode::CREATED)
}

async fn delete_record(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path((store_id, key)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let store = state
        .engine
        .kv()
        .resolve(&ctx.principal, &store_id, false)
        .await?;
    state.engine.kv().delete(&store.id, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}
