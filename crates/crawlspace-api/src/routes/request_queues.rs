//! Request queue endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use crawlspace_core::RequestId;
use crawlspace_engine::{NewRequest, RequestQueue};

use crate::auth::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;
use crate::wire::{
    AddRequestWire, BatchWire, CreateStorageBody, Data, LockedHeadWire, NewRequestWire,
    ProlongedLockWire, QueueHeadWire, RequestPatchWire, RequestQueueWire, RequestWire,
    UnprocessedWire,
};

/// Default and maximum sizes for head reads.
const DEFAULT_HEAD_LIMIT: u64 = 100;
const MAX_HEAD_LIMIT: u64 = 1000;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/request-queues", post(create_queue))
        .route(
            "/request-queues/:queueId",
            get(get_queue).delete(delete_queue),
        )
        .route("/request-queues/:queueId/head", get(get_head))
        .route("/request-queues/:queueId/head/lock", post(lock_head))
        .route("/request-queues/:queueId/requests", post(add_request))
        .route(
            "/request-queues/:queueId/requests/batch",
            post(add_requests_batch),
        )
        .route(
            "/request-queues/:queueId/requests/:requestId",
            get(get_request).put(update_request),
        )
        .route(
            "/request-queues/:queueId/requests/:requestId/lock",
            put(prolong_lock).delete(release_lock),
        )
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForefrontQuery {
    #[serde(default)]
    forefront: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeadQuery {
    #[serde(default = "default_head_limit")]
    limit: u64,
}

fn default_head_limit() -> u64 {
    DEFAULT_HEAD_LIMIT
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockHeadQuery {
    #[serde(default = "default_head_limit")]
    limit: u64,
    lock_secs: u64,
    client_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockOpQuery {
    client_key: String,
    #[serde(default)]
    lock_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientKeyQuery {
    #[serde(default)]
    client_key: Option<String>,
}

async fn resolve_queue(
    state: &AppState,
    ctx: &RequestContext,
    selector: &str,
    create_missing: bool,
) -> ApiResult<RequestQueue> {
    Ok(state
        .engine
        .queues()
        .resolve(&ctx.principal, selector, create_missing)
        .await?)
}

fn parse_request_id(raw: &str) -> ApiResult<RequestId> {
    raw.parse()
        .map_err(|_| ApiError::not_found(format!("request not found: {raw}")))
}

async fn create_queue(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Json(body): Json<CreateStorageBody>,
) -> ApiResult<(StatusCode, Json<Data<RequestQueueWire>>)> {
    let queue = state
        .engine
        .queues()
        .create(&ctx.principal.id, body.name)
        .await?;
    Ok((StatusCode::CREATED, Json(Data::new(queue.into()))))
}

async fn get_queue(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(queue_id): Path<String>,
) -> ApiResult<Json<Data<RequestQueueWire>>> {
    let queue = resolve_queue(&state, &ctx, &queue_id, false).await?;
    Ok(Json(Data::new(queue.into())))
}

async fn delete_queue(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(queue_id): Path<String>,
) -> ApiResult<StatusCode> {
    let queue = resolve_queue(&state, &ctx, &queue_id, false).await?;
    state.engine.queues().delete(&queue.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_head(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(queue_id): Path<String>,
    Query(query): Query<HeadQuery>,
) -> ApiResult<Json<Data<QueueHeadWire>>> {
    let queue = resolve_queue(&state, &ctx, &queue_id, false).await?;
    let limit = query.limit.min(MAX_HEAD_LIMIT);
    let items = state.engine.queues().get_head(&queue.id, limit).await?;
    Ok(Json(Data::new(QueueHeadWire {
        limit,
        items: items.into_iter().map(RequestWire::from).collect(),
    })))
}

async fn lock_head(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(queue_id): Path<String>,
    Query(query): Query<LockHeadQuery>,
) -> ApiResult<Json<Data<LockedHeadWire>>> {
    let queue = resolve_queue(&state, &ctx, &queue_id, false).await?;
    let acquired = state
        .engine
        .queues()
        .acquire_head(
            &queue.id,
            query.limit.min(MAX_HEAD_LIMIT),
            query.lock_secs,
            &query.client_key,
        )
        .await?;
    Ok(Json(Data::new(acquired.into())))
}

async fn add_request(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(queue_id): Path<String>,
    Query(query): Query<ForefrontQuery>,
    Json(body): Json<NewRequestWire>,
) -> ApiResult<(StatusCode, Json<Data<AddRequestWire>>)> {
    let queue = resolve_queue(&state, &ctx, &queue_id, true).await?;
    let outcome = state
        .engine
        .queues()
        .add_request(&queue.id, &NewRequest::from(body), query.forefront)
        .await?;
    Ok((StatusCode::CREATED, Json(Data::new(outcome.into()))))
}

async fn add_requests_batch(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(queue_id): Path<String>,
    Query(query): Query<ForefrontQuery>,
    Json(body): Json<Vec<NewRequestWire>>,
) -> ApiResult<(StatusCode, Json<Data<BatchWire>>)> {
    let queue = resolve_queue(&state, &ctx, &queue_id, true).await?;
    let requests: Vec<NewRequest> = body.into_iter().map(NewRequest::from).collect();
    let outcome = state
        .engine
        .queues()
        .add_requests_batch(&queue.id, &requests, query.forefront)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(Data::new(BatchWire {
            processed: outcome.processed.into_iter().map(AddRequestWire::from).collect(),
            unprocessed: outcome
                .unprocessed
                .into_iter()
                .map(UnprocessedWire::from)
                .collect(),
        })),
    ))
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path((queue_id, request_id)): Path<(String, String)>,
) -> ApiResult<Json<Data<RequestWire>>> {
    let queue = resolve_queue(&state, &ctx, &queue_id, false).await?;
    let request_id = parse_request_id(&request_id)?;
    let request = state
        .engine
        .queues()
        .get_request(&queue.id, &request_id)
        .await?;
    Ok(Json(Data::new(request.into())))
}

async fn update_request(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path((queue_id, request_id)): Path<(String, String)>,
    Query(query): Query<ClientKeyQuery>,
    Json(body): Json<RequestPatchWire>,
) -> ApiResult<Json<Data<RequestWire>>> {
    let queue = resolve_queue(&state, &ctx, &queue_id, false).await?;
    let request_id = parse_request_id(&request_id)?;
    let request = state
        .engine
        .queues()
        .update_request(
            &queue.id,
            &request_id,
            &body.into(),
            query.client_key.as_deref(),
        )
        .await?;
    Ok(Json(Data::new(request.into())))
}

async fn prolong_lock(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path((queue_id, request_id)): Path<(String, String)>,
    Query(query): Query<LockOpQuery>,
) -> ApiResult<Json<Data<ProlongedLockWire>>> {
    let queue = resolve_queue(&state, &ctx, &queue_id, false).await?;
    let request_id = parse_request_id(&request_id)?;
    let lock_secs = query
        .lock_secs
        .ok_or_else(|| ApiError::validation("lockSecs query parameter is required"))?;
    let lock_expires_at = state
        .engine
        .queues()
        .prolong_lock(&queue.id, &request_id, &query.client_key, lock_secs)
        .await?;
    Ok(Json(Data::new(ProlongedLockWire { lock_expires_at })))
}

async fn release_lock(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path((queue_id, request_id)): Path<(String, String)>,
    Query(query): Query<LockOpQuery>,
) -> ApiResult<StatusCode> {
    let queue = resolve_queue(&state, &ctx, &queue_id, false).await?;
    let request_id = parse_request_id(&request_id)?;
    state
        .engine
        .queues()
        .release_lock(&queue.id, &request_id, &query.client_key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
