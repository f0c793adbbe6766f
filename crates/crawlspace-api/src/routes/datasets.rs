//! Dataset endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::auth::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::routes::PageQuery;
use crate::server::AppState;
use crate::wire::{pagination_headers, CreateStorageBody, Data, DatasetWire};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/datasets", post(create_dataset))
        .route("/datasets/:datasetId", get(get_dataset).delete(delete_dataset))
        .route(
            "/datasets/:datasetId/items",
            post(push_items).get(list_items),
        )
}

async fn create_dataset(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Json(body): Json<CreateStorageBody>,
) -> ApiResult<(StatusCode, Json<Data<DatasetWire>>)> {
    let dataset = state
        .engine
        .datasets()
        .create(&ctx.principal.id, body.name)
        .await?;
    Ok((StatusCode::CREATED, Json(Data::new(dataset.into()))))
}

async fn get_dataset(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(dataset_id): Path<String>,
) -> ApiResult<Json<Data<DatasetWire>>> {
    let dataset = state
        .engine
        .datasets()
        .resolve(&ctx.principal, &dataset_id, false)
        .await?;
    Ok(Json(Data::new(dataset.into())))
}

async fn delete_dataset(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(dataset_id): Path<String>,
) -> ApiResult<StatusCode> {
    let dataset = state
        .engine
        .datasets()
        .resolve(&ctx.principal, &dataset_id, false)
        .await?;
    state.engine.datasets().delete(&dataset.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Accepts a single item or an array of items; either way the push is one
/// atomic batch.
async fn push_items(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(dataset_id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<Data<DatasetWire>>)> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        item @ serde_json::Value::Object(_) => vec![item],
        _ => {
            return Err(ApiError::validation(
                "dataset items must be an object or an array of objects",
            ))
        }
    };
    let dataset = state
        .engine
        .datasets()
        .resolve(&ctx.principal, &dataset_id, true)
        .await?;
    let dataset = state.engine.datasets().push_items(&dataset.id, &items).await?;
    Ok((StatusCode::CREATED, Json(Data::new(dataset.into()))))
}

async fn list_items(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(dataset_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<(
    [(&'static str, String); 3],
    Json<Data<Vec<serde_json::Value>>>,
)> {
    let dataset = state
        .engine
        .datasets()
        .resolve(&ctx.principal, &dataset_id, false)
        .await?;
    let (items, total) = state
        .engine
        .datasets()
        .list_items(&dataset.id, page.offset, page.limit)
        .await?;
    Ok((
        [
            (pagination_headers::TOTAL, total.to_string()),
            (pagination_headers::OFFSET, page.offset.to_string()),
            (pagination_headers::LIMIT, page.limit.to_string()),
        ],
        Json(Data::new(items)),
    ))
}
