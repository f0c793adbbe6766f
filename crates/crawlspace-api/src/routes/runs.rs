//! Run read and lifecycle endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use crawlspace_core::RunId;
use crawlspace_engine::Run;

use crate::auth::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::routes::PageQuery;
use crate::server::AppState;
use crate::wire::{Data, RunWire, UpdateRunBody};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/actor-runs", get(list_runs))
        .route("/actor-runs/:runId", get(get_run).put(update_run))
        .route("/actor-runs/:runId/abort", post(abort_run))
        .route("/actor-runs/:runId/resurrect", post(resurrect_run))
}

pub(crate) async fn load_visible_run(
    state: &AppState,
    ctx: &RequestContext,
    run_id: &str,
) -> ApiResult<Run> {
    let id: RunId = run_id
        .parse()
        .map_err(|_| ApiError::not_found(format!("run not found: {run_id}")))?;
    let run = state.engine.runs().get(&id).await?;
    let visible = run.principal_id == ctx.principal.id
        || ctx.principal.is_service()
        || ctx.principal.may_drive_run(&run.id);
    if !visible {
        return Err(ApiError::not_found(format!("run not found: {run_id}")));
    }
    Ok(run)
}

async fn list_runs(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Data<Vec<RunWire>>>> {
    let result = state
        .engine
        .runs()
        .list(&ctx.principal.id, page.offset, page.limit)
        .await?;
    Ok(Json(Data::new(
        result.items.into_iter().map(RunWire::from).collect(),
    )))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Data<RunWire>>> {
    let run = load_visible_run(&state, &ctx, &run_id).await?;
    Ok(Json(Data::new(run.into())))
}

/// Trusted status update; reserved for the runtime driver (per-run tokens)
/// and service principals.
async fn update_run(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
    Json(body): Json<UpdateRunBody>,
) -> ApiResult<Json<Data<RunWire>>> {
    let run = load_visible_run(&state, &ctx, &run_id).await?;
    if !ctx.principal.may_drive_run(&run.id) {
        return Err(ApiError::unauthorized(
            "status updates require a run token or service credentials",
        ));
    }
    let run = state
        .engine
        .runs()
        .update_status(&run.id, body.status, body.status_message, body.exit_code)
        .await?;
    Ok(Json(Data::new(run.into())))
}

async fn abort_run(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Data<RunWire>>> {
    let run = load_visible_run(&state, &ctx, &run_id).await?;
    let run = state.engine.runs().abort_run(&run.id).await?;
    Ok(Json(Data::new(run.into())))
}

async fn resurrect_run(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
) -> ApiResult<Json<Data<RunWire>>> {
    let run = load_visible_run(&state, &ctx, &run_id).await?;
    let run = state.engine.runs().resurrect_run(&run.id).await?;
    Ok(Json(Data::new(run.into())))
}
