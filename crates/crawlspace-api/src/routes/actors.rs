//! Actor CRUD and run creation.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;

use crawlspace_core::ActorId;
use crawlspace_engine::{Actor, CreateRunParams, MetaStore, RunOptions};

use crate::auth::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::routes::PageQuery;
use crate::server::AppState;
use crate::wire::{ActorUpsert, ActorWire, CreateRunBody, Data, RunWire};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/acts", post(create_actor).get(list_actors))
        .route(
            "/acts/:actorId",
            get(get_actor).put(update_actor).delete(delete_actor),
        )
        .route("/acts/:actorId/runs", post(create_run))
}

async fn load_owned_actor(
    state: &AppState,
    ctx: &RequestContext,
    actor_id: &str,
) -> ApiResult<Actor> {
    let id: ActorId = actor_id
        .parse()
        .map_err(|_| ApiError::not_found(format!("actor not found: {actor_id}")))?;
    let actor = state
        .engine
        .meta()
        .get_actor(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("actor not found: {actor_id}")))?;
    if actor.owner_id != ctx.principal.id && !ctx.principal.is_service() {
        return Err(ApiError::not_found(format!("actor not found: {actor_id}")));
    }
    Ok(actor)
}

fn options_from(body: Option<crate::wire::RunOptionsWire>) -> RunOptions {
    body.map_or_else(RunOptions::default, |options| RunOptions {
        image: options.image,
        memory_mbytes: options.memory_mbytes,
        timeout_secs: options.timeout_secs,
    })
}

async fn create_actor(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Json(body): Json<ActorUpsert>,
) -> ApiResult<(StatusCode, Json<Data<ActorWire>>)> {
    if body.name.trim().is_empty() {
        return Err(ApiError::validation("actor name must not be empty"));
    }
    let now = Utc::now();
    let actor = Actor {
        id: ActorId::generate(),
        owner_id: ctx.principal.id.clone(),
        name: body.name,
        title: body.title,
        description: body.description,
        default_run_options: options_from(body.default_run_options),
        created_at: now,
        modified_at: now,
    };
    state.engine.meta().insert_actor(&actor).await?;
    Ok((StatusCode::CREATED, Json(Data::new(actor.into()))))
}

async fn list_actors(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Data<Vec<ActorWire>>>> {
    let result = state
        .engine
        .meta()
        .list_actors(&ctx.principal.id, page.offset, page.limit)
        .await?;
    Ok(Json(Data::new(
        result.items.into_iter().map(ActorWire::from).collect(),
    )))
}

async fn get_actor(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(actor_id): Path<String>,
) -> ApiResult<Json<Data<ActorWire>>> {
    let actor = load_owned_actor(&state, &ctx, &actor_id).await?;
    Ok(Json(Data::new(actor.into())))
}

async fn update_actor(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(actor_id): Path<String>,
    Json(body): Json<ActorUpsert>,
) -> ApiResult<Json<Data<ActorWire>>> {
    let mut actor = load_owned_actor(&state, &ctx, &actor_id).await?;
    if body.name.trim().is_empty() {
        return Err(ApiError::validation("actor name must not be empty"));
    }
    actor.name = body.name;
    actor.title = body.title;
    actor.description = body.description;
    if let Some(options) = body.default_run_options {
        actor.default_run_options = options_from(Some(options));
    }
    actor.modified_at = Utc::now();
    state.engine.meta().update_actor(&actor).await?;
    Ok(Json(Data::new(actor.into())))
}

async fn delete_actor(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(actor_id): Path<String>,
) -> ApiResult<StatusCode> {
    let actor = load_owned_actor(&state, &ctx, &actor_id).await?;
    // Runs keep their actor_id; the reference is allowed to dangle.
    state.engine.meta().delete_actor(&actor.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_run(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(actor_id): Path<String>,
    Json(body): Json<CreateRunBody>,
) -> ApiResult<(StatusCode, Json<Data<RunWire>>)> {
    let actor = load_owned_actor(&state, &ctx, &actor_id).await?;
    let run = state
        .engine
        .runs()
        .create_run(
            &ctx.principal,
            &actor.id,
            CreateRunParams {
                input: body.input,
                timeout_secs: body.timeout,
                memory_mbytes: body.memory,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(Data::new(run.into()))))
}
