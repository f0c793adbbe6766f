//! Run log endpoints: paged fetch and the streaming upgrade.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;

use crawlspace_engine::{Engine, LogStream, Run};

use crate::auth::RequestContext;
use crate::error::ApiResult;
use crate::routes::runs::load_visible_run;
use crate::routes::PageQuery;
use crate::server::AppState;
use crate::wire::{Data, LogEntryWire, LogPageWire};

/// How often the streaming task re-checks the run's status.
const STATUS_POLL: Duration = Duration::from_secs(1);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/actor-runs/:runId/logs", get(fetch_logs))
        .route("/actor-runs/:runId/logs/stream", get(stream_logs))
}

async fn fetch_logs(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Data<LogPageWire>>> {
    let run = load_visible_run(&state, &ctx, &run_id).await?;
    let total = state.engine.logs().len(&run.id).await? as u64;
    let items = state
        .engine
        .logs()
        .fetch(&run.id, page.offset as usize, page.limit as usize)
        .await?;
    Ok(Json(Data::new(LogPageWire {
        items: items.into_iter().map(LogEntryWire::from).collect(),
        total,
        offset: page.offset,
        limit: page.limit,
    })))
}

/// Streaming log subscription.
///
/// Browser contexts pass the credential as a `token=` query parameter since
/// WebSocket upgrades cannot carry an Authorization header from JS.
async fn stream_logs(
    State(state): State<Arc<AppState>>,
    ctx: RequestContext,
    Path(run_id): Path<String>,
    upgrade: WebSocketUpgrade,
) -> ApiResult<Response> {
    let run = load_visible_run(&state, &ctx, &run_id).await?;
    let stream = state.engine.logs().subscribe(&run.id).await?;
    let engine = Arc::clone(&state.engine);
    Ok(upgrade.on_upgrade(move |socket| pump_logs(socket, engine, run, stream)))
}

/// Forwards log entries until the client disconnects or the run finishes;
/// a finished run closes the socket with the terminal status as the reason.
async fn pump_logs(mut socket: WebSocket, engine: Arc<Engine>, run: Run, mut stream: LogStream) {
    let mut status_tick = tokio::time::interval(STATUS_POLL);

    loop {
        tokio::select! {
            entry = stream.next() => {
                let Some(entry) = entry else { break };
                let Ok(text) = serde_json::to_string(&LogEntryWire::from(entry)) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    // Client went away.
                    return;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
            _ = status_tick.tick() => {
                match engine.runs().get(&run.id).await {
                    Ok(current) if current.status.is_terminal() => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: axum::extract::ws::close_code::NORMAL,
                                reason: current.status.to_string().into(),
                            })))
                            .await;
                        return;
                    }
                    _ => {}
                }
            }
        }
    }
}
