//! Server-sent-events surface for task topics, plus the snapshot endpoints a
//! reconnecting subscriber needs (task record, log buffer, chat history).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::stream::Stream;
use tracing::debug;
use uuid::Uuid;

use tp_core::buffers::{HistoryEvent, TaskBuffers};
use tp_core::task_store::TaskStore;
use tp_core::types::{validate_task_id, AgentLogEntry, Task};

use crate::event_bus::EventBus;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<TaskStore>,
    pub buffers: Arc<TaskBuffers>,
    pub bus: EventBus,
}

impl ApiState {
    pub fn new(store: Arc<TaskStore>, buffers: Arc<TaskBuffers>, bus: EventBus) -> Self {
        Self {
            store,
            buffers,
            bus,
        }
    }
}

/// Routes consumed by external event-stream subscribers.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/events", get(task_events))
        .route("/api/tasks/{id}/logs", get(task_logs))
        .route("/api/tasks/{id}/history", get(task_history))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn parse_id(raw: &str) -> Result<Uuid, (StatusCode, String)> {
    validate_task_id(raw).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Task>, (StatusCode, String)> {
    let id = parse_id(&id)?;
    let task = state
        .store
        .get_task(id)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or((StatusCode::NOT_FOUND, format!("task not found: {id}")))?;
    Ok(Json(task))
}

async fn task_events(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let id = parse_id(&id)?;
    debug!(task_id = %id, "event-stream subscriber attached");
    let subscription = state.bus.subscribe(id);

    let stream = futures_util::stream::unfold(subscription, |mut sub| async move {
        let event = sub.recv().await?;
        let sse = Event::default()
            .event(event.kind())
            .json_data(&event)
            .ok()?;
        Some((Ok(sse), sub))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn task_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<AgentLogEntry>>, (StatusCode, String)> {
    let id = parse_id(&id)?;
    Ok(Json(state.buffers.logs(id)))
}

async fn task_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<HistoryEvent>>, (StatusCode, String)> {
    let id = parse_id(&id)?;
    Ok(Json(state.buffers.history(id)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
