//! HTTP 接口（feature = "web"）
//!
//! POST /query 提交查询并立即返回 session_id；GET /session/:id 返回最新快照；
//! /session/:id/events 以 SSE 推送该会话的过程事件，终态后结束流。

use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::{Orchestrator, SessionStatus, StepStatus};
use crate::react::{SessionEvent, SessionEventEnvelope};
use crate::scheme::{Scheme, SchemeBook};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session_id: String,
    pub message: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(api_query))
        .route("/session/:id", get(api_session))
        .route("/session/:id/cancel", post(api_cancel))
        .route("/session/:id/events", get(api_events))
        .route("/session/:id/schemes", get(api_schemes))
        .route("/health", get(api_health))
        .with_state(state)
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "detail": format!("Session not found: {}", id) })),
    )
        .into_response()
}

async fn api_query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Response {
    if req.query.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "detail": "query must not be empty" })),
        )
            .into_response();
    }
    let session_id = state.orchestrator.submit(&req.query);
    Json(QueryResponse {
        session_id,
        message: "Query processing started".to_string(),
    })
    .into_response()
}

async fn api_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.registry().view(&id) {
        Some(view) => Json(view).into_response(),
        None => not_found(&id),
    }
}

async fn api_cancel(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.orchestrator.cancel(&id) {
        StatusCode::ACCEPTED.into_response()
    } else {
        not_found(&id)
    }
}

/// 从已完成步骤的结果中抽取建筑方案
async fn api_schemes(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Some(session) = state.orchestrator.registry().get(&id) else {
        return not_found(&id);
    };
    let mut book = SchemeBook::new();
    for step in session.steps.values() {
        if step.status == StepStatus::Finished {
            book.add_from_text(&step.result);
        }
    }
    let schemes: Vec<Scheme> = book.schemes().to_vec();
    Json(serde_json::json!({ "session_id": id, "schemes": schemes })).into_response()
}

async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

struct EventCursor {
    rx: broadcast::Receiver<SessionEventEnvelope>,
    id: String,
    done: bool,
}

fn session_events(cursor: EventCursor) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(cursor, |mut c| async move {
        if c.done {
            return None;
        }
        loop {
            match c.rx.recv().await {
                Ok(env) if env.session_id == c.id => {
                    if let SessionEvent::StatusChanged { status } = &env.event {
                        c.done = status.is_terminal();
                    }
                    let data = serde_json::to_string(&env.event).unwrap_or_default();
                    return Some((Ok(Event::default().data(data)), c));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(session_id = %c.id, skipped = n, "SSE subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

async fn api_events(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let registry = state.orchestrator.registry();
    // 先订阅再读状态，避免错过两者之间的事件
    let rx = registry.subscribe();
    let Some(view) = registry.view(&id) else {
        return not_found(&id);
    };

    let initial = serde_json::to_string(&SessionEvent::StatusChanged { status: view.status })
        .unwrap_or_default();
    let terminal = matches!(view.status, SessionStatus::Completed | SessionStatus::Error);
    let head = stream::once(async move { Ok::<_, Infallible>(Event::default().data(initial)) });
    let tail = session_events(EventCursor {
        rx,
        id,
        done: terminal,
    });

    Sse::new(futures_util::StreamExt::chain(head, tail))
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(15))
                .text("keepalive"),
        )
        .into_response()
}
