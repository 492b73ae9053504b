//! `/environments/{id}/events` endpoints: SSE streaming and client-side
//! event injection (spec §6.2).

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::Json;
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;

use rig_domain::EnvironmentId;
use rig_eventlog::event::{CallbackResponse, Event, EventType, LogStream};
use rig_eventlog::Predicate;

use crate::state::AppState;

/// `GET /environments/{id}/events` — SSE stream, resumable via the
/// standard `Last-Event-ID` header (interpreted as a `seq` watermark).
pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<EnvironmentId>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, StatusCode> {
    let log = {
        let environments = state.environments.lock().await;
        environments.get(&id).ok_or(StatusCode::NOT_FOUND)?.log.clone()
    };

    let from_seq = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);

    let accept_all: Arc<Predicate> = Arc::new(|_: &Event| true);
    let events = log.subscribe(from_seq, accept_all).await;

    let sse_stream = events.map(|event| {
        let seq = event.seq;
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().id(seq.to_string()).data(data))
    });

    Ok(Sse::new(sse_stream).keep_alive(KeepAlive::default()))
}

/// Shape of an event a client may inject: callback responses, logs
/// originating in a client-executed handler, test notes, and client-side
/// service failures (spec §6.2).
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    CallbackResponse {
        handler: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    ServiceLog {
        service: String,
        stream: LogStream,
        data: String,
    },
    TestNote {
        message: String,
    },
    TestFailed {
        message: String,
    },
    ServiceFailed {
        service: String,
        message: String,
    },
}

/// `POST /environments/{id}/events` — client-side event injection.
pub async fn inject_event(
    State(state): State<AppState>,
    Path(id): Path<EnvironmentId>,
    Json(client_event): Json<ClientEvent>,
) -> Result<StatusCode, StatusCode> {
    let (log, environment_name) = {
        let environments = state.environments.lock().await;
        let runtime = environments.get(&id).ok_or(StatusCode::NOT_FOUND)?;
        (runtime.log.clone(), runtime.environment().name.clone())
    };

    let event = match client_event {
        ClientEvent::CallbackResponse { handler, payload } => {
            Event::builder(&environment_name, EventType::CallbackResponse)
                .callback_response(CallbackResponse { handler, payload })
                .build()
        }
        ClientEvent::ServiceLog { service, stream, data } => {
            Event::builder(&environment_name, EventType::ServiceLog)
                .service(service)
                .log(stream, data)
                .build()
        }
        ClientEvent::TestNote { message } => {
            Event::builder(&environment_name, EventType::TestNote).message(message).build()
        }
        ClientEvent::TestFailed { message } => {
            Event::builder(&environment_name, EventType::TestFailed).message(message).build()
        }
        ClientEvent::ServiceFailed { service, message } => {
            Event::builder(&environment_name, EventType::ServiceFailed)
                .service(service)
                .message(message)
                .build()
        }
    };

    log.publish(event).await;
    Ok(StatusCode::ACCEPTED)
}
