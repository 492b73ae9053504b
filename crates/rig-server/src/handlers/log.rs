//! `GET /environments/{id}/log` — the full in-memory event array
//! (distinct from the on-disk JSONL written at teardown, spec §6.2/§6.3).

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;

use rig_domain::EnvironmentId;
use rig_eventlog::Event;

use crate::state::AppState;

pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<EnvironmentId>,
) -> Result<Json<Vec<Event>>, StatusCode> {
    let log = {
        let environments = state.environments.lock().await;
        environments.get(&id).ok_or(StatusCode::NOT_FOUND)?.log.clone()
    };
    Ok(Json(log.events().await))
}
