//! `/environments` lifecycle endpoints (spec §6.2).

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use rig_domain::{Environment, EnvironmentId};
use rig_orchestrator::EnvironmentRuntime;

use crate::state::AppState;

#[derive(Serialize)]
pub struct CreateResponse {
    id: String,
}

/// `POST /environments` — validates, applies the `observe`/`~test`
/// transforms, and starts orchestration asynchronously.
pub async fn create_environment(
    State(state): State<AppState>,
    Json(mut environment): Json<Environment>,
) -> Result<(StatusCode, Json<CreateResponse>), (StatusCode, Json<Vec<String>>)> {
    let errors = rig_validator::validate(&mut environment);
    if !errors.is_empty() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(errors.into_iter().map(|e| e.message).collect()),
        ));
    }

    let id = EnvironmentId::new();
    let scratch_dir = state.config.rig_dir.join("scratch").join(id.as_str());

    info!(environment = %environment.name, id = %id, "starting environment");

    let runtime = EnvironmentRuntime::start(
        id.clone(),
        environment,
        state.launchers.clone(),
        state.ports.clone(),
        state.artifacts.clone(),
        scratch_dir,
        state.config.shutdown_grace,
        state.config.watchdog_stall,
    )
    .await
    .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, Json(vec![err.to_string()])))?;

    state.environments.lock().await.insert(id.clone(), runtime);

    Ok((StatusCode::ACCEPTED, Json(CreateResponse { id: id.to_string() })))
}

/// `GET /environments/{id}` — the resolved environment snapshot (post
/// transform, with injected nodes included).
pub async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<EnvironmentId>,
) -> Result<Json<Environment>, StatusCode> {
    let environments = state.environments.lock().await;
    let runtime = environments.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(runtime.environment().clone()))
}

#[derive(Deserialize, Default)]
pub struct TeardownParams {
    #[serde(default)]
    preserve: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    log: bool,
}

/// `DELETE /environments/{id}?preserve=&reason=&log=` — blocking teardown.
/// Optionally writes the JSONL log and leaves the scratch directory in
/// place for postmortem inspection.
pub async fn delete_environment(
    State(state): State<AppState>,
    Path(id): Path<EnvironmentId>,
    Query(params): Query<TeardownParams>,
) -> Result<StatusCode, StatusCode> {
    let runtime = {
        let mut environments = state.environments.lock().await;
        environments.remove(&id).ok_or(StatusCode::NOT_FOUND)?
    };

    if let Some(reason) = &params.reason {
        info!(id = %id, reason, "tearing down environment");
    }

    let environment = runtime.environment().clone();
    let log = runtime.log.clone();

    tokio::time::timeout(Duration::from_secs(120), runtime.teardown())
        .await
        .ok();
    let events = log.events().await;

    if params.log {
        if let Err(err) = crate::logwriter::write_log(&state.config.rig_dir, &environment, id.as_str(), &events) {
            tracing::warn!(error = %err, "failed to write environment log");
        }
    }

    if !params.preserve {
        let scratch_dir = state.config.rig_dir.join("scratch").join(id.as_str());
        let _ = tokio::fs::remove_dir_all(scratch_dir).await;
    }

    Ok(StatusCode::NO_CONTENT)
}

pub async fn health() -> impl IntoResponse {
    "OK"
}
