use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::Path;
use tracing::{info, warn};

use crate::backup::{BackupManager, EngineError, StatusSnapshot};
use crate::storage::Storage;
use crate::utils::paths::verify_request;

#[derive(Clone)]
pub struct AppState {
    pub manager: BackupManager,
    pub storage: Storage,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/start", post(start_sync))
        .route("/confirm", post(confirm_deletion))
        .route("/cancel", post(cancel_sync))
        .route("/history", get(get_history))
}

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn error_body(status: StatusCode, message: impl ToString) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.to_string() })))
}

fn engine_error(e: EngineError) -> (StatusCode, Json<Value>) {
    let status = match e {
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::Busy | EngineError::InvalidCommand { .. } => StatusCode::CONFLICT,
        EngineError::EngineStopped => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_body(status, e)
}

pub async fn get_status(State(state): State<AppState>) -> Json<StatusSnapshot> {
    Json(state.manager.get_status())
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    source: String,
    target: String,
}

pub async fn start_sync(State(state): State<AppState>, Json(req): Json<StartRequest>) -> ApiResult {
    let request = match verify_request(&req.source, &req.target).await {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected sync request {} -> {}: {:#}", req.source, req.target, e);
            return Err(error_body(StatusCode::BAD_REQUEST, format!("{:#}", e)));
        }
    };

    let generation = state.manager.start(request).await.map_err(engine_error)?;
    info!("Accepted sync request as generation {}", generation);
    Ok(Json(json!({ "status": "ok", "generation": generation })))
}

pub async fn confirm_deletion(State(state): State<AppState>) -> ApiResult {
    state.manager.confirm_deletion().await.map_err(engine_error)?;
    Ok(Json(json!({ "status": "ok" })))
}

pub async fn cancel_sync(State(state): State<AppState>) -> ApiResult {
    state.manager.cancel().await.map_err(engine_error)?;
    Ok(Json(json!({ "status": "ok" })))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    limit: Option<i64>,
    source: Option<String>,
    target: Option<String>,
}

/// Most recent outcomes, optionally narrowed to one source/target pair.
pub async fn get_history(State(state): State<AppState>, Query(query): Query<HistoryQuery>) -> ApiResult {
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    let history = match (&query.source, &query.target) {
        (Some(source), Some(target)) => {
            state
                .storage
                .history_for_pair(Path::new(source), Path::new(target), limit)
                .await
        }
        (None, None) => state.storage.recent_history(limit).await,
        _ => {
            return Err(error_body(
                StatusCode::BAD_REQUEST,
                "source and target must be given together",
            ))
        }
    }
    .map_err(|e| error_body(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    Ok(Json(json!({ "history": history })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::fake_process::{FakeExit, FakeLauncher, FakeScript};
    use crate::backup::BackupState;
    use crate::utils::config::Config;
    use std::sync::Arc;

    async fn state(launcher: &FakeLauncher) -> AppState {
        let storage = Storage::new("sqlite::memory:").await.unwrap();
        storage.run_migrations().await.unwrap();
        let manager = BackupManager::new(
            Config::default(),
            Arc::new(launcher.clone()),
            Arc::new(storage.clone()),
        );
        AppState { manager, storage }
    }

    fn start_request(source: &std::path::Path, target: &std::path::Path) -> Json<StartRequest> {
        Json(StartRequest {
            source: source.display().to_string(),
            target: target.display().to_string(),
        })
    }

    #[tokio::test]
    async fn start_runs_and_lands_in_history() {
        let launcher = FakeLauncher::new();
        launcher.push(
            FakeScript::new()
                .stdout("Number of files: 3\nNumber of regular files transferred: 0\nNumber of deleted files: 0\n")
                .exit(FakeExit::Code(0)),
        );
        let state = state(&launcher).await;
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();

        let mut events = state.manager.subscribe_events();
        let Json(body) = start_sync(State(state.clone()), start_request(source.path(), target.path()))
            .await
            .unwrap();
        assert_eq!(body["generation"], 1);

        while !matches!(events.recv().await, Ok(crate::backup::Event::Finished { .. })) {}

        let Json(status) = get_status(State(state.clone())).await;
        assert_eq!(status.state, BackupState::Completed);

        let Json(history) = get_history(State(state.clone()), Query(HistoryQuery::default()))
            .await
            .unwrap();
        assert_eq!(history["history"].as_array().unwrap().len(), 1);
        assert_eq!(history["history"][0]["status"], "success");

        let query = HistoryQuery {
            limit: Some(5),
            source: Some("/elsewhere".to_string()),
            target: Some(target.path().display().to_string()),
        };
        let Json(history) = get_history(State(state.clone()), Query(query)).await.unwrap();
        assert!(history["history"].as_array().unwrap().is_empty());

        let query = HistoryQuery {
            source: Some("/elsewhere".to_string()),
            ..HistoryQuery::default()
        };
        let err = get_history(State(state), Query(query)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn invalid_paths_are_bad_requests() {
        let launcher = FakeLauncher::new();
        let state = state(&launcher).await;
        let source = tempfile::tempdir().unwrap();

        let err = start_sync(
            State(state),
            start_request(source.path(), &source.path().join("missing")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(launcher.launches().is_empty());
    }

    #[tokio::test]
    async fn commands_in_wrong_state_conflict() {
        let launcher = FakeLauncher::new();
        let state = state(&launcher).await;

        let err = confirm_deletion(State(state.clone())).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
        let err = cancel_sync(State(state)).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);
    }
}
