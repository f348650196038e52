use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use videovault_core::cover::{check_file_exists, cover_info, image_mime, read_image, CoverOverrides};
use videovault_core::{Error, Result, ScanOrchestrator};

pub fn run_web_server(engine: Arc<ScanOrchestrator>, port: u16) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::Io)?;
    runtime.block_on(run_web_server_async(engine, port))
}

async fn run_web_server_async(engine: Arc<ScanOrchestrator>, port: u16) -> Result<()> {
    let (events_tx, _) = broadcast::channel(200);
    let state = Arc::new(AppState { engine, events_tx });

    let app = Router::new()
        .route("/events", get(sse_events))
        .route("/api/roots", get(list_roots_handler).post(add_root_handler))
        .route("/api/roots/:id", get(get_root_handler).delete(remove_root_handler))
        .route("/api/roots/:id/enabled", post(set_enabled_handler))
        .route("/api/roots/:id/max-depth", post(set_max_depth_handler))
        .route("/api/roots/:id/tree", get(scan_handler))
        .route("/api/roots/:id/rescan", post(rescan_handler))
        .route("/api/roots/:id/metadata", get(metadata_handler))
        .route("/api/roots/:id/volume-key", get(volume_key_handler))
        .route("/api/roots/:id/state", get(scan_state_handler))
        .route("/api/cover", get(find_cover_handler))
        .route("/api/cover-info", get(cover_info_handler))
        .route("/api/cover-overrides", put(cover_overrides_handler))
        .route("/api/image", get(read_image_handler))
        .route("/api/exists", get(exists_handler))
        .route("/api/stats", get(stats_handler))
        .with_state(state);

    let addr = ([127, 0, 0, 1], port).into();
    info!("videovault bridge listening on http://127.0.0.1:{port}/");

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await
        .map_err(|err| Error::InvalidArgument(format!("server error: {err}")))?;

    Ok(())
}

struct AppState {
    engine: Arc<ScanOrchestrator>,
    events_tx: broadcast::Sender<ServerEvent>,
}

impl AppState {
    fn emit(&self, event: ServerEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerEvent {
    ScanStarted {
        root_id: String,
        forced: bool,
    },
    ScanDone {
        root_id: String,
        video_count: usize,
    },
    ScanError {
        root_id: String,
        message: String,
    },
    MetadataReady {
        root_id: String,
        directory: String,
        count: usize,
    },
}

enum ApiError {
    Core(Error),
    Background,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Core(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Core(err) => {
                let status = status_for(&err);
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    warn!(%err, "request failed");
                }
                (status, Json(ErrorBody { error: err.to_string() })).into_response()
            }
            ApiError::Background => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    error: "background task failed".to_string(),
                }),
            )
                .into_response(),
        }
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err.root_cause() {
        Error::NotFound(_) | Error::RootNotFound(_) => StatusCode::NOT_FOUND,
        Error::DuplicatePath(_) => StatusCode::CONFLICT,
        Error::RootDisabled(_) | Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        Error::Permission(_) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

async fn blocking<T, F>(f: F) -> std::result::Result<T, ApiError>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::Core),
        Err(_) => Err(ApiError::Background),
    }
}

#[derive(Deserialize)]
struct AddRootBody {
    path: PathBuf,
    name: Option<String>,
}

#[derive(Serialize)]
struct IdBody {
    id: String,
}

#[derive(Deserialize)]
struct EnabledBody {
    enabled: bool,
}

#[derive(Deserialize)]
struct MaxDepthBody {
    max_depth: u32,
}

#[derive(Deserialize)]
struct DirectoryQuery {
    directory: PathBuf,
}

#[derive(Deserialize)]
struct PathQuery {
    path: PathBuf,
}

#[derive(Serialize)]
struct VolumeKeyBody {
    volume_key: String,
}

#[derive(Serialize)]
struct DataUrlBody {
    data_url: String,
}

async fn sse_events(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = std::result::Result<Event, Infallible>>> {
    let rx = state.events_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|item| match item {
        Ok(event) => {
            let payload = serde_json::to_string(&event).ok()?;
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(10)))
}

async fn list_roots_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Vec<videovault_core::RootFolder>> {
    let engine = state.engine.clone();
    Ok(Json(blocking(move || engine.list_roots()).await?))
}

async fn add_root_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddRootBody>,
) -> ApiResult<IdBody> {
    let engine = state.engine.clone();
    let id = blocking(move || engine.add_root(&body.path, body.name.as_deref())).await?;
    Ok(Json(IdBody { id }))
}

async fn get_root_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<videovault_core::RootFolder> {
    let engine = state.engine.clone();
    Ok(Json(blocking(move || engine.get_root(&id)).await?))
}

async fn remove_root_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    let engine = state.engine.clone();
    blocking(move || engine.remove_root(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn set_enabled_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<EnabledBody>,
) -> ApiResult<videovault_core::RootFolder> {
    let engine = state.engine.clone();
    Ok(Json(blocking(move || engine.set_enabled(&id, body.enabled)).await?))
}

async fn set_max_depth_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<MaxDepthBody>,
) -> ApiResult<videovault_core::RootFolder> {
    let engine = state.engine.clone();
    Ok(Json(blocking(move || engine.set_max_depth(&id, body.max_depth)).await?))
}

async fn scan_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<videovault_core::DirectoryNode> {
    run_scan(&state, id, false).await.map(Json)
}

async fn rescan_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    run_scan(&state, id, true).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_scan(
    state: &Arc<AppState>,
    root_id: String,
    forced: bool,
) -> std::result::Result<videovault_core::DirectoryNode, ApiError> {
    state.emit(ServerEvent::ScanStarted {
        root_id: root_id.clone(),
        forced,
    });
    let engine = state.engine.clone();
    let id = root_id.clone();
    let result = blocking(move || {
        if forced {
            engine.rescan(&id)
        } else {
            engine.scan(&id)
        }
    })
    .await;

    match &result {
        Ok(tree) => state.emit(ServerEvent::ScanDone {
            root_id,
            video_count: tree.video_count,
        }),
        Err(ApiError::Core(err)) => state.emit(ServerEvent::ScanError {
            root_id,
            message: err.to_string(),
        }),
        Err(ApiError::Background) => state.emit(ServerEvent::ScanError {
            root_id,
            message: "background task failed".to_string(),
        }),
    }
    result
}

async fn metadata_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<DirectoryQuery>,
) -> ApiResult<Vec<videovault_core::EnrichedVideo>> {
    let engine = state.engine.clone();
    let root_id = id.clone();
    let directory = query.directory.clone();
    let results = blocking(move || engine.enrich(&root_id, &directory)).await?;
    state.emit(ServerEvent::MetadataReady {
        root_id: id,
        directory: query.directory.display().to_string(),
        count: results.len(),
    });
    Ok(Json(results))
}

async fn volume_key_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<VolumeKeyBody> {
    let engine = state.engine.clone();
    let key = blocking(move || engine.volume_key_for(&id)).await?;
    Ok(Json(VolumeKeyBody {
        volume_key: key.to_string(),
    }))
}

async fn scan_state_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<videovault_core::RootScanState> {
    let engine = state.engine.clone();
    Ok(Json(blocking(move || engine.scan_state(&id)).await?))
}

async fn find_cover_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<Option<PathBuf>> {
    let engine = state.engine.clone();
    Ok(Json(
        blocking(move || Ok(engine.find_cover_for_video(&query.path))).await?,
    ))
}

async fn cover_info_handler(
    Query(query): Query<PathQuery>,
) -> ApiResult<videovault_core::cover::CoverInfo> {
    Ok(Json(blocking(move || cover_info(&query.path)).await?))
}

async fn cover_overrides_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<HashMap<PathBuf, PathBuf>>,
) -> std::result::Result<StatusCode, ApiError> {
    let engine = state.engine.clone();
    blocking(move || {
        engine.set_cover_overrides(body.into_iter().collect::<CoverOverrides>());
        Ok(())
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn read_image_handler(Query(query): Query<PathQuery>) -> ApiResult<DataUrlBody> {
    let data_url = blocking(move || read_image_data_url(&query.path)).await?;
    Ok(Json(DataUrlBody { data_url }))
}

async fn exists_handler(Query(query): Query<PathQuery>) -> Json<bool> {
    Json(check_file_exists(&query.path))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<videovault_core::EngineStats> {
    Json(state.engine.stats())
}

/// `data:<mime>;base64,<payload>` for an image file.
fn read_image_data_url(path: &std::path::Path) -> Result<String> {
    let bytes = read_image(path)?;
    let mime = image_mime(path, &bytes);
    let payload = base64::engine::general_purpose::STANDARD.encode(&bytes);
    Ok(format!("data:{mime};base64,{payload}"))
}
