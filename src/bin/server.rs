#![forbid(unsafe_code)]

//! HTTP front end for tubegrab.
//!
//! Requests are stateless apart from the in-memory probe job table: every
//! listing asks yt-dlp afresh and every download lives in its own scratch
//! directory that disappears once the response body has been sent (or the
//! client went away, or the serve deadline fired).

use std::{
    io,
    path::{Component, Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{
        FromRequest, Multipart, Path as AxumPath, Query, Request, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use futures_util::{Stream, StreamExt};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{
    fs::File,
    signal,
    time::{Instant, Sleep},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use tubegrab::{
    Extractor, FetchError, ScratchDir, VideoUrl, Workspace, YtDlp,
    config::{RuntimeConfig, RuntimeOverrides, resolve_runtime_config},
    download, lister,
    jobs::{JobSnapshot, JobStore},
    security::ensure_not_root,
    workspace::CookieJar,
};

const INDEX_HTML: &str = include_str!("../../www/index.html");

#[derive(Debug, Parser)]
#[command(name = "tubegrab", version, about = "Fetch YouTube media through yt-dlp")]
struct ServerArgs {
    /// Listen address (IPv4 or IPv6).
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Directory under which per-request scratch directories are created.
    #[arg(long)]
    temp_root: Option<PathBuf>,
    /// Serve static assets from this directory instead of the bundled page.
    #[arg(long)]
    www_root: Option<PathBuf>,
    /// Path or name of the yt-dlp executable.
    #[arg(long = "yt-dlp")]
    ytdlp: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn into_overrides(self) -> RuntimeOverrides {
        RuntimeOverrides {
            host: self.host,
            port: self.port,
            temp_root: self.temp_root,
            www_root: self.www_root,
            ytdlp: self.ytdlp,
            env_path: self.env_file,
        }
    }
}

#[derive(Clone)]
struct AppState {
    extractor: Arc<dyn Extractor>,
    workspace: Workspace,
    jobs: JobStore,
    www_root: Option<Arc<PathBuf>>,
    serve_timeout: Duration,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        let status = match err {
            FetchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FetchError::Extraction(_) => StatusCode::BAD_GATEWAY,
            FetchError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct InfoRequest {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadRequest {
    #[serde(default)]
    url: String,
    #[serde(default)]
    format_id: String,
    #[serde(default)]
    job_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = resolve_runtime_config(ServerArgs::parse().into_overrides())?;
    ensure_not_root("tubegrab", config.allow_root)?;

    let extractor = YtDlp::new(&config.ytdlp)
        .with_socket_timeout(config.socket_timeout)
        .with_probe_timeout(config.probe_timeout)
        .with_download_timeout(config.download_timeout);
    let version = extractor.ensure_available().await?;
    info!(binary = %extractor.binary().display(), %version, "found yt-dlp");

    let workspace = Workspace::new(&config.temp_root);
    workspace.prepare()?;

    let state = AppState {
        extractor: Arc::new(extractor),
        workspace: workspace.clone(),
        jobs: JobStore::new(config.max_running_jobs),
        www_root: config.www_root.clone().map(Arc::new),
        serve_timeout: config.serve_timeout,
    };
    let janitor = spawn_janitor(&config, workspace, state.jobs.clone());

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        temp_root = %config.temp_root.display(),
        "tubegrab listening on http://{}", addr
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running HTTP server")?;

    janitor.abort();
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/info", get(info_from_query).post(info_from_json))
        .route(
            "/api/download",
            get(download_from_query).post(download_from_json),
        )
        .route("/api/submit", post(submit_job))
        .route("/api/job/{id}", get(job_status))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!("failed to install Ctrl+C handler: {err}");
    }
    info!("shutting down");
}

/// Sweeps orphaned scratch directories and expires old probe jobs, once right
/// away and then every `sweep_interval`.
fn spawn_janitor(
    config: &RuntimeConfig,
    workspace: Workspace,
    jobs: JobStore,
) -> tokio::task::JoinHandle<()> {
    let period = config.sweep_interval.max(Duration::from_secs(1));
    let stale_after = config.stale_after;
    let job_ttl = config.job_ttl;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            janitor_pass(&workspace, &jobs, stale_after, job_ttl).await;
        }
    })
}

async fn janitor_pass(
    workspace: &Workspace,
    jobs: &JobStore,
    stale_after: Duration,
    job_ttl: Duration,
) {
    let sweeper = workspace.clone();
    let expirer = jobs.clone();
    let pass = tokio::task::spawn_blocking(move || {
        (sweeper.sweep(stale_after), expirer.expire(job_ttl))
    });
    match pass.await {
        Ok((removed, expired)) => {
            if removed > 0 {
                info!(removed, "janitor removed stale scratch directories");
            }
            if expired > 0 {
                info!(expired, remaining = jobs.len(), "janitor expired probe jobs");
            }
        }
        Err(err) => warn!("janitor pass panicked: {err}"),
    }
}

async fn info_from_query(
    State(state): State<AppState>,
    query: Result<Query<InfoRequest>, QueryRejection>,
) -> ApiResult<Json<tubegrab::MediaInfo>> {
    let Query(request) = query?;
    list_info(&state, &request.url).await
}

async fn info_from_json(
    State(state): State<AppState>,
    payload: Result<Json<InfoRequest>, JsonRejection>,
) -> ApiResult<Json<tubegrab::MediaInfo>> {
    let Json(request) = payload?;
    list_info(&state, &request.url).await
}

async fn list_info(state: &AppState, raw_url: &str) -> ApiResult<Json<tubegrab::MediaInfo>> {
    let info = lister::list_formats(state.extractor.as_ref(), raw_url, None).await?;
    Ok(Json(info))
}

async fn download_from_query(
    State(state): State<AppState>,
    query: Result<Query<DownloadRequest>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(request) = query?;
    serve_download(&state, request).await
}

async fn download_from_json(
    State(state): State<AppState>,
    payload: Result<Json<DownloadRequest>, JsonRejection>,
) -> ApiResult<Response> {
    let Json(request) = payload?;
    serve_download(&state, request).await
}

async fn serve_download(state: &AppState, request: DownloadRequest) -> ApiResult<Response> {
    let url = VideoUrl::parse(&request.url)?;
    let cookies = request
        .job_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .and_then(|id| {
            let jar = state.jobs.cookies(id);
            if jar.is_none() {
                debug!(job_id = id, "no cookie file for job");
            }
            jar
        });
    let cookie_path = cookies.as_deref().map(CookieJar::path);

    let media = download::fetch(
        state.extractor.as_ref(),
        &state.workspace,
        &url,
        &request.format_id,
        cookie_path,
    )
    .await?;

    let file_name = media.file_name();
    let content_type = media.content_type();
    let size = media.size();
    let (file, scratch) = media.open().await?;
    info!(%url, file = %file_name, bytes = size, "serving download");

    let body = Body::from_stream(ScopedStream::new(file, scratch, state.serve_timeout));
    let mut response = body.into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type.as_ref())
            .map_err(|err| ApiError::internal(err.to_string()))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&file_name))
            .map_err(|err| ApiError::internal(err.to_string()))?,
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

/// `attachment` with an ASCII fallback name plus the RFC 5987 UTF-8 form.
fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|ch| {
            if ch.is_ascii() && !ch.is_ascii_control() && ch != '"' && ch != '\\' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{fallback}\"; filename*=UTF-8''{}",
        urlencoding::encode(file_name)
    )
}

/// Response body for a finished download. Owns the scratch directory, so the
/// file is deleted as soon as the body is dropped, whether it was fully sent,
/// the client disconnected or the serve deadline fired.
struct ScopedStream {
    inner: ReaderStream<File>,
    deadline: Pin<Box<Sleep>>,
    expired: bool,
    scratch: Option<ScratchDir>,
}

impl ScopedStream {
    fn new(file: File, scratch: ScratchDir, limit: Duration) -> Self {
        Self {
            inner: ReaderStream::new(file),
            deadline: Box::pin(tokio::time::sleep(limit)),
            expired: false,
            scratch: Some(scratch),
        }
    }

    /// The timer only reports ready after the driver fired it, so a deadline
    /// that passed before the first poll is checked against the clock too.
    fn deadline_passed(&mut self, cx: &mut TaskContext<'_>) -> bool {
        self.deadline.deadline() <= Instant::now() || self.deadline.as_mut().poll(cx).is_ready()
    }
}

impl Stream for ScopedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        if self.expired {
            return Poll::Ready(None);
        }
        if self.deadline_passed(cx) {
            self.expired = true;
            if let Some(scratch) = &self.scratch {
                warn!(
                    path = %scratch.path().display(),
                    "serve deadline reached, aborting body"
                );
            }
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "download took too long to send",
            ))));
        }
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for ScopedStream {
    fn drop(&mut self) {
        if let Some(scratch) = self.scratch.take() {
            scratch.release();
        }
    }
}

async fn submit_job(
    State(state): State<AppState>,
    request: Request,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.starts_with("multipart/form-data"));

    let (raw_url, cookie_bytes) = if is_multipart {
        let multipart = Multipart::from_request(request, &state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        read_submit_form(multipart).await?
    } else {
        let Json(body) = Json::<InfoRequest>::from_request(request, &state).await?;
        (body.url, None)
    };

    let url = VideoUrl::parse(&raw_url)?;
    let cookies = match cookie_bytes {
        Some(bytes) => Some(CookieJar::store(&state.workspace, &bytes).await?),
        None => None,
    };
    let has_cookies = cookies.is_some();
    let job_id = state
        .jobs
        .submit(state.extractor.clone(), url.clone(), cookies);
    info!(%job_id, %url, has_cookies, "probe job submitted");

    Ok((StatusCode::ACCEPTED, Json(SubmitResponse { job_id })))
}

/// Pulls the `url` field and the optional `cookies` file out of a form. An
/// empty cookie upload counts as none.
async fn read_submit_form(mut multipart: Multipart) -> ApiResult<(String, Option<Bytes>)> {
    let mut url = String::new();
    let mut cookies = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.body_text()))?
    {
        let field_name = field.name().unwrap_or_default().to_string();
        match field_name.as_str() {
            "url" => {
                url = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
            }
            "cookies" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
                if !bytes.is_empty() {
                    cookies = Some(bytes);
                }
            }
            _ => {}
        }
    }
    Ok((url, cookies))
}

async fn job_status(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<JobSnapshot>> {
    state
        .jobs
        .status(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("job not found"))
}

async fn static_fallback(State(state): State<AppState>, req: Request) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    let result = match state.www_root.as_deref() {
        Some(root) => serve_www_path(root, path).await,
        None if should_fallback_to_index(path) => Ok(bundled_index()),
        None => Err(ApiError::not_found("file not found")),
    };
    result.unwrap_or_else(|err| err.into_response())
}

fn bundled_index() -> Response {
    (
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        )],
        INDEX_HTML,
    )
        .into_response()
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_file(&root.join("index.html")).await,
        Ok(_) => stream_file(&target).await,
        Err(_) if should_fallback_to_index(request_path) => {
            stream_file(&root.join("index.html")).await
        }
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

/// Extensionless paths belong to the single page app.
fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    trimmed.is_empty() || Path::new(trimmed).extension().is_none()
}

async fn stream_file(path: &Path) -> ApiResult<Response> {
    let file = File::open(path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(path).first()
        && let Ok(value) = HeaderValue::from_str(mime.as_ref())
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
