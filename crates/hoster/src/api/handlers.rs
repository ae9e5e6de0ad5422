//! HTTP handlers for the control panel.

use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::time::Duration;

use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
};
use futures::{Stream, TryStreamExt};
use hoster_files::{DirectoryListing, StagedUpload, UploadedFile};
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

use super::error::{ApiError, ApiResult};
use super::state::{AppState, InstanceRef};
use crate::backup::Backup;
use crate::console::LogLine;
use crate::status::StatusReport;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Generic success response with a message.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub status: &'static str,
    pub message: String,
}

impl MessageResponse {
    fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success",
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConsoleLogQuery {
    pub lines: Option<usize>,
    /// Also return sequence numbers and timestamps.
    #[serde(default)]
    pub records: bool,
}

#[derive(Debug, Serialize)]
pub struct ConsoleLogResponse {
    pub status: &'static str,
    pub log: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<LogLine>>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub report: StatusReport,
    /// Whole seconds since start, while the process is up.
    pub uptime_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub message: String,
    pub filename: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct ListFilesResponse {
    pub status: &'static str,
    #[serde(flatten)]
    pub listing: DirectoryListing,
}

#[derive(Debug, Serialize)]
pub struct BackupResponse {
    pub status: &'static str,
    pub message: String,
    pub backup_file: String,
    pub backup: Backup,
}

#[derive(Debug, Serialize)]
pub struct BackupListResponse {
    pub status: &'static str,
    pub backups: Vec<Backup>,
}

#[derive(Debug, Serialize)]
pub struct InstanceSummary {
    pub name: String,
    pub server_status: String,
}

#[derive(Debug, Serialize)]
pub struct InstanceListResponse {
    pub status: &'static str,
    pub instances: Vec<InstanceSummary>,
}

/// Liveness of the backend itself.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn list_instances(State(state): State<AppState>) -> Json<InstanceListResponse> {
    let instances = state
        .instances
        .names()
        .into_iter()
        .filter_map(|name| state.instances.get(&name))
        .map(|instance| InstanceSummary {
            name: instance.name().to_string(),
            server_status: instance.status().report().server_status,
        })
        .collect();

    Json(InstanceListResponse {
        status: "success",
        instances,
    })
}

// ============================================================================
// Process lifecycle
// ============================================================================

pub async fn start_server(InstanceRef(instance): InstanceRef) -> ApiResult<Json<MessageResponse>> {
    instance.supervisor().start().await?;
    Ok(Json(MessageResponse::success(format!(
        "Server starting in {}...",
        instance.workspace().root().display()
    ))))
}

pub async fn stop_server(InstanceRef(instance): InstanceRef) -> ApiResult<Json<MessageResponse>> {
    let timeout = instance.supervisor().config().stop_timeout;
    instance.supervisor().stop(timeout).await?;
    Ok(Json(MessageResponse::success("Server stopped.")))
}

pub async fn restart_server(
    InstanceRef(instance): InstanceRef,
) -> ApiResult<Json<MessageResponse>> {
    let timeout = instance.supervisor().config().stop_timeout;
    instance.supervisor().restart(timeout).await?;
    Ok(Json(MessageResponse::success("Server restarting...")))
}

pub async fn send_command(
    InstanceRef(instance): InstanceRef,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> ApiResult<Json<MessageResponse>> {
    let command = payload
        .ok()
        .and_then(|Json(request)| request.command)
        .filter(|command| !command.is_empty())
        .ok_or_else(|| ApiError::bad_request("Command not provided."))?;

    instance.commands().send(&command).await?;
    Ok(Json(MessageResponse::success(format!(
        "Command '{}' sent.",
        command.trim()
    ))))
}

// ============================================================================
// Console and status
// ============================================================================

pub async fn get_console_log(
    InstanceRef(instance): InstanceRef,
    Query(query): Query<ConsoleLogQuery>,
) -> Json<ConsoleLogResponse> {
    if query.records {
        let mut records = instance.console().lines();
        if let Some(n) = query.lines {
            let skip = records.len().saturating_sub(n);
            records.drain(..skip);
        }
        let log = records
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        return Json(ConsoleLogResponse {
            status: "success",
            log,
            records: Some(records),
        });
    }

    let lines = match query.lines {
        Some(n) => instance.console().tail(n),
        None => instance.console().snapshot(),
    };
    Json(ConsoleLogResponse {
        status: "success",
        log: lines.join("\n"),
        records: None,
    })
}

/// Push console lines as server-sent events.
pub async fn console_stream(
    InstanceRef(instance): InstanceRef,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(instance.console().subscribe()).map(|item| {
        let event = match item {
            Ok(line) => Event::default()
                .id(line.seq.to_string())
                .data(line.text.replace('\r', "")),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                Event::default().event("lagged").data(skipped.to_string())
            }
        };
        Ok::<_, Infallible>(event)
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keepalive"),
    )
}

pub async fn get_server_status(InstanceRef(instance): InstanceRef) -> Json<StatusResponse> {
    let reporter = instance.status();
    Json(StatusResponse {
        status: "success",
        report: reporter.report(),
        uptime_secs: reporter.uptime().map(|uptime| uptime.num_seconds()),
    })
}

// ============================================================================
// Files
// ============================================================================

/// Multipart upload with a `file` part and an optional `subdir` part.
pub async fn upload_file(
    InstanceRef(instance): InstanceRef,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadResponse>> {
    let workspace = instance.workspace();
    let mut subdir: Option<String> = None;
    let mut staged: Option<StagedUpload> = None;
    let mut uploaded: Option<UploadedFile> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart request: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("subdir") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid subdir field: {}", e)))?;
                subdir = Some(text);
            }
            Some("file") => {
                if uploaded.is_some() || staged.is_some() {
                    return Err(ApiError::bad_request("Only one file per upload is supported"));
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                if file_name.is_empty() {
                    return Err(ApiError::bad_request("No selected file"));
                }
                let reader = StreamReader::new(field.map_err(io::Error::other));
                // With the destination known up front the upload commits directly.
                match subdir.as_deref() {
                    Some(dir) => uploaded = Some(workspace.upload(dir, &file_name, reader).await?),
                    None => staged = Some(workspace.stage(&file_name, reader).await?),
                }
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }

    let result = match (uploaded, staged) {
        (Some(uploaded), _) => uploaded,
        (None, Some(staged)) => {
            workspace
                .commit(staged, subdir.as_deref().unwrap_or_default())
                .await?
        }
        (None, None) => return Err(ApiError::bad_request("No file part")),
    };

    info!("Uploaded {} ({} bytes)", result.path, result.size);
    Ok(Json(UploadResponse {
        status: "success",
        message: "File uploaded successfully.".to_string(),
        filename: result.filename,
        path: result.path,
    }))
}

pub async fn list_files(
    InstanceRef(instance): InstanceRef,
    Query(query): Query<ListFilesQuery>,
) -> ApiResult<Json<ListFilesResponse>> {
    let listing = instance.workspace().list(&query.path).await?;
    Ok(Json(ListFilesResponse {
        status: "success",
        listing,
    }))
}

/// Stream a workspace file as an attachment.
pub async fn download_file(
    InstanceRef(instance): InstanceRef,
    Path(params): Path<HashMap<String, String>>,
) -> ApiResult<Response> {
    let relative = params.get("path").map(String::as_str).unwrap_or_default();
    let download = instance.workspace().download(relative).await?;

    debug!("Downloading file: {}", relative);

    let mime = mime_guess::from_path(&download.file_name)
        .first_or_octet_stream()
        .to_string();
    let safe_filename = download.file_name.replace('"', "'");
    let body = Body::from_stream(ReaderStream::new(download.file));

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, mime),
            (header::CONTENT_LENGTH, download.size.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", safe_filename),
            ),
        ],
        body,
    )
        .into_response())
}

// ============================================================================
// Backups
// ============================================================================

pub async fn backup_server(InstanceRef(instance): InstanceRef) -> ApiResult<Json<BackupResponse>> {
    let backup = instance.backups().create().await?;
    Ok(Json(BackupResponse {
        status: "success",
        message: format!("Backup created: {}", backup.file_name),
        backup_file: backup.file_name.clone(),
        backup,
    }))
}

pub async fn list_backups(InstanceRef(instance): InstanceRef) -> Json<BackupListResponse> {
    Json(BackupListResponse {
        status: "success",
        backups: instance.backups().list(),
    })
}
