//! Request handlers.
//!
//! Handlers never run separation work themselves: submission hands the
//! request to the job coordinator and returns immediately, and `/health`
//! only reads engine state and probes the cache root.

use super::AppState;
use super::protocol::{
    ApiError, HealthResponse, ModelsResponse, PresetEntry, Readiness, ServiceInfo, SubmitResponse,
};
use crate::audio::{AudioFormat, OutputFormat};
use crate::engine::catalog::{self, DEFAULT_PRESET};
use crate::error::{ErrorKind, SeparationError};
use crate::jobs::{JobId, JobSnapshot, JobStatus, ResultFetch, SeparationRequest, StemFetch};
use crate::stems::{StemLabel, StemPreset};
use axum::Json;
use axum::extract::multipart::{Multipart, MultipartError};
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};

// GET /

pub async fn root() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: "stemsplit".to_string(),
        version: crate::version_string(),
        status: "running".to_string(),
        endpoints: [
            "GET /health",
            "GET /models",
            "POST /separate",
            "GET /jobs/{id}",
            "GET /jobs/{id}/stems",
            "GET /jobs/{id}/stems/{stem}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect(),
    })
}

// GET /health

pub async fn health(State(state): State<AppState>) -> Response {
    let engine = state.coordinator.engine().status();
    let cache = state.coordinator.cache().clone();
    let cache_writable = tokio::task::spawn_blocking(move || cache.is_writable())
        .await
        .unwrap_or(false);
    let ready = state.coordinator.engine().is_ready() && cache_writable;

    let body = HealthResponse {
        status: if ready {
            Readiness::Ready
        } else {
            Readiness::Unavailable
        },
        version: crate::version_string(),
        engine,
        cache_writable,
        jobs: state.coordinator.stats(),
    };
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

// GET /models

pub async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let model = state.coordinator.engine().model().ok();
    let presets = StemPreset::ALL
        .iter()
        .map(|&preset| PresetEntry {
            info: catalog::preset_info(preset),
            available: model.as_ref().is_some_and(|m| m.supports(preset)),
        })
        .collect();
    Json(ModelsResponse {
        default: DEFAULT_PRESET,
        presets,
        engine: state.coordinator.engine().status(),
        input_formats: AudioFormat::ALL.iter().map(|f| f.as_str()).collect(),
        output_formats: vec![OutputFormat::Wav.as_str(), OutputFormat::WavFloat.as_str()],
    })
}

// POST /separate

pub async fn separate(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut upload: Option<(String, Vec<u8>)> = None;
    let mut stems: Option<String> = None;
    let mut format: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, state.max_upload_bytes))?
    {
        match field.name() {
            Some("audio") => {
                let filename = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|name| !name.trim().is_empty())
                    .ok_or_else(|| {
                        ApiError::from(SeparationError::InvalidRequest {
                            message: "audio field has no filename".to_string(),
                        })
                    })?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| multipart_error(e, state.max_upload_bytes))?;
                upload = Some((filename, bytes.to_vec()));
            }
            Some("stems") => {
                stems = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| multipart_error(e, state.max_upload_bytes))?,
                );
            }
            Some("format") => {
                format = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| multipart_error(e, state.max_upload_bytes))?,
                );
            }
            other => {
                tracing::debug!(field = ?other, "ignoring unknown form field");
            }
        }
    }

    let (filename, audio) = upload.ok_or_else(|| {
        ApiError::from(SeparationError::InvalidRequest {
            message: "no audio file provided".to_string(),
        })
    })?;
    if audio.len() as u64 > state.max_upload_bytes {
        return Err(SeparationError::PayloadTooLarge {
            size: audio.len() as u64,
            limit: state.max_upload_bytes,
        }
        .into());
    }

    let input_format = AudioFormat::from_filename(&filename)?;
    let preset: StemPreset = stems.as_deref().unwrap_or(DEFAULT_PRESET).parse()?;
    let output_format = match format.as_deref().map(str::trim) {
        None | Some("") => OutputFormat::default(),
        Some(value) => value.parse()?,
    };

    tracing::debug!(
        filename = %filename,
        bytes = audio.len(),
        preset = %preset,
        format = output_format.as_str(),
        "separation requested"
    );
    let request = SeparationRequest::new(audio, input_format)
        .with_preset(preset)
        .with_output_format(output_format);
    let handle = state.coordinator.submit(request).await?;
    let snapshot = state.coordinator.status(&handle.id()).ok_or_else(|| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal,
            "job vanished after submission",
        )
    })?;

    let status = if snapshot.status == JobStatus::Completed {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(SubmitResponse::from_snapshot(&snapshot))).into_response())
}

fn multipart_error(error: MultipartError, limit: u64) -> ApiError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ApiError::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            ErrorKind::PayloadTooLarge,
            format!("upload exceeds the {} byte limit", limit),
        )
    } else {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            ErrorKind::InvalidRequest,
            format!("malformed multipart body: {}", error.body_text()),
        )
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::not_found(format!("no job '{}'", raw)))
}

// GET /jobs/:id

pub async fn job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let snapshot = state
        .coordinator
        .status(&id)
        .ok_or_else(|| ApiError::not_found(format!("no job '{}'", id)))?;
    Ok(Json(snapshot).into_response())
}

// GET /jobs/:id/stems/:stem

pub async fn job_stem(
    State(state): State<AppState>,
    Path((id, stem)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let label: StemLabel = stem.trim_end_matches(".wav").parse()?;

    let fetch = state
        .coordinator
        .fetch_stem(&id, label)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no job '{}'", id)))?;

    match fetch {
        StemFetch::Ready {
            label,
            format,
            bytes,
        } => {
            let disposition = format!(
                "attachment; filename=\"{}.{}\"",
                label,
                format.file_extension()
            );
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, format.content_type().to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                bytes,
            )
                .into_response())
        }
        StemFetch::InProgress(snapshot) => Ok((StatusCode::ACCEPTED, Json(snapshot)).into_response()),
        StemFetch::Failed(snapshot) => Err(job_failure(snapshot)),
        StemFetch::Expired(_) => Err(result_gone()),
    }
}

// GET /jobs/:id/stems

pub async fn job_archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let id = parse_job_id(&id)?;
    let fetch = state
        .coordinator
        .fetch_result(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no job '{}'", id)))?;

    match fetch {
        ResultFetch::Ready(stems) => {
            let name = format!("{}_separated", id);
            let dir = name.clone();
            let archive = tokio::task::spawn_blocking(move || stems.to_tar_gz(&dir))
                .await
                .map_err(|e| SeparationError::Other(format!("archive task failed: {}", e)))??;
            let disposition = format!("attachment; filename=\"{}.tar.gz\"", name);
            Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, "application/gzip".to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                archive,
            )
                .into_response())
        }
        ResultFetch::InProgress(snapshot) => {
            Ok((StatusCode::ACCEPTED, Json(snapshot)).into_response())
        }
        ResultFetch::Failed(snapshot) => Err(job_failure(snapshot)),
        ResultFetch::Expired(_) => Err(result_gone()),
    }
}

fn job_failure(snapshot: JobSnapshot) -> ApiError {
    match snapshot.error {
        Some(error) => error.into(),
        None => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal,
            "job failed without an error",
        ),
    }
}

fn result_gone() -> ApiError {
    ApiError::new(
        StatusCode::GONE,
        ErrorKind::Internal,
        "result has been evicted from the cache; submit the request again",
    )
}
