//! JSON bodies and status mapping for the HTTP front door.

use crate::audio::OutputFormat;
use crate::engine::EngineStatus;
use crate::engine::catalog::PresetInfo;
use crate::error::{ErrorKind, JobError, SeparationError};
use crate::fingerprint::Fingerprint;
use crate::jobs::{CoordinatorStats, JobId, JobSnapshot, JobStatus};
use crate::stems::{StemLabel, StemPreset};
use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// `GET /`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceInfo {
    pub name: String,
    pub version: String,
    pub status: String,
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    Ready,
    Unavailable,
}

/// `GET /health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: Readiness,
    pub version: String,
    pub engine: EngineStatus,
    pub cache_writable: bool,
    pub jobs: CoordinatorStats,
}

/// `GET /models`
#[derive(Debug, Clone, Serialize)]
pub struct ModelsResponse {
    pub default: &'static str,
    pub presets: Vec<PresetEntry>,
    pub engine: EngineStatus,
    pub input_formats: Vec<&'static str>,
    pub output_formats: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PresetEntry {
    #[serde(flatten)]
    pub info: &'static PresetInfo,
    /// Whether the loaded model can produce this preset
    pub available: bool,
}

/// `POST /separate` → 202
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub fingerprint: Fingerprint,
    pub preset: StemPreset,
    pub format: OutputFormat,
    pub cached: bool,
    pub status_url: String,
    /// All stems as one `.tar.gz`
    pub archive_url: String,
    pub stems: Vec<StemLink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StemLink {
    pub label: StemLabel,
    pub url: String,
}

impl SubmitResponse {
    pub fn from_snapshot(snapshot: &JobSnapshot) -> Self {
        Self {
            job_id: snapshot.job_id,
            status: snapshot.status,
            fingerprint: snapshot.fingerprint,
            preset: snapshot.preset,
            format: snapshot.format,
            cached: snapshot.cached,
            status_url: job_url(&snapshot.job_id),
            archive_url: archive_url(&snapshot.job_id),
            stems: snapshot
                .stems
                .iter()
                .map(|&label| StemLink {
                    label,
                    url: stem_url(&snapshot.job_id, label),
                })
                .collect(),
        }
    }
}

pub fn job_url(id: &JobId) -> String {
    format!("/jobs/{}", id)
}

pub fn archive_url(id: &JobId) -> String {
    format!("/jobs/{}/stems", id)
}

pub fn stem_url(id: &JobId, label: StemLabel) -> String {
    format!("/jobs/{}/stems/{}", id, label)
}

/// `{"error": {"kind": ..., "message": ...}}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub error: JobError,
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::UnsupportedFormat => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ErrorKind::CorruptInput | ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::PayloadTooLarge | ErrorKind::InputTooLong => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::Overloaded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::ModelUnavailable | ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::SeparationFailure | ErrorKind::Config | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// Error response carrying a kind and message.
#[derive(Debug, Clone)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                error: JobError {
                    kind,
                    message: message.into(),
                },
            },
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorKind::InvalidRequest, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> ErrorKind {
        self.body.error.kind
    }
}

impl From<SeparationError> for ApiError {
    fn from(error: SeparationError) -> Self {
        let kind = error.kind();
        Self::new(status_for(kind), kind, error.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(error: JobError) -> Self {
        Self {
            status: status_for(error.kind),
            body: ErrorBody { error },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let overloaded = self.body.error.kind == ErrorKind::Overloaded;
        let mut response = (self.status, Json(self.body)).into_response();
        if overloaded {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("5"));
        }
        response
    }
}
