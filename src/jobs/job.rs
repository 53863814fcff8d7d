//! Job records, handles and the submitted request.

use crate::audio::{AudioFormat, OutputFormat};
use crate::engine::{CancelFlag, ResourceEstimate};
use crate::error::{ErrorKind, JobError};
use crate::fingerprint::Fingerprint;
use crate::stems::{EncodedStems, StemLabel, StemPreset};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

/// Audio plus the requested stem set and output encoding.
#[derive(Clone)]
pub struct SeparationRequest {
    pub audio: Vec<u8>,
    pub input_format: AudioFormat,
    pub preset: StemPreset,
    pub output_format: OutputFormat,
}

impl fmt::Debug for SeparationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeparationRequest")
            .field("audio", &format_args!("<{} bytes>", self.audio.len()))
            .field("input_format", &self.input_format)
            .field("preset", &self.preset)
            .field("output_format", &self.output_format)
            .finish()
    }
}

impl SeparationRequest {
    pub fn new(audio: Vec<u8>, input_format: AudioFormat) -> Self {
        Self {
            audio,
            input_format,
            preset: StemPreset::default(),
            output_format: OutputFormat::default(),
        }
    }

    pub fn with_preset(mut self, preset: StemPreset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_output_format(mut self, output_format: OutputFormat) -> Self {
        self.output_format = output_format;
        self
    }

    pub fn fingerprint(&self, model_version: &str) -> Fingerprint {
        Fingerprint::compute(
            &self.audio,
            self.input_format,
            self.preset,
            model_version,
            self.output_format,
        )
    }
}

/// Opaque job identifier handed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Where a completed job's stems live.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultRef {
    /// Published in the artifact cache
    Cached(Fingerprint),
    /// Held on the job because the cache refused the entry
    Inline(Arc<EncodedStems>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobState {
    Pending,
    Running,
    Completed(ResultRef),
    Failed(JobError),
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Self::Pending => JobStatus::Pending,
            Self::Running => JobStatus::Running,
            Self::Completed(_) => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable view of a job for status polling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub fingerprint: Fingerprint,
    pub status: JobStatus,
    pub preset: StemPreset,
    pub stems: Vec<StemLabel>,
    pub format: OutputFormat,
    pub created_at: DateTime<Utc>,
    /// True when the job was answered from the cache without computation
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

/// Shared, mutable job record. State transitions go through a watch channel
/// so any number of waiters observe the terminal state.
#[derive(Debug)]
pub struct JobRecord {
    pub id: JobId,
    pub fingerprint: Fingerprint,
    pub preset: StemPreset,
    pub output_format: OutputFormat,
    pub created_at: DateTime<Utc>,
    pub from_cache: bool,
    pub estimate: Option<ResourceEstimate>,
    pub cancel: CancelFlag,
    state: watch::Sender<JobState>,
    finished_at: Mutex<Option<Instant>>,
}

impl JobRecord {
    pub fn new(
        fingerprint: Fingerprint,
        preset: StemPreset,
        output_format: OutputFormat,
        estimate: Option<ResourceEstimate>,
    ) -> Self {
        let (state, _) = watch::channel(JobState::Pending);
        Self {
            id: JobId::new(),
            fingerprint,
            preset,
            output_format,
            created_at: Utc::now(),
            from_cache: false,
            estimate,
            cancel: CancelFlag::new(),
            state,
            finished_at: Mutex::new(None),
        }
    }

    /// A record that is already complete, served from the cache.
    pub fn cached(fingerprint: Fingerprint, preset: StemPreset, output_format: OutputFormat) -> Self {
        let mut record = Self::new(fingerprint, preset, output_format, None);
        record.from_cache = true;
        record.transition(JobState::Completed(ResultRef::Cached(fingerprint)));
        record
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.state.borrow().status()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Move to `next`. Terminal states are final: returns false and changes
    /// nothing once the job has completed or failed.
    pub fn transition(&self, next: JobState) -> bool {
        let terminal = next.is_terminal();
        let changed = self.state.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next;
            true
        });
        if changed && terminal {
            *self.finished_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        }
        changed
    }

    /// Terminal for longer than `retention`.
    pub fn is_expired(&self, retention: Duration) -> bool {
        self.finished_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some_and(|at| at.elapsed() >= retention)
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            fingerprint: self.fingerprint,
            rx: self.state.subscribe(),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let state = self.state();
        JobSnapshot {
            job_id: self.id,
            fingerprint: self.fingerprint,
            status: state.status(),
            preset: self.preset,
            stems: self.preset.labels().to_vec(),
            format: self.output_format,
            created_at: self.created_at,
            cached: self.from_cache,
            error: match state {
                JobState::Failed(e) => Some(e),
                _ => None,
            },
        }
    }
}

/// A caller's view of one job.
///
/// Dropping a handle (or a pending `wait`) only abandons this caller's wait;
/// the job keeps running for its other waiters.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    fingerprint: Fingerprint,
    rx: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Current state without waiting.
    pub fn poll(&self) -> JobState {
        self.rx.borrow().clone()
    }

    /// Suspend until the job is terminal.
    pub async fn wait(mut self) -> std::result::Result<ResultRef, JobError> {
        let state = match self.rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => state.clone(),
            Err(_) => {
                return Err(JobError {
                    kind: ErrorKind::Internal,
                    message: "job was dropped before finishing".to_string(),
                });
            }
        };
        match state {
            JobState::Completed(result) => Ok(result),
            JobState::Failed(error) => Err(error),
            JobState::Pending | JobState::Running => Err(JobError {
                kind: ErrorKind::Internal,
                message: "job ended without a terminal state".to_string(),
            }),
        }
    }
}
