//! Job coordinator.
//!
//! Accepts separation requests, answers from the artifact cache when it can,
//! and otherwise runs the work on a bounded pool of blocking workers. At most
//! one computation runs per fingerprint: identical submissions join the job
//! that is already pending or running.
//!
//! Failed jobs are never retried automatically. A later submission of the
//! same request replaces the failed record with a fresh job.

pub mod admission;
pub mod job;

pub use admission::{AdmissionController, AdmissionPermit};
pub use job::{
    JobHandle, JobId, JobRecord, JobSnapshot, JobState, JobStatus, ResultRef, SeparationRequest,
};

use crate::audio::{self, OutputFormat};
use crate::cache::{ArtifactCache, EvictionPolicy, StoreOutcome};
use crate::config::JobsConfig;
use crate::engine::{CancelFlag, ResourceEstimate, SeparationEngine};
use crate::error::{JobError, Result, SeparationError};
use crate::fingerprint::Fingerprint;
use crate::stems::{EncodedStems, StemLabel, StemSet};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorSettings {
    pub workers: usize,
    pub timeout: Duration,
    pub retention: Duration,
    pub max_duration_secs: u64,
    pub admission_ceiling_bytes: u64,
}

impl From<&JobsConfig> for CoordinatorSettings {
    fn from(config: &JobsConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            timeout: config.timeout(),
            retention: config.retention(),
            max_duration_secs: config.max_duration_secs,
            admission_ceiling_bytes: config.admission_ceiling_bytes,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&JobsConfig::default())
    }
}

/// Job counts and reserved capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub workers: usize,
    pub idle_workers: usize,
    pub reserved_bytes: u64,
    pub admission_ceiling_bytes: u64,
}

/// Outcome of asking for one stem of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum StemFetch {
    /// Pending or running
    InProgress(JobSnapshot),
    Failed(JobSnapshot),
    Ready {
        label: StemLabel,
        format: OutputFormat,
        bytes: Vec<u8>,
    },
    /// Completed, but the cache entry has since been evicted
    Expired(JobSnapshot),
}

/// Outcome of asking for every stem of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultFetch {
    /// Pending or running
    InProgress(JobSnapshot),
    Failed(JobSnapshot),
    Ready(EncodedStems),
    /// Completed, but the cache entry has since been evicted
    Expired(JobSnapshot),
}

/// What `submit` decided under the job table lock.
enum Admission {
    Joined(JobHandle),
    CacheHit,
    Accepted(Arc<JobRecord>, AdmissionPermit),
}

#[derive(Debug, Default)]
struct JobTable {
    by_id: HashMap<JobId, Arc<JobRecord>>,
    /// Latest job per fingerprint
    by_fingerprint: HashMap<Fingerprint, Arc<JobRecord>>,
}

impl JobTable {
    /// A job that new submissions can join: pending, running, or completed
    /// with its result held inline.
    fn joinable(&self, fingerprint: &Fingerprint) -> Option<Arc<JobRecord>> {
        let record = self.by_fingerprint.get(fingerprint)?;
        match record.state() {
            JobState::Pending
            | JobState::Running
            | JobState::Completed(ResultRef::Inline(_)) => Some(Arc::clone(record)),
            JobState::Completed(ResultRef::Cached(_)) | JobState::Failed(_) => None,
        }
    }

    fn insert(&mut self, record: Arc<JobRecord>) {
        self.by_fingerprint
            .insert(record.fingerprint, Arc::clone(&record));
        self.by_id.insert(record.id, record);
    }

    fn prune(&mut self, retention: Duration) -> usize {
        let expired: Vec<Arc<JobRecord>> = self
            .by_id
            .values()
            .filter(|r| r.is_expired(retention))
            .cloned()
            .collect();
        for record in &expired {
            self.by_id.remove(&record.id);
            let current = self
                .by_fingerprint
                .get(&record.fingerprint)
                .is_some_and(|r| Arc::ptr_eq(r, record));
            if current {
                self.by_fingerprint.remove(&record.fingerprint);
            }
        }
        expired.len()
    }
}

struct Inner {
    engine: Arc<SeparationEngine>,
    cache: ArtifactCache,
    settings: CoordinatorSettings,
    workers: Arc<Semaphore>,
    admission: AdmissionController,
    jobs: Mutex<JobTable>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn jobs(&self) -> MutexGuard<'_, JobTable> {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared handle to the coordinator. Cheap to clone.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCoordinator")
            .field("settings", &self.inner.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

impl JobCoordinator {
    pub fn new(
        engine: Arc<SeparationEngine>,
        cache: ArtifactCache,
        settings: CoordinatorSettings,
    ) -> Self {
        let workers = settings.workers.max(1);
        Self {
            inner: Arc::new(Inner {
                engine,
                cache,
                workers: Arc::new(Semaphore::new(workers)),
                admission: AdmissionController::new(settings.admission_ceiling_bytes),
                settings,
                jobs: Mutex::new(JobTable::default()),
                reaper: Mutex::new(None),
            }),
        }
    }

    pub fn engine(&self) -> &Arc<SeparationEngine> {
        &self.inner.engine
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.inner.cache
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    /// Accept a request and return a handle to its job.
    ///
    /// Rejected synchronously with `ModelUnavailable` while the model is not
    /// loaded, `InputTooLong` when the container header reports more than
    /// the duration limit, and `Overloaded` when admitting the job would
    /// push reserved memory past the ceiling. Cache hits and identical
    /// in-flight submissions are never rejected for capacity.
    pub async fn submit(&self, request: SeparationRequest) -> Result<JobHandle> {
        let model = self.inner.engine.model()?;
        self.inner.engine.check_preset(request.preset)?;
        let (request, fingerprint) = fingerprint_request(request, model.version().to_string()).await?;
        self.prune();

        if let Some(record) = self.inner.jobs().joinable(&fingerprint) {
            tracing::debug!(job = %record.id, fingerprint = %fingerprint.short(), "joined existing job");
            return Ok(record.handle());
        }

        if self.cache_contains(fingerprint).await {
            return Ok(self.record_cache_hit(&request, fingerprint));
        }

        let (request, probed) = tokio::task::spawn_blocking(move || {
            let probed = audio::probe_duration(&request.audio, request.input_format);
            (request, probed)
        })
        .await
        .map_err(join_error)?;
        let max_duration_secs = self.inner.settings.max_duration_secs;
        let duration_secs = match probed? {
            Some(duration) => {
                if duration > max_duration_secs as f64 {
                    return Err(SeparationError::InputTooLong {
                        duration_secs: duration,
                        limit_secs: max_duration_secs,
                    });
                }
                duration
            }
            // Decoding stops at the limit, so the limit bounds the footprint.
            None => max_duration_secs as f64,
        };
        let estimate = self
            .inner
            .engine
            .estimate_cost(duration_secs, request.preset);

        let (record, permit) = match self.admit(fingerprint, &request, estimate)? {
            Admission::Joined(handle) => return Ok(handle),
            Admission::CacheHit => return Ok(self.record_cache_hit(&request, fingerprint)),
            Admission::Accepted(record, permit) => (record, permit),
        };

        tracing::info!(
            job = %record.id,
            fingerprint = %fingerprint.short(),
            preset = %request.preset,
            format = request.output_format.as_str(),
            bytes = request.audio.len(),
            duration_secs,
            reserved_bytes = permit.bytes(),
            "job accepted"
        );
        let handle = record.handle();
        tokio::spawn(run_job(Arc::clone(&self.inner), record, request, permit));
        Ok(handle)
    }

    /// Join, answer from cache, or reserve capacity for a new job, all under
    /// the job table lock. Jobs that finished while we fingerprinted are seen here.
    fn admit(
        &self,
        fingerprint: Fingerprint,
        request: &SeparationRequest,
        estimate: ResourceEstimate,
    ) -> Result<Admission> {
        let mut jobs = self.inner.jobs();
        if let Some(record) = jobs.joinable(&fingerprint) {
            return Ok(Admission::Joined(record.handle()));
        }
        if self.inner.cache.contains(&fingerprint) {
            return Ok(Admission::CacheHit);
        }
        let permit = self.inner.admission.try_admit(estimate)?;
        let record = Arc::new(JobRecord::new(
            fingerprint,
            request.preset,
            request.output_format,
            Some(estimate),
        ));
        jobs.insert(Arc::clone(&record));
        Ok(Admission::Accepted(record, permit))
    }

    async fn cache_contains(&self, fingerprint: Fingerprint) -> bool {
        let cache = self.inner.cache.clone();
        match tokio::task::spawn_blocking(move || cache.lookup(&fingerprint)).await {
            Ok(Ok(found)) => found.is_some(),
            Ok(Err(e)) => {
                tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "cache lookup failed, computing");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache lookup task failed");
                false
            }
        }
    }

    fn record_cache_hit(&self, request: &SeparationRequest, fingerprint: Fingerprint) -> JobHandle {
        let mut jobs = self.inner.jobs();
        if let Some(record) = jobs.by_fingerprint.get(&fingerprint) {
            if record.from_cache
                && record.state() == JobState::Completed(ResultRef::Cached(fingerprint))
            {
                return record.handle();
            }
        }
        let record = Arc::new(JobRecord::cached(
            fingerprint,
            request.preset,
            request.output_format,
        ));
        tracing::info!(job = %record.id, fingerprint = %fingerprint.short(), "served from cache");
        let handle = record.handle();
        jobs.insert(record);
        handle
    }

    /// Current status of the handle's job.
    pub fn poll(&self, handle: &JobHandle) -> JobStatus {
        handle.poll().status()
    }

    pub fn status(&self, id: &JobId) -> Option<JobSnapshot> {
        self.record(id).map(|r| r.snapshot())
    }

    pub fn handle(&self, id: &JobId) -> Option<JobHandle> {
        self.record(id).map(|r| r.handle())
    }

    fn record(&self, id: &JobId) -> Option<Arc<JobRecord>> {
        self.inner.jobs().by_id.get(id).cloned()
    }

    /// Load every stem of a completed result. `None` when a cached result has
    /// been evicted.
    pub async fn load_result(&self, result: &ResultRef) -> Result<Option<EncodedStems>> {
        match result {
            ResultRef::Inline(stems) => Ok(Some(EncodedStems::clone(stems))),
            ResultRef::Cached(fingerprint) => {
                let fingerprint = *fingerprint;
                let cache = self.inner.cache.clone();
                tokio::task::spawn_blocking(move || {
                    read_pinned(&cache, fingerprint, |reader| reader.read_all())
                })
                .await
                .map_err(join_error)?
            }
        }
    }

    /// Fetch one stem of a job. `None` for an unknown job id.
    pub async fn fetch_stem(&self, id: &JobId, label: StemLabel) -> Result<Option<StemFetch>> {
        let Some(record) = self.record(id) else {
            return Ok(None);
        };
        if !record.preset.contains(label) {
            return Err(SeparationError::InvalidRequest {
                message: format!(
                    "job {} produces {}, not '{}'",
                    id,
                    record.preset.id(),
                    label
                ),
            });
        }

        let fetch = match record.state() {
            JobState::Pending | JobState::Running => StemFetch::InProgress(record.snapshot()),
            JobState::Failed(_) => StemFetch::Failed(record.snapshot()),
            JobState::Completed(ResultRef::Inline(stems)) => match stems.get(label) {
                Some(bytes) => StemFetch::Ready {
                    label,
                    format: stems.format,
                    bytes: bytes.to_vec(),
                },
                None => StemFetch::Expired(record.snapshot()),
            },
            JobState::Completed(ResultRef::Cached(fingerprint)) => {
                let cache = self.inner.cache.clone();
                let bytes = tokio::task::spawn_blocking(move || {
                    read_pinned(&cache, fingerprint, |reader| reader.read_stem(label))
                })
                .await
                .map_err(join_error)??;
                match bytes {
                    Some(bytes) => StemFetch::Ready {
                        label,
                        format: record.output_format,
                        bytes,
                    },
                    None => StemFetch::Expired(record.snapshot()),
                }
            }
        };
        Ok(Some(fetch))
    }

    /// Fetch every stem of a job. `None` for an unknown job id.
    pub async fn fetch_result(&self, id: &JobId) -> Result<Option<ResultFetch>> {
        let Some(record) = self.record(id) else {
            return Ok(None);
        };
        let fetch = match record.state() {
            JobState::Pending | JobState::Running => ResultFetch::InProgress(record.snapshot()),
            JobState::Failed(_) => ResultFetch::Failed(record.snapshot()),
            JobState::Completed(result) => match self.load_result(&result).await? {
                Some(stems) => ResultFetch::Ready(stems),
                None => ResultFetch::Expired(record.snapshot()),
            },
        };
        Ok(Some(fetch))
    }

    /// Drop terminal jobs older than the retention window.
    pub fn prune(&self) -> usize {
        let removed = self.inner.jobs().prune(self.inner.settings.retention);
        if removed > 0 {
            tracing::debug!(removed, "pruned finished jobs");
        }
        removed
    }

    /// Prune finished jobs and sweep cache staging left by dead writers.
    pub async fn maintain(&self) {
        self.prune();
        let cache = self.inner.cache.clone();
        match tokio::task::spawn_blocking(move || cache.sweep_staging()).await {
            Ok(Ok(0)) => {}
            Ok(Ok(removed)) => tracing::info!(removed, "swept abandoned cache staging"),
            Ok(Err(e)) => tracing::warn!(error = %e, "cache staging sweep failed"),
            Err(e) => tracing::warn!(error = %e, "cache staging sweep task failed"),
        }
    }

    /// Run [`JobCoordinator::maintain`] periodically until shutdown.
    pub fn start_reaper(&self) {
        let period = (self.inner.settings.retention / 4)
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                JobCoordinator { inner }.maintain().await;
            }
        });
        let previous = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        let mut stats = CoordinatorStats {
            workers: self.inner.settings.workers.max(1),
            idle_workers: self.inner.workers.available_permits(),
            reserved_bytes: self.inner.admission.outstanding_bytes(),
            admission_ceiling_bytes: self.inner.admission.ceiling_bytes(),
            ..CoordinatorStats::default()
        };
        for record in self.inner.jobs().by_id.values() {
            match record.status() {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Stop accepting work, cancel unfinished jobs and wait up to `grace`
    /// for them to settle.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.workers.close();
        if let Some(reaper) = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            reaper.abort();
        }

        let unfinished: Vec<Arc<JobRecord>> = self
            .inner
            .jobs()
            .by_id
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect();
        if unfinished.is_empty() {
            return;
        }
        tracing::info!(jobs = unfinished.len(), "cancelling unfinished jobs");
        for record in &unfinished {
            record.cancel.cancel();
        }
        let settle = async {
            for record in &unfinished {
                record.handle().wait().await.ok();
            }
        };
        if tokio::time::timeout(grace, settle).await.is_err() {
            tracing::warn!("jobs still running after shutdown grace period");
        }
    }
}

/// Pin the entry, run `read`, and evict the entry if it turns out corrupt.
fn read_pinned<T>(
    cache: &ArtifactCache,
    fingerprint: Fingerprint,
    read: impl FnOnce(&crate::cache::EntryReader) -> Result<T>,
) -> Result<Option<T>> {
    let Some(reader) = cache.open_reader(&fingerprint)? else {
        return Ok(None);
    };
    match read(&reader) {
        Ok(value) => Ok(Some(value)),
        Err(SeparationError::CacheCorrupt { message, .. }) => {
            drop(reader);
            tracing::warn!(fingerprint = %fingerprint.short(), error = %message, "dropping corrupt cache entry");
            cache.evict(EvictionPolicy::Entry(fingerprint))?;
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

async fn run_job(
    inner: Arc<Inner>,
    record: Arc<JobRecord>,
    request: SeparationRequest,
    permit: AdmissionPermit,
) {
    let _permit = permit;
    let Ok(_worker) = Arc::clone(&inner.workers).acquire_owned().await else {
        fail(&record, SeparationError::Cancelled);
        return;
    };
    if record.cancel.is_cancelled() {
        fail(&record, SeparationError::Cancelled);
        return;
    }

    record.transition(JobState::Running);
    tracing::debug!(job = %record.id, "job running");
    let started = Instant::now();

    let engine = Arc::clone(&inner.engine);
    let cancel = record.cancel.clone();
    let max_duration_secs = inner.settings.max_duration_secs;
    let work = tokio::task::spawn_blocking(move || {
        process(&engine, &request, &cancel, max_duration_secs)
    });

    let outcome = match tokio::time::timeout(inner.settings.timeout, work).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(SeparationError::SeparationFailure {
            message: format!("worker panicked: {}", e),
        }),
        Err(_) => {
            // The blocking worker stops at its next cancellation check.
            record.cancel.cancel();
            Err(SeparationError::Timeout {
                limit_secs: inner.settings.timeout.as_secs(),
            })
        }
    };

    match outcome {
        Ok(stems) => {
            let result = publish(&inner.cache, record.fingerprint, stems).await;
            let cached = matches!(result, ResultRef::Cached(_));
            record.transition(JobState::Completed(result));
            tracing::info!(
                job = %record.id,
                fingerprint = %record.fingerprint.short(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                cached,
                "job completed"
            );
        }
        Err(e) => fail(&record, e),
    }
}

/// Decode, separate and encode. Runs on the blocking pool.
fn process(
    engine: &SeparationEngine,
    request: &SeparationRequest,
    cancel: &CancelFlag,
    max_duration_secs: u64,
) -> Result<EncodedStems> {
    let decoded = audio::decode_bounded(&request.audio, request.input_format, max_duration_secs)?;
    cancel.check()?;

    let canonical = audio::normalize(decoded)?;
    let stems = if canonical.is_empty() {
        StemSet::silent(request.preset, canonical.sample_rate(), canonical.channels())
    } else {
        engine.separate(&canonical, request.preset, cancel)?
    };
    cancel.check()?;
    stems.encode(request.output_format)
}

async fn publish(cache: &ArtifactCache, fingerprint: Fingerprint, stems: EncodedStems) -> ResultRef {
    let stems = Arc::new(stems);
    let cache = cache.clone();
    let to_store = Arc::clone(&stems);
    let stored = tokio::task::spawn_blocking(move || cache.store(&fingerprint, &to_store)).await;
    match stored {
        Ok(Ok(StoreOutcome::Published)) | Ok(Ok(StoreOutcome::AlreadyPresent)) => {
            ResultRef::Cached(fingerprint)
        }
        Ok(Ok(StoreOutcome::Skipped { reason })) => {
            tracing::warn!(fingerprint = %fingerprint.short(), reason = %reason, "result not cached, holding inline");
            ResultRef::Inline(stems)
        }
        Ok(Err(e)) => {
            tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "cache store failed, holding inline");
            ResultRef::Inline(stems)
        }
        Err(e) => {
            tracing::warn!(fingerprint = %fingerprint.short(), error = %e, "cache store task failed, holding inline");
            ResultRef::Inline(stems)
        }
    }
}

fn fail(record: &JobRecord, error: SeparationError) {
    let job_error: JobError = error.to_job_error();
    if error.is_client_error() {
        tracing::warn!(job = %record.id, error = %error, "job rejected input");
    } else {
        tracing::error!(job = %record.id, kind = %job_error.kind, error = %error, "job failed");
    }
    record.transition(JobState::Failed(job_error));
}

/// Hash the payload on the blocking pool; uploads run to tens of megabytes.
async fn fingerprint_request(
    request: SeparationRequest,
    model_version: String,
) -> Result<(SeparationRequest, Fingerprint)> {
    tokio::task::spawn_blocking(move || {
        let fingerprint = request.fingerprint(&model_version);
        (request, fingerprint)
    })
    .await
    .map_err(join_error)
}

fn join_error(e: JoinError) -> SeparationError {
    SeparationError::Other(format!("background task failed: {}", e))
}
