//! Default configuration constants for stemsplit.
//!
//! Shared between the configuration types, the HTTP layer and the engine so
//! limits are defined in exactly one place.

/// Canonical sample rate fed to separation models, in Hz.
pub const CANONICAL_SAMPLE_RATE: u32 = 44_100;

/// Canonical channel count fed to separation models.
pub const CANONICAL_CHANNELS: u16 = 2;

/// Default listening port (matches the container's exposed port).
pub const PORT: u16 = 8000;

/// Default bind address.
pub const HOST: &str = "0.0.0.0";

/// Maximum accepted upload size in bytes (25 MiB).
pub const MAX_UPLOAD_BYTES: u64 = 25 * 1024 * 1024;

/// Maximum accepted input duration in seconds.
pub const MAX_DURATION_SECS: u64 = 600;

/// Wall-clock ceiling for a single separation job, in seconds.
pub const JOB_TIMEOUT_SECS: u64 = 300;

/// How long terminal jobs stay pollable, in seconds.
pub const JOB_RETENTION_SECS: u64 = 3600;

/// Default artifact cache byte ceiling (2 GiB).
pub const CACHE_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Ceiling on the summed memory estimate of outstanding jobs (4 GiB).
pub const ADMISSION_CEILING_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Directory name used under the platform cache dir when no cache root is configured.
pub const CACHE_DIR_NAME: &str = "stemsplit";

/// Environment variable naming the cache root.
pub const CACHE_DIR_ENV: &str = "SPLEETER_CACHE_DIR";

/// Input container extensions accepted by the upload endpoint.
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp3", "wav", "flac", "m4a", "ogg"];

/// Worker pool size when not configured: one per available core.
pub fn worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_count_is_positive() {
        assert!(worker_count() >= 1);
    }

    #[test]
    fn upload_limit_is_25_mib() {
        assert_eq!(MAX_UPLOAD_BYTES, 26_214_400);
    }
}
