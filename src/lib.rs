//! stemsplit - audio stem separation service
//!
//! Splits uploaded tracks into stems (vocals, accompaniment, drums, ...)
//! behind an HTTP API, with a content-addressed on-disk cache of results.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
pub mod cache;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod jobs;
pub mod server;
pub mod stems;

// Decoder/encoder adapter
pub use audio::{AudioBuffer, AudioFormat, OutputFormat};

// Separation engine
pub use engine::{SeparationEngine, SeparationModel};

// Cache and jobs
pub use cache::ArtifactCache;
pub use fingerprint::Fingerprint;
pub use jobs::{JobCoordinator, JobHandle, JobState, SeparationRequest};

// HTTP
pub use server::{AppState, build_router, run_server};

// Stems
pub use stems::{EncodedStems, StemLabel, StemPreset, StemSet};

// Error handling
pub use error::{Result, SeparationError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }

    #[test]
    fn version_string_hash_suffix_is_short() {
        let ver = version_string();
        if let Some((_, hash)) = ver.split_once('+') {
            assert!(!hash.is_empty());
            assert!(hash.len() <= 12, "unexpected hash suffix: {}", hash);
        }
    }
}
