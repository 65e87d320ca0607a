// # Import Module
//
// Content-addressed ingestion of dropped video files:
//
// - **Validation**: regular-file check and the container allow-list
// - **IngestLocks**: per-content-id mutual exclusion
// - **IngestPipeline**: orchestrates fingerprint, lookup, probe, demux and
//   cache budget enforcement
// - **IngestProgressHandle**: subscribe to per-track progress
//
// Public API:
// - `IngestPipeline::ingest`: returns an `IngestOutcome` that callers match
//   exhaustively (hit, miss or partial failure)

mod locks;
mod progress;
mod service;
mod types;
mod validation;

pub use locks::{IngestGuard, IngestLocks};
pub use progress::IngestProgressHandle;
pub use service::{IngestConfig, IngestError, IngestPipeline};
pub use types::{IngestOutcome, IngestProgress, MediaHandle, TrackFailure, TrackHandle};
pub use validation::{check_supported_format, SUPPORTED_EXTENSIONS};
