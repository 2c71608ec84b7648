use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize};
use std::sync::Mutex;
use std::time::Instant;

/// Top-level run state of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
  Unknown,
  Verify,
  Done,
  Cancelled,
  Error,
}

/// Where one source's install currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallTaskState {
  NotStarted,
  Connecting,
  Downloading,
  WaitingForReady,
  Installing,
  Done,
}

/// Asynchronous progress pushed by the worker outside the request/response flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
  Verify { target_index: u32, progress: u64, total: u64 },
  Install { source_index: u32, progress: u64, total: u64, state: InstallTaskState },
}

/// Transfer speed from a sliding window of `(timestamp, cumulative progress)`
/// samples.
pub struct SpeedEstimator {
  pub(crate) samples: Mutex<VecDeque<(Instant, u64)>>,
}

/// Progress surface of a running [`crate::Verifier`], shared with the caller's ui.
pub struct VerifierProgress {
  pub(crate) repository_index: AtomicUsize,
  pub(crate) repository_count: AtomicUsize,
  pub(crate) attempt: AtomicUsize,
  pub(crate) task_index: AtomicUsize,
  pub(crate) task_count: AtomicUsize,
  pub(crate) current_file: Mutex<String>,
  pub(crate) progress: AtomicU64,
  pub(crate) total: AtomicU64,
  pub(crate) speed: AtomicU64,
  pub(crate) num_broken_files: AtomicUsize,
  pub(crate) install_state: Mutex<InstallTaskState>,
  pub(crate) estimator: SpeedEstimator,
}
