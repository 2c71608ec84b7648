use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::structures::{InstallTaskState, SpeedEstimator, VerifierProgress};

/// Samples older than this no longer contribute to the estimate.
const SAMPLE_WINDOW: Duration = Duration::from_secs(8);
const MAX_SAMPLES: usize = 10_000;

impl SpeedEstimator {
  pub fn new() -> Self {
    Self { samples: Mutex::new(VecDeque::new()) }
  }

  /// Records the current cumulative progress and returns the bytes-per-second
  /// estimate over the window, zero while the window spans no elapsed time.
  pub fn record(&self, progress: u64) -> u64 {
    self.record_at(Instant::now(), progress)
  }

  pub(crate) fn record_at(&self, now: Instant, progress: u64) -> u64 {
    let mut samples = match self.samples.lock() {
      Ok(samples) => samples,
      Err(poisoned) => poisoned.into_inner(),
    };
    samples.push_back((now, progress));
    while let Some(first) = samples.front() {
      if now.duration_since(first.0) > SAMPLE_WINDOW || samples.len() > MAX_SAMPLES {
        samples.pop_front();
      } else {
        break;
      }
    }

    let (first_instant, first_progress) = match samples.front() {
      Some(first) => *first,
      None => return 0,
    };
    let (last_instant, last_progress) = match samples.back() {
      Some(last) => *last,
      None => return 0,
    };
    let elapsed = last_instant.duration_since(first_instant).as_millis() as u64;
    if elapsed == 0 {
      0
    } else {
      last_progress.saturating_sub(first_progress) * 1000 / elapsed
    }
  }

  pub fn reset(&self) {
    match self.samples.lock() {
      Ok(mut samples) => samples.clear(),
      Err(poisoned) => poisoned.into_inner().clear(),
    }
  }

  #[cfg(test)]
  pub(crate) fn window_len(&self) -> usize {
    self.samples.lock().unwrap().len()
  }
}

impl VerifierProgress {
  pub fn new() -> Self {
    Self {
      repository_index: AtomicUsize::new(0),
      repository_count: AtomicUsize::new(0),
      attempt: AtomicUsize::new(0),
      task_index: AtomicUsize::new(0),
      task_count: AtomicUsize::new(0),
      current_file: Mutex::new(String::new()),
      progress: AtomicU64::new(0),
      total: AtomicU64::new(0),
      speed: AtomicU64::new(0),
      num_broken_files: AtomicUsize::new(0),
      install_state: Mutex::new(InstallTaskState::NotStarted),
      estimator: SpeedEstimator::new(),
    }
  }

  pub fn repository_index(&self) -> usize { self.repository_index.load(Ordering::Relaxed) }
  pub fn repository_count(&self) -> usize { self.repository_count.load(Ordering::Relaxed) }
  pub fn attempt(&self) -> usize { self.attempt.load(Ordering::Relaxed) }
  pub fn task_index(&self) -> usize { self.task_index.load(Ordering::Relaxed) }
  pub fn task_count(&self) -> usize { self.task_count.load(Ordering::Relaxed) }
  pub fn progress(&self) -> u64 { self.progress.load(Ordering::Relaxed) }
  pub fn total(&self) -> u64 { self.total.load(Ordering::Relaxed) }
  pub fn speed(&self) -> u64 { self.speed.load(Ordering::Relaxed) }
  pub fn num_broken_files(&self) -> usize { self.num_broken_files.load(Ordering::Relaxed) }

  pub fn current_file(&self) -> String {
    match self.current_file.lock() {
      Ok(current) => current.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub fn install_state(&self) -> InstallTaskState {
    match self.install_state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  pub(crate) fn set_current_file(&self, value: String) {
    if let Ok(mut current) = self.current_file.lock() {
      *current = value;
    }
  }

  pub(crate) fn set_install_state(&self, value: InstallTaskState) {
    if let Ok(mut state) = self.install_state.lock() {
      *state = value;
    }
  }

  /// Records a progress sample and refreshes the speed estimate.
  pub(crate) fn update(&self, task_index: usize, progress: u64, total: u64) {
    self.task_index.store(task_index, Ordering::Relaxed);
    self.progress.store(progress.min(total), Ordering::Relaxed);
    self.total.store(total, Ordering::Relaxed);
    self.speed.store(self.estimator.record(progress.min(total)), Ordering::Relaxed);
  }

  /// Zeroes the per-phase counters at the start of a verify or install pass.
  pub(crate) fn reset_phase(&self, task_count: usize) {
    self.task_index.store(0, Ordering::Relaxed);
    self.task_count.store(task_count, Ordering::Relaxed);
    self.progress.store(0, Ordering::Relaxed);
    self.total.store(0, Ordering::Relaxed);
    self.speed.store(0, Ordering::Relaxed);
    self.estimator.reset();
  }

  pub(crate) fn reset(&self) {
    self.repository_index.store(0, Ordering::Relaxed);
    self.repository_count.store(0, Ordering::Relaxed);
    self.attempt.store(0, Ordering::Relaxed);
    self.num_broken_files.store(0, Ordering::Relaxed);
    self.set_current_file(String::new());
    self.set_install_state(InstallTaskState::NotStarted);
    self.reset_phase(0);
  }
}

impl InstallTaskState {
  pub(crate) fn to_u8(self) -> u8 {
    match self {
      Self::NotStarted => 0,
      Self::Connecting => 1,
      Self::Downloading => 2,
      Self::WaitingForReady => 3,
      Self::Installing => 4,
      Self::Done => 5,
    }
  }

  pub(crate) fn from_u8(value: u8) -> Option<Self> {
    match value {
      0 => Some(Self::NotStarted),
      1 => Some(Self::Connecting),
      2 => Some(Self::Downloading),
      3 => Some(Self::WaitingForReady),
      4 => Some(Self::Installing),
      5 => Some(Self::Done),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn speed_is_delta_progress_over_delta_time() {
    let estimator = SpeedEstimator::new();
    let base = Instant::now();
    assert_eq!(estimator.record_at(base, 0), 0);
    assert_eq!(estimator.record_at(base + Duration::from_secs(1), 100), 100);
    assert_eq!(estimator.record_at(base + Duration::from_secs(2), 300), 150);
  }

  #[test]
  fn samples_older_than_the_window_are_evicted() {
    let estimator = SpeedEstimator::new();
    let base = Instant::now();
    estimator.record_at(base, 0);
    estimator.record_at(base + Duration::from_secs(1), 100);
    assert_eq!(estimator.window_len(), 2);

    // 11s is past the 8s window for both earlier samples.
    estimator.record_at(base + Duration::from_secs(11), 1000);
    assert_eq!(estimator.window_len(), 1);
    assert_eq!(estimator.record_at(base + Duration::from_secs(12), 1200), 200);
  }

  #[test]
  fn zero_elapsed_time_yields_zero_speed() {
    let estimator = SpeedEstimator::new();
    let base = Instant::now();
    assert_eq!(estimator.record_at(base, 500), 0);
    assert_eq!(estimator.record_at(base, 900), 0);
  }
}
