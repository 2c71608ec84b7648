//! The orchestrator. Drives, per repository, a bounded verify, diagnose and
//! repair loop against a worker, and aggregates progress for the caller's ui.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::functions::fetch_metadata::{fetch_latest_versions, fetch_repo_meta, is_fresh_install, RepositoryVersion};
use crate::installer::ProgressSink;
use crate::remote::RemoteInstaller;
use crate::structures::{
  Error, InstallTaskState, PatchIndex, PatchSource, PatchSourceKey, ProcessPriority,
  ProgressEvent, Repository, TargetStreamMode, VerifierProgress, VerifyState,
};
use crate::traits::ChunkCodec;

/// Verify and repair cycles granted to one repository before the run fails.
pub const REATTEMPT_COUNT: usize = 5;

/// Parallel range fetches per patch source.
pub const MAX_CONCURRENT_CONNECTIONS_FOR_PATCH_SET: u32 = 8;

/// How far a repository's locally cached patch files are still believed.
/// The first attempt trusts them; once verification failed they may be the
/// corruption themselves, so later attempts always prefer the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
  TrustLocal,
  DistrustLocal,
  Exhausted,
}

/// Maps attempt numbers onto the trust state machine.
#[derive(Debug, Clone, Copy)]
pub struct AttemptSchedule {
  budget: usize,
  trust_local_cache: bool,
}

impl AttemptSchedule {
  pub fn new(budget: usize, trust_local_cache: bool) -> Self {
    Self { budget, trust_local_cache }
  }

  pub fn trust_for(&self, attempt: usize) -> Trust {
    if attempt >= self.budget {
      Trust::Exhausted
    } else if attempt == 0 && self.trust_local_cache {
      Trust::TrustLocal
    } else {
      Trust::DistrustLocal
    }
  }

  pub fn is_final(&self, attempt: usize) -> bool {
    attempt + 1 >= self.budget
  }
}

/// How the worker process is obtained.
pub enum WorkerKind {
  /// Spawn this executable as `index-rpc <parent pid> <channel name>`,
  /// elevated when the game root is not writable.
  Subprocess(PathBuf),
  /// Serve the channel from a task inside this process.
  InProcess(Arc<dyn ChunkCodec>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RepairMode {
  VerifyOnly,
  Repair,
}

/// Built via [`crate::VerifierBuilder`].
pub struct Verifier {
  pub(crate) game_root: PathBuf,
  pub(crate) base_url: Option<String>,
  pub(crate) roaming_dir: PathBuf,
  pub(crate) max_expansion: u8,
  pub(crate) worker: WorkerKind,
  pub(crate) sources: HashMap<PatchSourceKey, PatchSource>,
  pub(crate) trust_local_cache: bool,
  pub(crate) concurrency: u32,
  pub(crate) progress_interval: Duration,
  pub(crate) worker_priority: ProcessPriority,
  pub(crate) progress: Arc<VerifierProgress>,
  pub(crate) state: Mutex<VerifyState>,
  pub(crate) last_error: Mutex<Option<Error>>,
  pub(crate) cancel: CancellationToken,
}

impl Verifier {
  pub fn progress(&self) -> Arc<VerifierProgress> {
    self.progress.clone()
  }

  pub fn state(&self) -> VerifyState {
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// The error that put the verifier into [`VerifyState::Error`], if any.
  pub fn take_last_error(&self) -> Option<Error> {
    match self.last_error.lock() {
      Ok(mut last) => last.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    }
  }

  /// Full online run: resolves the latest versions, then verifies and repairs
  /// every repository in fixed order. Failing one repository stops the run;
  /// later repositories are not attempted.
  pub async fn run(&self) -> VerifyState {
    let result = self.run_online().await;
    self.conclude(result)
  }

  /// Verifies one repository from an already-downloaded index file without
  /// touching anything on disk.
  pub async fn verify_index_file(&self, index_path: &Path) -> VerifyState {
    let result = self.run_index_file(index_path, RepairMode::VerifyOnly).await;
    self.conclude(result)
  }

  /// Verifies and repairs one repository from an already-downloaded index file.
  pub async fn repair_index_file(&self, index_path: &Path) -> VerifyState {
    let result = self.run_index_file(index_path, RepairMode::Repair).await;
    self.conclude(result)
  }

  fn set_state(&self, value: VerifyState) {
    match self.state.lock() {
      Ok(mut state) => *state = value,
      Err(poisoned) => *poisoned.into_inner() = value,
    }
  }

  fn conclude(&self, result: Result<(), Error>) -> VerifyState {
    let state = match result {
      Ok(()) => VerifyState::Done,
      Err(error) if error.is_cancellation() => {
        info!("verification cancelled");
        VerifyState::Cancelled
      },
      Err(error) => {
        warn!("verification failed: {}", error);
        match self.last_error.lock() {
          Ok(mut last) => *last = Some(error),
          Err(poisoned) => *poisoned.into_inner() = Some(error),
        }
        VerifyState::Error
      },
    };
    self.set_state(state);
    state
  }

  async fn run_online(&self) -> Result<(), Error> {
    self.progress.reset();
    self.set_state(VerifyState::Verify);
    let base_url = self.base_url.as_ref()
      .ok_or_else(|| Error::None("no metadata base url configured".to_string()))?;

    let versions = fetch_latest_versions(base_url, self.max_expansion).await?;
    self.progress.repository_count.store(versions.len(), std::sync::atomic::Ordering::Relaxed);

    let remote = self.start_worker().await?;
    let result = self.run_repositories(&remote, base_url, &versions).await;
    let shutdown = remote.shutdown().await;
    result.and(shutdown)
  }

  async fn run_repositories(
    &self,
    remote: &RemoteInstaller,
    base_url: &str,
    versions: &[(Repository, RepositoryVersion)],
  ) -> Result<(), Error> {
    for (repository_index, (repository, latest)) in versions.iter().enumerate() {
      self.cancel.check()?;
      self.progress.repository_index.store(repository_index, std::sync::atomic::Ordering::Relaxed);
      if is_fresh_install(*repository, &self.game_root) {
        debug!("{} has nothing installed, skipping", repository.shorthand());
        continue;
      }
      let index_path = fetch_repo_meta(base_url, &self.roaming_dir, *repository, latest).await?;
      let index_bytes = std::fs::read(&index_path)?;
      let index = PatchIndex::decode(Cursor::new(index_bytes.as_slice()))?;
      self.process_repository(remote, *repository, &index, &index_bytes, Some(&latest.version), RepairMode::Repair).await?;
    }
    Ok(())
  }

  async fn run_index_file(&self, index_path: &Path, mode: RepairMode) -> Result<(), Error> {
    self.progress.reset();
    self.set_state(VerifyState::Verify);
    self.progress.repository_count.store(1, std::sync::atomic::Ordering::Relaxed);

    let index_bytes = std::fs::read(index_path)?;
    let index = PatchIndex::decode(Cursor::new(index_bytes.as_slice()))?;
    let repository = index.repository()?;

    let remote = self.start_worker().await?;
    let result = self.process_repository(&remote, repository, &index, &index_bytes, None, mode).await;
    let shutdown = remote.shutdown().await;
    result.and(shutdown)
  }

  async fn start_worker(&self) -> Result<RemoteInstaller, Error> {
    let remote = match &self.worker {
      WorkerKind::InProcess(codec) => RemoteInstaller::start_in_process(codec.clone()).await?,
      #[cfg(unix)]
      WorkerKind::Subprocess(executable) => {
        let elevated = crate::functions::admin_access_required(&self.game_root)?;
        RemoteInstaller::start(executable, elevated).await?
      },
      #[cfg(not(unix))]
      WorkerKind::Subprocess(_) => {
        return Err(Error::Install("subprocess workers are not supported on this platform".to_string()));
      },
    };
    remote.set_process_priority(self.worker_priority).await?;
    Ok(remote)
  }

  /// One repository's bounded verify and repair loop. Success is only ever
  /// declared off a fresh verify, never off a stale missing-part snapshot.
  async fn process_repository(
    &self,
    remote: &RemoteInstaller,
    repository: Repository,
    index: &PatchIndex,
    index_bytes: &[u8],
    version: Option<&str>,
    mode: RepairMode,
  ) -> Result<(), Error> {
    info!("processing {} ({} targets, {} sources)", repository.shorthand(), index.targets.len(), index.sources.len());
    let _subscription = remote.subscribe_progress(self.progress_sink(index));
    remote.construct_from_index_bytes(index_bytes, self.progress_interval).await?;

    let schedule = AttemptSchedule::new(REATTEMPT_COUNT, self.trust_local_cache);
    for attempt in 0..REATTEMPT_COUNT {
      self.cancel.check()?;
      self.progress.attempt.store(attempt + 1, std::sync::atomic::Ordering::Relaxed);
      let trust = schedule.trust_for(attempt);
      if attempt == 1 && self.trust_local_cache {
        warn!("{} failed verification once, locally cached patches may be corrupt, preferring the network now", repository.shorthand());
      }

      if self.verify_attempt(remote, index, trust).await? {
        info!("{} verified clean on attempt {}", repository.shorthand(), attempt + 1);
        if mode == RepairMode::Repair {
          self.write_stamps(remote, repository, version).await?;
        }
        return Ok(());
      }
      if mode == RepairMode::VerifyOnly {
        info!("{} has {} broken files", repository.shorthand(), self.progress.num_broken_files());
        return Ok(());
      }

      let repair = self.repair_attempt(remote, repository, index, trust).await;
      match repair {
        Ok(()) => {},
        Err(error) if error.is_cancellation() => return Err(error),
        Err(error) if schedule.is_final(attempt) => return Err(error),
        Err(error) => {
          warn!("repair attempt {} for {} failed: {}", attempt + 1, repository.shorthand(), error);
        },
      }
    }

    // Every install reported success but the loop ran out; one last verify
    // decides whether the budget was actually enough.
    if self.verify_attempt(remote, index, Trust::Exhausted).await? {
      if mode == RepairMode::Repair {
        self.write_stamps(remote, repository, version).await?;
      }
      return Ok(());
    }
    Err(Error::Install(format!("{} was not repaired after {} attempts", repository.shorthand(), REATTEMPT_COUNT)))
  }

  /// Runs one verify pass and refreshes the broken-file count. Returns whether
  /// every target reported zero missing parts.
  async fn verify_attempt(&self, remote: &RemoteInstaller, index: &PatchIndex, trust: Trust) -> Result<bool, Error> {
    self.progress.reset_phase(index.targets.len());
    self.progress.set_install_state(InstallTaskState::NotStarted);
    remote.set_target_streams(&self.game_root, TargetStreamMode::ReadOnly).await?;
    remote.verify_files(trust == Trust::TrustLocal, self.concurrency).await?;

    let per_target = remote.missing_parts_per_target().await?;
    let broken = per_target.iter().filter(|parts| !parts.is_empty()).count();
    self.progress.num_broken_files.store(broken, std::sync::atomic::Ordering::Relaxed);
    Ok(broken == 0)
  }

  /// Queues every source with outstanding missing parts and runs the install.
  async fn repair_attempt(
    &self,
    remote: &RemoteInstaller,
    repository: Repository,
    index: &PatchIndex,
    trust: Trust,
  ) -> Result<(), Error> {
    let per_source = remote.missing_parts_per_source().await?;
    remote.set_target_streams(&self.game_root, TargetStreamMode::ReadWriteMissing).await?;
    self.progress.reset_phase(per_source.iter().filter(|parts| !parts.is_empty()).count());

    for (source_index, parts) in per_source.iter().enumerate() {
      if parts.is_empty() {
        continue;
      }
      let key = PatchSourceKey {
        repository,
        file_name: index.sources[source_index].clone(),
      };
      let source = self.sources.get(&key)
        .ok_or_else(|| Error::Install(format!("no patch source registered for {}", key)))?;
      let location = source.location(trust)
        .ok_or_else(|| Error::Install(format!("{} resolves to neither a local file nor a uri", key)))?;
      remote.queue_install(source_index as u16, &location, MAX_CONCURRENT_CONNECTIONS_FOR_PATCH_SET).await?;
    }
    remote.install(MAX_CONCURRENT_CONNECTIONS_FOR_PATCH_SET).await
  }

  async fn write_stamps(&self, remote: &RemoteInstaller, repository: Repository, version: Option<&str>) -> Result<(), Error> {
    let version = match version {
      Some(version) => version,
      None => return Ok(()),
    };
    let subfolder_root = self.game_root.join(repository.subfolder());
    // The repository just verified clean, so the new version is live and the
    // backup copy may be refreshed too.
    remote.write_version_stamps(&subfolder_root, version, true).await
  }

  fn progress_sink(&self, index: &PatchIndex) -> ProgressSink {
    let progress = self.progress.clone();
    let targets: Arc<Vec<String>> = Arc::new(index.targets.iter().map(|target| target.relative_path.clone()).collect());
    let sources: Arc<Vec<String>> = Arc::new(index.sources.clone());
    Arc::new(move |event| match event {
      ProgressEvent::Verify { target_index, progress: done, total } => {
        progress.update(target_index as usize, done, total);
        if let Some(name) = targets.get(target_index as usize) {
          progress.set_current_file(name.clone());
        }
      },
      ProgressEvent::Install { source_index, progress: done, total, state } => {
        progress.update(source_index as usize, done, total);
        progress.set_install_state(state);
        if let Some(name) = sources.get(source_index as usize) {
          progress.set_current_file(name.clone());
        }
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn first_attempt_trusts_the_local_cache() {
    let schedule = AttemptSchedule::new(REATTEMPT_COUNT, true);
    assert_eq!(schedule.trust_for(0), Trust::TrustLocal);
    assert_eq!(schedule.trust_for(1), Trust::DistrustLocal);
    assert_eq!(schedule.trust_for(4), Trust::DistrustLocal);
    assert_eq!(schedule.trust_for(5), Trust::Exhausted);
    assert!(!schedule.is_final(3));
    assert!(schedule.is_final(4));
  }

  #[test]
  fn distrust_can_be_requested_from_the_start() {
    let schedule = AttemptSchedule::new(REATTEMPT_COUNT, false);
    assert_eq!(schedule.trust_for(0), Trust::DistrustLocal);
  }
}
