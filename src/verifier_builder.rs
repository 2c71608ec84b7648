use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::structures::{Error, PatchSource, PatchSourceKey, ProcessPriority, VerifierProgress, VerifyState};
use crate::traits::{ChunkCodec, RawChunkCodec};
use crate::verifier::{Verifier, WorkerKind};

/// Builds a [`Verifier`]. Only the game root is mandatory; by default the
/// worker runs in-process with the raw pass-through codec.
pub struct VerifierBuilder {
  game_root: Option<PathBuf>,
  base_url: Option<String>,
  roaming_dir: Option<PathBuf>,
  max_expansion: u8,
  worker: WorkerKind,
  sources: HashMap<PatchSourceKey, PatchSource>,
  trust_local_cache: bool,
  concurrency: u32,
  progress_interval: Duration,
  worker_priority: ProcessPriority,
}

impl VerifierBuilder {
  pub fn new() -> Self {
    Self {
      game_root: None,
      base_url: None,
      roaming_dir: None,
      max_expansion: 0,
      worker: WorkerKind::InProcess(Arc::new(RawChunkCodec)),
      sources: HashMap::new(),
      trust_local_cache: true,
      concurrency: 0,
      progress_interval: Duration::from_millis(100),
      worker_priority: ProcessPriority::BelowNormal,
    }
  }

  pub fn set_game_root(&mut self, game_root: PathBuf) -> &mut Self {
    self.game_root = Some(game_root);
    self
  }

  /// Metadata server for the online flow; `{base}latest.json` must resolve.
  pub fn set_base_url(&mut self, base_url: String) -> &mut Self {
    self.base_url = Some(base_url);
    self
  }

  /// Where downloaded patch indexes are cached between runs.
  pub fn set_roaming_dir(&mut self, roaming_dir: PathBuf) -> &mut Self {
    self.roaming_dir = Some(roaming_dir);
    self
  }

  /// Highest expansion number to consider during the online flow.
  pub fn set_max_expansion(&mut self, max_expansion: u8) -> &mut Self {
    self.max_expansion = max_expansion;
    self
  }

  /// Delegate file I/O to a separate worker process, elevated when needed.
  pub fn set_worker_executable(&mut self, executable: PathBuf) -> &mut Self {
    self.worker = WorkerKind::Subprocess(executable);
    self
  }

  /// Run the worker inside this process with the given codec.
  pub fn set_in_process_worker(&mut self, codec: Arc<dyn ChunkCodec>) -> &mut Self {
    self.worker = WorkerKind::InProcess(codec);
    self
  }

  pub fn register_source(&mut self, key: PatchSourceKey, source: PatchSource) -> &mut Self {
    self.sources.insert(key, source);
    self
  }

  /// Skip the trusting first attempt and prefer the network from the start.
  pub fn distrust_local_cache(&mut self) -> &mut Self {
    self.trust_local_cache = false;
    self
  }

  /// Concurrent target verifications; zero means the logical core count.
  pub fn set_concurrency(&mut self, concurrency: u32) -> &mut Self {
    self.concurrency = concurrency;
    self
  }

  /// Minimum spacing between progress events pushed by the worker.
  pub fn set_progress_interval(&mut self, progress_interval: Duration) -> &mut Self {
    self.progress_interval = progress_interval;
    self
  }

  pub fn set_worker_priority(&mut self, worker_priority: ProcessPriority) -> &mut Self {
    self.worker_priority = worker_priority;
    self
  }

  pub fn build(self) -> Result<Verifier, Error> {
    let game_root = self.game_root
      .ok_or_else(|| Error::None("no game root configured".to_string()))?;
    let roaming_dir = self.roaming_dir
      .unwrap_or_else(|| std::env::temp_dir().join("indexed-patcher"));
    Ok(Verifier {
      game_root,
      base_url: self.base_url,
      roaming_dir,
      max_expansion: self.max_expansion,
      worker: self.worker,
      sources: self.sources,
      trust_local_cache: self.trust_local_cache,
      concurrency: self.concurrency,
      progress_interval: self.progress_interval,
      worker_priority: self.worker_priority,
      progress: Arc::new(VerifierProgress::new()),
      state: Mutex::new(VerifyState::Unknown),
      last_error: Mutex::new(None),
      cancel: CancellationToken::new(),
    })
  }
}

impl Default for VerifierBuilder {
  fn default() -> Self {
    Self::new()
  }
}
