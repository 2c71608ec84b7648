//! The local verify/install engine. Operates on byte-range parts of target
//! files: verify finds the parts whose content diverges from the index,
//! install re-applies only those parts from their owning patch sources.

use std::collections::{BTreeMap, BTreeSet};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{info, trace};

use crate::cancellation::CancellationToken;
use crate::functions::download_ranges::download_range;
use crate::functions::get_hash::{hash_bytes, hash_hex};
use crate::structures::{
  Error, InstallLocation, InstallTaskState, PatchIndex, Part, ProgressEvent, TargetFile,
  TargetStreamMode,
};
use crate::traits::ChunkCodec;

pub type ProgressSink = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

struct QueuedInstall {
  location: InstallLocation,
  max_connections: usize,
}

/// One missing part's repair work: the part, its serialized target handle and
/// the target path for error reporting.
struct InstallItem {
  part: Part,
  handle: Arc<Mutex<tokio::fs::File>>,
  target_path: String,
}

/// Gates progress events to the caller-set minimum interval. Spacing is not
/// guaranteed uniform.
struct Throttle {
  interval: Duration,
  last: StdMutex<Option<Instant>>,
}

impl Throttle {
  fn new(interval: Duration) -> Self {
    Self { interval, last: StdMutex::new(None) }
  }

  fn allow(&self) -> bool {
    let mut last = match self.last.lock() {
      Ok(last) => last,
      Err(poisoned) => poisoned.into_inner(),
    };
    let now = Instant::now();
    match *last {
      Some(previous) if now.duration_since(previous) < self.interval => false,
      _ => {
        *last = Some(now);
        true
      },
    }
  }
}

fn emit(sink: Option<&ProgressSink>, throttle: &Throttle, event: ProgressEvent) {
  if let Some(sink) = sink {
    if throttle.allow() {
      sink(event);
    }
  }
}

fn emit_unthrottled(sink: Option<&ProgressSink>, event: ProgressEvent) {
  if let Some(sink) = sink {
    sink(event);
  }
}

pub struct LocalInstaller {
  index: Arc<PatchIndex>,
  progress_interval: Duration,
  codec: Arc<dyn ChunkCodec>,
  progress_sink: Option<ProgressSink>,
  targets: Vec<Option<Arc<Mutex<tokio::fs::File>>>>,
  missing: Vec<BTreeSet<usize>>,
  queued: BTreeMap<usize, QueuedInstall>,
  trust_local_cache: bool,
}

impl LocalInstaller {
  pub fn new(index: Arc<PatchIndex>, progress_interval: Duration, codec: Arc<dyn ChunkCodec>) -> Self {
    let target_count = index.targets.len();
    Self {
      index,
      progress_interval,
      codec,
      progress_sink: None,
      targets: vec![None; target_count],
      missing: vec![BTreeSet::new(); target_count],
      queued: BTreeMap::new(),
      trust_local_cache: true,
    }
  }

  pub fn index(&self) -> &Arc<PatchIndex> {
    &self.index
  }

  /// Whether the last verify was told to still trust locally cached patch
  /// files when resolving sources.
  pub fn local_cache_trusted(&self) -> bool {
    self.trust_local_cache
  }

  pub fn set_progress_sink(&mut self, sink: ProgressSink) {
    self.progress_sink = Some(sink);
  }

  /// Points target streams at the installation. `ReadOnly` opens whatever
  /// exists; `ReadWriteMissing` re-opens, creates and sizes only the targets
  /// that still have missing parts.
  pub async fn set_target_streams(&mut self, root: &Path, mode: TargetStreamMode) -> Result<(), Error> {
    for (target_index, target) in self.index.targets.iter().enumerate() {
      let path = root.join(&target.relative_path);
      self.targets[target_index] = match mode {
        TargetStreamMode::ReadOnly => {
          match OpenOptions::new().read(true).open(&path).await {
            Ok(file) => Some(Arc::new(Mutex::new(file))),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
            Err(error) => return Err(error.into()),
          }
        },
        TargetStreamMode::ReadWriteMissing => {
          if self.missing[target_index].is_empty() {
            None
          } else {
            if let Some(parent) = path.parent() {
              tokio::fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new().read(true).write(true).create(true).open(&path).await?;
            if file.metadata().await?.len() != target.file_size {
              file.set_len(target.file_size).await?;
            }
            Some(Arc::new(Mutex::new(file)))
          }
        },
      };
    }
    Ok(())
  }

  /// Verifies every target against the index and records the diverging parts.
  /// Targets are verified concurrently up to `concurrency`, parts within one
  /// target sequentially for read locality. A cancelled verify leaves the
  /// missing sets in an undefined state; callers retry rather than resume.
  pub async fn verify(&mut self, trust_local_cache: bool, concurrency: usize, cancel: &CancellationToken) -> Result<(), Error> {
    self.trust_local_cache = trust_local_cache;
    self.queued.clear();
    let concurrency = if concurrency == 0 { num_cpus::get() } else { concurrency };
    let bytes_total = self.index.total_size();
    let bytes_done = Arc::new(AtomicU64::new(0));
    let throttle = Arc::new(Throttle::new(self.progress_interval));

    let mut jobs = Vec::with_capacity(self.index.targets.len());
    for (target_index, target) in self.index.targets.iter().enumerate() {
      let target = target.clone();
      let handle = self.targets[target_index].clone();
      let bytes_done = bytes_done.clone();
      let throttle = throttle.clone();
      let sink = self.progress_sink.clone();
      let cancel = cancel.clone();
      jobs.push(async move {
        let missing = verify_target(target_index, &target, handle, &bytes_done, bytes_total, &throttle, sink.as_ref(), &cancel).await?;
        Ok::<(usize, BTreeSet<usize>), Error>((target_index, missing))
      });
    }

    let mut results = futures::stream::iter(jobs).buffer_unordered(concurrency);
    while let Some(result) = results.next().await {
      let (target_index, missing) = result?;
      self.missing[target_index] = missing;
    }
    drop(results);

    emit_unthrottled(self.progress_sink.as_ref(), ProgressEvent::Verify {
      target_index: self.index.targets.len().saturating_sub(1) as u32,
      progress: bytes_done.load(Ordering::Relaxed),
      total: bytes_total,
    });
    Ok(())
  }

  /// Missing part indices per target file, in target order.
  pub fn missing_parts_per_target(&self) -> Vec<Vec<u32>> {
    self.missing.iter()
      .map(|parts| parts.iter().map(|part| *part as u32).collect())
      .collect()
  }

  /// Missing `(target, part)` pairs grouped by the source that repairs them.
  pub fn missing_parts_per_source(&self) -> Vec<Vec<(u32, u32)>> {
    let mut missing = vec![Vec::new(); self.index.sources.len()];
    for (target_index, parts) in self.missing.iter().enumerate() {
      for part_index in parts {
        let source = self.index.targets[target_index].parts[*part_index].source_index as usize;
        missing[source].push((target_index as u32, *part_index as u32));
      }
    }
    missing
  }

  pub fn has_missing_parts(&self) -> bool {
    self.missing.iter().any(|parts| !parts.is_empty())
  }

  pub fn queue_install(&mut self, source_index: u16, location: InstallLocation, max_connections: usize) -> Result<(), Error> {
    let source = self.index.sources.get(source_index as usize)
      .ok_or_else(|| Error::Install(format!("source index {} is out of range", source_index)))?;
    info!("queued install of {} from {:?}", source, location);
    self.queued.insert(source_index as usize, QueuedInstall { location, max_connections });
    Ok(())
  }

  /// Applies every queued source to the parts currently marked missing.
  /// Sources install concurrently; writes to one target file are serialized.
  /// Installing does not certify repair, only a subsequent verify does.
  pub async fn install(&mut self, max_connections: usize, cancel: &CancellationToken) -> Result<(), Error> {
    let queued = std::mem::take(&mut self.queued);
    if queued.is_empty() {
      return Ok(());
    }
    let per_source = self.missing_parts_per_source();
    let bytes_total: u64 = queued.keys()
      .flat_map(|source| per_source[*source].iter())
      .map(|(target, part)| self.index.targets[*target as usize].parts[*part as usize].source_size as u64)
      .sum();
    let bytes_done = Arc::new(AtomicU64::new(0));
    let throttle = Arc::new(Throttle::new(self.progress_interval));

    let mut jobs = Vec::with_capacity(queued.len());
    for (source_index, install) in queued {
      let mut items = Vec::with_capacity(per_source[source_index].len());
      for (target, part) in &per_source[source_index] {
        let target_file = &self.index.targets[*target as usize];
        let handle = self.targets[*target as usize].clone()
          .ok_or_else(|| Error::Install(format!("target stream for {} is not open", target_file.relative_path)))?;
        items.push(InstallItem {
          part: target_file.parts[*part as usize].clone(),
          handle,
          target_path: target_file.relative_path.clone(),
        });
      }
      let connections = install.max_connections.min(max_connections).max(1);
      jobs.push(install_source(
        source_index,
        self.index.sources[source_index].clone(),
        install.location,
        items,
        connections,
        self.codec.clone(),
        self.progress_sink.clone(),
        throttle.clone(),
        bytes_done.clone(),
        bytes_total,
        cancel.clone(),
      ));
    }

    let concurrency = jobs.len().max(1);
    let mut results = futures::stream::iter(jobs).buffer_unordered(concurrency);
    while let Some(result) = results.next().await {
      result?;
    }
    Ok(())
  }

  /// Stamps the installed version for the index's repository under the given
  /// subfolder root, written only after a successful install pass.
  pub fn write_version_stamps(&self, subfolder_root: &Path, version: &str, with_backup: bool) -> Result<(), Error> {
    self.index.repository()?.write_version_stamp(subfolder_root, version, with_backup)
  }
}

async fn verify_target(
  target_index: usize,
  target: &TargetFile,
  handle: Option<Arc<Mutex<tokio::fs::File>>>,
  bytes_done: &AtomicU64,
  bytes_total: u64,
  throttle: &Throttle,
  sink: Option<&ProgressSink>,
  cancel: &CancellationToken,
) -> Result<BTreeSet<usize>, Error> {
  let mut missing = BTreeSet::new();
  let handle = match handle {
    Some(handle) => handle,
    None => {
      missing.extend(0..target.parts.len());
      let progress = bytes_done.fetch_add(target.file_size, Ordering::Relaxed) + target.file_size;
      emit(sink, throttle, ProgressEvent::Verify { target_index: target_index as u32, progress, total: bytes_total });
      return Ok(missing);
    },
  };

  let mut file = handle.lock().await;
  let mut buffer = Vec::new();
  for (part_index, part) in target.parts.iter().enumerate() {
    cancel.check()?;
    buffer.resize(part.length as usize, 0);
    file.seek(SeekFrom::Start(part.target_offset)).await?;
    let matches = match file.read_exact(&mut buffer).await {
      Ok(_) => hash_bytes(&buffer) == part.hash,
      Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => false,
      Err(error) => return Err(error.into()),
    };
    if !matches {
      trace!("{}: part {} diverges, content hash {}", target.relative_path, part_index, hash_hex(&buffer));
      missing.insert(part_index);
    }
    let progress = bytes_done.fetch_add(part.length as u64, Ordering::Relaxed) + part.length as u64;
    emit(sink, throttle, ProgressEvent::Verify { target_index: target_index as u32, progress, total: bytes_total });
  }
  Ok(missing)
}

#[allow(clippy::too_many_arguments)]
async fn install_source(
  source_index: usize,
  source_name: String,
  location: InstallLocation,
  mut items: Vec<InstallItem>,
  max_connections: usize,
  codec: Arc<dyn ChunkCodec>,
  sink: Option<ProgressSink>,
  throttle: Arc<Throttle>,
  bytes_done: Arc<AtomicU64>,
  bytes_total: u64,
  cancel: CancellationToken,
) -> Result<(), Error> {
  items.sort_by_key(|item| item.part.source_offset);
  let state_event = |progress: u64, state: InstallTaskState| ProgressEvent::Install {
    source_index: source_index as u32,
    progress,
    total: bytes_total,
    state,
  };
  emit_unthrottled(sink.as_ref(), state_event(bytes_done.load(Ordering::Relaxed), InstallTaskState::Connecting));

  match location {
    InstallLocation::Local(path) => {
      let mut source = tokio::fs::File::open(&path).await
        .map_err(|error| Error::Install(format!("patch source {} ({}) could not be opened: {}", source_name, path.display(), error)))?;
      emit_unthrottled(sink.as_ref(), state_event(bytes_done.load(Ordering::Relaxed), InstallTaskState::WaitingForReady));
      for item in items {
        cancel.check()?;
        let mut record = vec![0u8; item.part.source_size as usize];
        source.seek(SeekFrom::Start(item.part.source_offset)).await
          .map_err(|error| Error::Install(format!("seeking in patch source {} failed: {}", source_name, error)))?;
        source.read_exact(&mut record).await
          .map_err(|error| Error::Install(format!("reading {} bytes at {} of patch source {} failed: {}",
            item.part.source_size, item.part.source_offset, source_name, error)))?;
        let progress = apply_item(&item, &record, &codec, &bytes_done).await?;
        emit(sink.as_ref(), &throttle, state_event(progress, InstallTaskState::Installing));
      }
    },
    InstallLocation::Remote(uri) => {
      url::Url::parse(&uri)
        .map_err(|error| Error::Install(format!("patch source {} has an unusable uri {}: {}", source_name, uri, error)))?;
      emit_unthrottled(sink.as_ref(), state_event(bytes_done.load(Ordering::Relaxed), InstallTaskState::Downloading));
      let fetches = items.into_iter().map(|item| {
        let uri = uri.clone();
        let source_name = source_name.clone();
        async move {
          let record = if item.part.source_size == 0 {
            Vec::new()
          } else {
            let from = item.part.source_offset;
            let to = from + item.part.source_size as u64 - 1;
            download_range(&uri, from, to).await
              .map_err(|error| Error::Install(format!("fetching bytes {}-{} of {} failed: {}", from, to, source_name, error)))?
          };
          if record.len() != item.part.source_size as usize {
            return Err(Error::Install(format!("range fetch of {} returned {} bytes instead of {}",
              source_name, record.len(), item.part.source_size)));
          }
          Ok::<(InstallItem, Vec<u8>), Error>((item, record))
        }
      });
      let mut records = futures::stream::iter(fetches).buffer_unordered(max_connections);
      while let Some(result) = records.next().await {
        cancel.check()?;
        let (item, record) = result?;
        let progress = apply_item(&item, &record, &codec, &bytes_done).await?;
        emit(sink.as_ref(), &throttle, state_event(progress, InstallTaskState::Installing));
      }
    },
  }

  emit_unthrottled(sink.as_ref(), state_event(bytes_done.load(Ordering::Relaxed), InstallTaskState::Done));
  Ok(())
}

/// Decodes one record and writes it at the part's target offset while holding
/// that target's write lock.
async fn apply_item(
  item: &InstallItem,
  record: &[u8],
  codec: &Arc<dyn ChunkCodec>,
  bytes_done: &AtomicU64,
) -> Result<u64, Error> {
  let decoded = codec.decode_chunk(record, item.part.length).await?;
  if decoded.len() != item.part.length as usize {
    return Err(Error::Install(format!("codec produced {} bytes for a {} byte part of {}",
      decoded.len(), item.part.length, item.target_path)));
  }
  let mut file = item.handle.lock().await;
  file.seek(SeekFrom::Start(item.part.target_offset)).await?;
  file.write_all(&decoded).await?;
  file.flush().await?;
  Ok(bytes_done.fetch_add(item.part.source_size as u64, Ordering::Relaxed) + item.part.source_size as u64)
}
