//! Caller-side proxy for the worker. Owns the channel, correlates responses
//! to requests and fans progress events out to subscribers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::channel::{ChannelReader, ChannelWriter};
use crate::implementations::rpc as wire;
use crate::installer::ProgressSink;
use crate::structures::{
  Error, Frame, InstallLocation, MissingPartGrouping, Opcode, PatchIndex, ProcessPriority,
  TargetStreamMode, EVENT_CORRELATION_ID, PROTOCOL_VERSION,
};
use crate::traits::ChunkCodec;

/// How long the worker gets to connect back before the launch counts as
/// declined or failed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Vec<u8>, Error>>>>>;
type Subscribers = Arc<Mutex<HashMap<u64, ProgressSink>>>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(poisoned) => poisoned.into_inner(),
  }
}

/// Detaches its progress sink when dropped, so a caller can scope event
/// delivery to one verify or install pass.
pub struct ProgressSubscription {
  id: u64,
  subscribers: Subscribers,
}

impl Drop for ProgressSubscription {
  fn drop(&mut self) {
    lock(&self.subscribers).remove(&self.id);
  }
}

pub struct RemoteInstaller {
  requests: mpsc::UnboundedSender<Frame>,
  pending: Pending,
  subscribers: Subscribers,
  next_correlation: AtomicU32,
  next_subscription: AtomicU64,
  worker: Option<tokio::task::JoinHandle<()>>,
}

impl RemoteInstaller {
  /// Spawns the worker executable as `index-rpc <parent pid> <channel name>`
  /// and waits for it to connect back. An elevated launch that the user
  /// declines at the prompt surfaces as cancellation.
  #[cfg(unix)]
  pub async fn start(executable: &Path, elevated: bool) -> Result<Self, Error> {
    let channel_name = format!("indexed-patcher-{}", uuid::Uuid::new_v4());
    let listener = crate::channel::ChannelListener::bind(&channel_name)?;
    let parent_pid = std::process::id();

    let (exit_sender, exit_receiver) = oneshot::channel::<bool>();
    let worker = if elevated {
      info!("launching elevated worker {}", executable.display());
      let executable = executable.to_path_buf();
      let channel_name = channel_name.clone();
      tokio::task::spawn_blocking(move || {
        let status = runas::Command::new(executable)
          .arg("index-rpc")
          .arg(parent_pid.to_string())
          .arg(channel_name)
          .gui(true)
          .status();
        let success = matches!(status, Ok(status) if status.success());
        let _ = exit_sender.send(success);
      })
    } else {
      info!("launching worker {}", executable.display());
      let mut child = tokio::process::Command::new(executable)
        .arg("index-rpc")
        .arg(parent_pid.to_string())
        .arg(&channel_name)
        .spawn()?;
      tokio::spawn(async move {
        let status = child.wait().await;
        let success = matches!(status, Ok(status) if status.success());
        let _ = exit_sender.send(success);
      })
    };

    let accepted = tokio::select! {
      accepted = tokio::time::timeout(CONNECT_TIMEOUT, listener.accept()) => {
        accepted.map_err(|_| Error::Channel("worker did not connect in time".to_string()))?
      },
      _ = exit_receiver => {
        // Exiting before connecting means the launch failed or the elevation
        // prompt was dismissed.
        warn!("worker exited before connecting");
        return Err(Error::Cancelled);
      },
    };
    let (reader, writer) = accepted?;
    Self::from_channel(reader, writer, Some(worker)).await
  }

  /// Runs the worker inside this process over an in-memory channel. Used when
  /// no elevation is needed, and by tests.
  pub async fn start_in_process(codec: Arc<dyn ChunkCodec>) -> Result<Self, Error> {
    let ((near_reader, near_writer), (far_reader, far_writer)) = crate::channel::pair();
    let worker = tokio::spawn(async move {
      if let Err(error) = crate::worker::serve(far_reader, far_writer, None, codec).await {
        if !error.is_cancellation() {
          warn!("in-process worker stopped: {}", error);
        }
      }
    });
    Self::from_channel(near_reader, near_writer, Some(worker)).await
  }

  async fn from_channel(
    mut reader: ChannelReader,
    mut writer: ChannelWriter,
    worker: Option<tokio::task::JoinHandle<()>>,
  ) -> Result<Self, Error> {
    let hello = reader.read_frame().await?;
    if hello.opcode != Opcode::Hello {
      return Err(Error::Channel(format!("expected hello, got {:?}", hello.opcode)));
    }
    let version = wire::decode_hello(&hello.payload)?;
    if version != PROTOCOL_VERSION {
      return Err(Error::Channel(format!("worker speaks protocol {} but {} is required", version, PROTOCOL_VERSION)));
    }
    debug!("worker connected with protocol {}", version);

    let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
    let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));

    let (requests, mut outgoing) = mpsc::unbounded_channel::<Frame>();
    tokio::spawn(async move {
      while let Some(frame) = outgoing.recv().await {
        if writer.write_frame(&frame).await.is_err() {
          break;
        }
      }
    });

    let dispatch_pending = pending.clone();
    let dispatch_subscribers = subscribers.clone();
    tokio::spawn(async move {
      loop {
        let frame = match reader.read_frame().await {
          Ok(frame) => frame,
          Err(error) => {
            let waiters: Vec<_> = lock(&dispatch_pending).drain().map(|(_, sender)| sender).collect();
            for waiter in waiters {
              let _ = waiter.send(Err(Error::Channel(error.to_string())));
            }
            return;
          },
        };
        if frame.correlation_id == EVENT_CORRELATION_ID {
          if let Ok(event) = wire::decode_progress_event(frame.opcode, &frame.payload) {
            let sinks: Vec<_> = lock(&dispatch_subscribers).values().cloned().collect();
            for sink in sinks {
              sink(event);
            }
          }
          continue;
        }
        let waiter = lock(&dispatch_pending).remove(&frame.correlation_id);
        if let Some(waiter) = waiter {
          let result = match frame.opcode {
            Opcode::ResponseOk => Ok(frame.payload),
            Opcode::ResponseErr => Err(wire::decode_error(&frame.payload).unwrap_or_else(|error| error)),
            other => Err(Error::Channel(format!("unexpected {:?} response", other))),
          };
          let _ = waiter.send(result);
        }
      }
    });

    Ok(Self {
      requests,
      pending,
      subscribers,
      next_correlation: AtomicU32::new(1),
      next_subscription: AtomicU64::new(1),
      worker,
    })
  }

  /// Registers a progress sink; events stop when the returned guard drops.
  pub fn subscribe_progress(&self, sink: ProgressSink) -> ProgressSubscription {
    let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
    lock(&self.subscribers).insert(id, sink);
    ProgressSubscription { id, subscribers: self.subscribers.clone() }
  }

  async fn request(&self, opcode: Opcode, payload: Vec<u8>) -> Result<Vec<u8>, Error> {
    let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
    let (sender, receiver) = oneshot::channel();
    lock(&self.pending).insert(correlation_id, sender);
    if self.requests.send(Frame::new(opcode, correlation_id, payload)).is_err() {
      lock(&self.pending).remove(&correlation_id);
      return Err(Error::Channel("worker channel closed".to_string()));
    }
    receiver.await.map_err(|_| Error::Channel("worker channel closed".to_string()))?
  }

  pub async fn construct_from_index(&self, index: &PatchIndex, progress_interval: Duration) -> Result<(), Error> {
    let mut buffer = Vec::new();
    index.encode(&mut buffer)?;
    self.construct_from_index_bytes(&buffer, progress_interval).await
  }

  pub async fn construct_from_index_bytes(&self, index_bytes: &[u8], progress_interval: Duration) -> Result<(), Error> {
    self.request(Opcode::ConstructFromIndex, wire::encode_construct(index_bytes, progress_interval)).await?;
    Ok(())
  }

  pub async fn set_target_streams(&self, root: &Path, mode: TargetStreamMode) -> Result<(), Error> {
    let payload = wire::encode_set_target_streams(mode, &root.to_string_lossy())?;
    self.request(Opcode::SetTargetStreams, payload).await?;
    Ok(())
  }

  pub async fn verify_files(&self, trust_local_cache: bool, concurrency: u32) -> Result<(), Error> {
    self.request(Opcode::VerifyFiles, wire::encode_verify(trust_local_cache, concurrency)?).await?;
    Ok(())
  }

  pub async fn missing_parts_per_target(&self) -> Result<Vec<Vec<u32>>, Error> {
    let payload = self.request(Opcode::GetMissingParts, wire::encode_missing_request(MissingPartGrouping::PerTarget)).await?;
    wire::decode_missing_per_target(&payload)
  }

  pub async fn missing_parts_per_source(&self) -> Result<Vec<Vec<(u32, u32)>>, Error> {
    let payload = self.request(Opcode::GetMissingParts, wire::encode_missing_request(MissingPartGrouping::PerSource)).await?;
    wire::decode_missing_per_source(&payload)
  }

  pub async fn queue_install(&self, source_index: u16, location: &InstallLocation, max_connections: u32) -> Result<(), Error> {
    self.request(Opcode::QueueInstall, wire::encode_queue_install(source_index, location, max_connections)?).await?;
    Ok(())
  }

  pub async fn install(&self, max_connections: u32) -> Result<(), Error> {
    self.request(Opcode::Install, wire::encode_install(max_connections)?).await?;
    Ok(())
  }

  pub async fn write_version_stamps(&self, subfolder_root: &Path, version: &str, with_backup: bool) -> Result<(), Error> {
    let payload = wire::encode_write_version_stamps(&subfolder_root.to_string_lossy(), version, with_backup)?;
    self.request(Opcode::WriteVersionStamps, payload).await?;
    Ok(())
  }

  pub async fn set_process_priority(&self, priority: ProcessPriority) -> Result<(), Error> {
    self.request(Opcode::SetProcessPriority, vec![priority.to_u8()]).await?;
    Ok(())
  }

  /// Says goodbye and waits for the worker to wind down.
  pub async fn shutdown(mut self) -> Result<(), Error> {
    self.request(Opcode::Bye, Vec::new()).await?;
    if let Some(worker) = self.worker.take() {
      let _ = worker.await;
    }
    Ok(())
  }
}
