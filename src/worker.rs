//! The worker side of the channel. Runs either in a separate, possibly
//! elevated process or in-process behind an in-memory channel pair; either
//! way it owns the `LocalInstaller` and answers requests sequentially.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancellation::CancellationToken;
use crate::channel::{ChannelReader, ChannelWriter};
use crate::implementations::rpc as wire;
use crate::installer::{LocalInstaller, ProgressSink};
use crate::structures::{
  Error, Frame, MissingPartGrouping, Opcode, PatchIndex, ProcessPriority, EVENT_CORRELATION_ID,
};
use crate::traits::ChunkCodec;

/// Connects to the named channel and serves it until Bye or until the parent
/// process disappears.
#[cfg(unix)]
pub async fn run(channel_name: &str, parent_pid: Option<u32>, codec: Arc<dyn ChunkCodec>) -> Result<(), Error> {
  let (reader, writer) = crate::channel::connect(channel_name).await?;
  serve(reader, writer, parent_pid, codec).await
}

/// Serves one channel. The first frame written is Hello with the protocol
/// version; afterwards requests are handled one at a time, progress events
/// interleaving with whatever response is in flight.
pub async fn serve(
  mut reader: ChannelReader,
  mut writer: ChannelWriter,
  parent_pid: Option<u32>,
  codec: Arc<dyn ChunkCodec>,
) -> Result<(), Error> {
  let (outgoing, mut pending) = mpsc::unbounded_channel::<Frame>();
  let writer_task = tokio::spawn(async move {
    while let Some(frame) = pending.recv().await {
      if let Err(error) = writer.write_frame(&frame).await {
        debug!("stopped writing to channel: {}", error);
        break;
      }
    }
  });

  let shutdown = CancellationToken::new();
  if let Some(pid) = parent_pid {
    tokio::spawn(watch_parent(pid, shutdown.clone()));
  }

  outgoing.send(Frame::new(Opcode::Hello, EVENT_CORRELATION_ID, wire::encode_hello()))
    .map_err(|_| Error::Channel("channel closed before hello".to_string()))?;

  let events = outgoing.clone();
  let sink: ProgressSink = Arc::new(move |event| {
    if let Ok((opcode, payload)) = wire::encode_progress_event(&event) {
      let _ = events.send(Frame::new(opcode, EVENT_CORRELATION_ID, payload));
    }
  });

  let mut installer: Option<LocalInstaller> = None;
  let result = loop {
    let frame = tokio::select! {
      frame = reader.read_frame() => match frame {
        Ok(frame) => frame,
        Err(error) => {
          shutdown.cancel();
          break Err(error);
        },
      },
      _ = shutdown.cancelled() => {
        info!("parent process is gone, shutting down");
        break Err(Error::Cancelled);
      },
    };

    let bye = frame.opcode == Opcode::Bye;
    let response = handle(&frame, &mut installer, &codec, &sink, &shutdown).await;
    let response = match response {
      Ok(payload) => Frame::new(Opcode::ResponseOk, frame.correlation_id, payload),
      Err(error) => {
        if !error.is_cancellation() {
          warn!("{:?} request failed: {}", frame.opcode, error);
        }
        Frame::new(Opcode::ResponseErr, frame.correlation_id, wire::encode_error(&error)?)
      },
    };
    if outgoing.send(response).is_err() {
      break Err(Error::Channel("channel closed".to_string()));
    }
    if bye {
      break Ok(());
    }
  };

  // The installer's progress sink holds a sender clone; every one must go
  // before the writer task can drain and finish.
  drop(installer);
  drop(sink);
  drop(outgoing);
  let _ = writer_task.await;
  result
}

async fn handle(
  frame: &Frame,
  installer: &mut Option<LocalInstaller>,
  codec: &Arc<dyn ChunkCodec>,
  sink: &ProgressSink,
  shutdown: &CancellationToken,
) -> Result<Vec<u8>, Error> {
  match frame.opcode {
    Opcode::ConstructFromIndex => {
      let (progress_interval, index_bytes) = wire::decode_construct(&frame.payload)?;
      let index = PatchIndex::decode(std::io::Cursor::new(index_bytes))?;
      info!("constructed installer for {} targets from {} sources", index.targets.len(), index.sources.len());
      let mut constructed = LocalInstaller::new(Arc::new(index), progress_interval, codec.clone());
      constructed.set_progress_sink(sink.clone());
      *installer = Some(constructed);
      Ok(Vec::new())
    },
    Opcode::SetTargetStreams => {
      let (mode, root) = wire::decode_set_target_streams(&frame.payload)?;
      require(installer)?.set_target_streams(&root, mode).await?;
      Ok(Vec::new())
    },
    Opcode::VerifyFiles => {
      let (trust_local_cache, concurrency) = wire::decode_verify(&frame.payload)?;
      require(installer)?.verify(trust_local_cache, concurrency as usize, shutdown).await?;
      Ok(Vec::new())
    },
    Opcode::GetMissingParts => {
      let grouping = wire::decode_missing_request(&frame.payload)?;
      let installer = require(installer)?;
      match grouping {
        MissingPartGrouping::PerTarget => wire::encode_missing_per_target(&installer.missing_parts_per_target()),
        MissingPartGrouping::PerSource => wire::encode_missing_per_source(&installer.missing_parts_per_source()),
      }
    },
    Opcode::QueueInstall => {
      let (source_index, location, max_connections) = wire::decode_queue_install(&frame.payload)?;
      require(installer)?.queue_install(source_index, location, max_connections as usize)?;
      Ok(Vec::new())
    },
    Opcode::Install => {
      let max_connections = wire::decode_install(&frame.payload)?;
      require(installer)?.install(max_connections as usize, shutdown).await?;
      Ok(Vec::new())
    },
    Opcode::WriteVersionStamps => {
      let (root, version, with_backup) = wire::decode_write_version_stamps(&frame.payload)?;
      require(installer)?.write_version_stamps(&root, &version, with_backup)?;
      Ok(Vec::new())
    },
    Opcode::SetProcessPriority => {
      let value = *frame.payload.first()
        .ok_or_else(|| Error::Channel("priority payload is empty".to_string()))?;
      apply_priority(ProcessPriority::from_u8(value)?);
      Ok(Vec::new())
    },
    Opcode::Bye => Ok(Vec::new()),
    other => Err(Error::Channel(format!("{:?} is not a request", other))),
  }
}

fn require(installer: &mut Option<LocalInstaller>) -> Result<&mut LocalInstaller, Error> {
  installer.as_mut()
    .ok_or_else(|| Error::Install("no installer has been constructed on this channel".to_string()))
}

async fn watch_parent(pid: u32, shutdown: CancellationToken) {
  let mut interval = tokio::time::interval(Duration::from_secs(1));
  loop {
    tokio::select! {
      _ = interval.tick() => {
        if !process_alive(pid) {
          shutdown.cancel();
          return;
        }
      },
      _ = shutdown.cancelled() => return,
    }
  }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
  let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
  result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
  true
}

#[cfg(unix)]
fn apply_priority(priority: ProcessPriority) {
  let nice = match priority {
    ProcessPriority::Idle => 19,
    ProcessPriority::BelowNormal => 10,
    ProcessPriority::Normal => 0,
  };
  let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
  if result != 0 {
    warn!("lowering process priority to nice {} failed: {}", nice, std::io::Error::last_os_error());
  } else {
    debug!("process priority set to nice {}", nice);
  }
}

#[cfg(not(unix))]
fn apply_priority(_priority: ProcessPriority) {}
