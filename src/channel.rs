//! Framed transport between the caller and the worker process. Frames are a
//! u32 little-endian length prefix followed by the encoded message.

use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::structures::{Error, Frame};

/// Upper bound on a single frame; a serialized patch index fits well below
/// this, anything larger is a corrupt stream.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub struct ChannelReader {
  inner: Box<dyn AsyncRead + Send + Unpin>,
}

pub struct ChannelWriter {
  inner: Box<dyn AsyncWrite + Send + Unpin>,
}

impl ChannelReader {
  fn new(inner: Box<dyn AsyncRead + Send + Unpin>) -> Self {
    Self { inner }
  }

  /// Reads the next frame. A clean close of the peer surfaces as a channel
  /// error since the protocol ends with an acknowledged Bye, not an EOF.
  pub async fn read_frame(&mut self) -> Result<Frame, Error> {
    let mut length = [0u8; 4];
    self.inner.read_exact(&mut length).await.map_err(closed)?;
    let length = u32::from_le_bytes(length) as usize;
    if !(5..=MAX_FRAME_LEN).contains(&length) {
      return Err(Error::Channel(format!("frame length {} is out of range", length)));
    }
    let mut buffer = vec![0u8; length];
    self.inner.read_exact(&mut buffer).await.map_err(closed)?;
    Frame::decode(&buffer)
  }
}

impl ChannelWriter {
  fn new(inner: Box<dyn AsyncWrite + Send + Unpin>) -> Self {
    Self { inner }
  }

  pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), Error> {
    let encoded = frame.encode();
    self.inner.write_all(&(encoded.len() as u32).to_le_bytes()).await.map_err(closed)?;
    self.inner.write_all(&encoded).await.map_err(closed)?;
    self.inner.flush().await.map_err(closed)?;
    Ok(())
  }
}

fn closed(error: std::io::Error) -> Error {
  match error.kind() {
    std::io::ErrorKind::UnexpectedEof | std::io::ErrorKind::BrokenPipe => {
      Error::Channel("channel closed by peer".to_string())
    },
    _ => Error::Channel(format!("channel transport failed: {}", error)),
  }
}

fn socket_path(name: &str) -> PathBuf {
  std::env::temp_dir().join(format!("{}.sock", name))
}

/// Listening end of the channel, owned by the caller before it spawns the
/// worker. The socket file is removed again on drop.
#[cfg(unix)]
pub struct ChannelListener {
  listener: tokio::net::UnixListener,
  path: PathBuf,
}

#[cfg(unix)]
impl ChannelListener {
  pub fn bind(name: &str) -> Result<Self, Error> {
    let path = socket_path(name);
    if path.exists() {
      std::fs::remove_file(&path)?;
    }
    let listener = tokio::net::UnixListener::bind(&path)
      .map_err(|error| Error::Channel(format!("binding {} failed: {}", path.display(), error)))?;
    debug!("listening on {}", path.display());
    Ok(Self { listener, path })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub async fn accept(&self) -> Result<(ChannelReader, ChannelWriter), Error> {
    let (stream, _) = self.listener.accept().await
      .map_err(|error| Error::Channel(format!("accepting on {} failed: {}", self.path.display(), error)))?;
    let (read, write) = stream.into_split();
    Ok((ChannelReader::new(Box::new(read)), ChannelWriter::new(Box::new(write))))
  }
}

#[cfg(unix)]
impl Drop for ChannelListener {
  fn drop(&mut self) {
    let _ = std::fs::remove_file(&self.path);
  }
}

/// Connects the worker side of a named channel.
#[cfg(unix)]
pub async fn connect(name: &str) -> Result<(ChannelReader, ChannelWriter), Error> {
  let path = socket_path(name);
  let stream = tokio::net::UnixStream::connect(&path).await
    .map_err(|error| Error::Channel(format!("connecting to {} failed: {}", path.display(), error)))?;
  let (read, write) = stream.into_split();
  Ok((ChannelReader::new(Box::new(read)), ChannelWriter::new(Box::new(write))))
}

/// An in-memory channel pair for running the worker inside the caller's
/// process, mainly for tests and unelevated repairs.
pub fn pair() -> ((ChannelReader, ChannelWriter), (ChannelReader, ChannelWriter)) {
  let (near, far) = tokio::io::duplex(MAX_FRAME_LEN);
  let (near_read, near_write) = tokio::io::split(near);
  let (far_read, far_write) = tokio::io::split(far);
  (
    (ChannelReader::new(Box::new(near_read)), ChannelWriter::new(Box::new(near_write))),
    (ChannelReader::new(Box::new(far_read)), ChannelWriter::new(Box::new(far_write))),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::structures::Opcode;

  #[tokio::test]
  async fn frames_survive_the_in_memory_pair() {
    let ((mut near_read, mut near_write), (mut far_read, mut far_write)) = pair();
    let request = Frame::new(Opcode::VerifyFiles, 7, vec![1, 0, 0, 0, 0]);
    near_write.write_frame(&request).await.unwrap();
    assert_eq!(far_read.read_frame().await.unwrap(), request);

    let response = Frame::new(Opcode::ResponseOk, 7, vec![]);
    far_write.write_frame(&response).await.unwrap();
    assert_eq!(near_read.read_frame().await.unwrap(), response);
  }

  #[tokio::test]
  async fn closed_peer_is_a_channel_error() {
    let ((mut near_read, _near_write), (_, far_write)) = pair();
    drop(far_write);
    assert!(matches!(near_read.read_frame().await, Err(Error::Channel(_))));
  }

  #[tokio::test]
  async fn oversized_length_prefix_is_rejected() {
    let (near, far) = tokio::io::duplex(64);
    let (read, _write) = tokio::io::split(near);
    let mut reader = ChannelReader::new(Box::new(read));

    let (_far_read, mut far_write) = tokio::io::split(far);
    far_write.write_all(&(u32::MAX).to_le_bytes()).await.unwrap();

    assert!(matches!(reader.read_frame().await, Err(Error::Channel(_))));
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn unix_socket_round_trip_and_cleanup() {
    let name = format!("indexed-patcher-test-{}", std::process::id());
    let listener = ChannelListener::bind(&name).unwrap();
    let path = listener.path().to_path_buf();

    let accept = listener.accept();
    let connect = connect(&name);
    let (accepted, connected) = tokio::join!(accept, connect);
    let (mut server_read, _server_write) = accepted.unwrap();
    let (_client_read, mut client_write) = connected.unwrap();

    let frame = Frame::new(Opcode::Bye, 1, vec![]);
    client_write.write_frame(&frame).await.unwrap();
    assert_eq!(server_read.read_frame().await.unwrap(), frame);

    drop(listener);
    assert!(!path.exists());
  }
}
