use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

use crate::functions::binary::*;
use crate::structures::{
  Error, Frame, InstallLocation, InstallTaskState, MissingPartGrouping, Opcode, ProcessPriority,
  ProgressEvent, TargetStreamMode,
};

impl Opcode {
  pub(crate) fn from_u8(value: u8) -> Result<Self, Error> {
    match value {
      0x00 => Ok(Self::Hello),
      0x01 => Ok(Self::ConstructFromIndex),
      0x02 => Ok(Self::SetTargetStreams),
      0x03 => Ok(Self::VerifyFiles),
      0x04 => Ok(Self::GetMissingParts),
      0x05 => Ok(Self::QueueInstall),
      0x06 => Ok(Self::Install),
      0x07 => Ok(Self::WriteVersionStamps),
      0x08 => Ok(Self::SetProcessPriority),
      0x09 => Ok(Self::Bye),
      0x40 => Ok(Self::VerifyProgress),
      0x41 => Ok(Self::InstallProgress),
      0x80 => Ok(Self::ResponseOk),
      0x81 => Ok(Self::ResponseErr),
      other => Err(Error::Channel(format!("unknown opcode 0x{:02x}", other))),
    }
  }
}

fn malformed(error: Error) -> Error {
  Error::Channel(format!("malformed frame: {}", error))
}

impl Frame {
  pub fn new(opcode: Opcode, correlation_id: u32, payload: Vec<u8>) -> Self {
    Self { opcode, correlation_id, payload }
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(5 + self.payload.len());
    buffer.push(self.opcode as u8);
    buffer.extend_from_slice(&self.correlation_id.to_le_bytes());
    buffer.extend_from_slice(&self.payload);
    buffer
  }

  pub fn decode(buffer: &[u8]) -> Result<Self, Error> {
    if buffer.len() < 5 {
      return Err(Error::Channel(format!("frame of {} bytes is too short", buffer.len())));
    }
    let opcode = Opcode::from_u8(buffer[0])?;
    let correlation_id = u32::from_le_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]);
    Ok(Self { opcode, correlation_id, payload: buffer[5..].to_vec() })
  }
}

impl TargetStreamMode {
  fn to_u8(self) -> u8 {
    match self {
      Self::ReadOnly => 0,
      Self::ReadWriteMissing => 1,
    }
  }

  fn from_u8(value: u8) -> Result<Self, Error> {
    match value {
      0 => Ok(Self::ReadOnly),
      1 => Ok(Self::ReadWriteMissing),
      other => Err(Error::Channel(format!("unknown target stream mode {}", other))),
    }
  }
}

impl MissingPartGrouping {
  fn to_u8(self) -> u8 {
    match self {
      Self::PerTarget => 0,
      Self::PerSource => 1,
    }
  }

  fn from_u8(value: u8) -> Result<Self, Error> {
    match value {
      0 => Ok(Self::PerTarget),
      1 => Ok(Self::PerSource),
      other => Err(Error::Channel(format!("unknown missing part grouping {}", other))),
    }
  }
}

impl ProcessPriority {
  pub(crate) fn to_u8(self) -> u8 {
    match self {
      Self::Idle => 0,
      Self::BelowNormal => 1,
      Self::Normal => 2,
    }
  }

  pub(crate) fn from_u8(value: u8) -> Result<Self, Error> {
    match value {
      0 => Ok(Self::Idle),
      1 => Ok(Self::BelowNormal),
      2 => Ok(Self::Normal),
      other => Err(Error::Channel(format!("unknown process priority {}", other))),
    }
  }
}

// Payload codecs. Encoders write into fresh buffers, decoders read from the
// frame payload; any shortfall surfaces as a channel error.

pub(crate) fn encode_hello() -> Vec<u8> {
  crate::structures::PROTOCOL_VERSION.to_le_bytes().to_vec()
}

pub(crate) fn decode_hello(payload: &[u8]) -> Result<u32, Error> {
  let mut reader = Cursor::new(payload);
  read_u32(&mut reader).map_err(malformed)
}

pub(crate) fn encode_construct(index_bytes: &[u8], progress_interval: Duration) -> Vec<u8> {
  let mut buffer = (progress_interval.as_millis() as u64).to_le_bytes().to_vec();
  buffer.extend_from_slice(index_bytes);
  buffer
}

pub(crate) fn decode_construct(payload: &[u8]) -> Result<(Duration, &[u8]), Error> {
  if payload.len() < 8 {
    return Err(Error::Channel("construct payload is too short".to_string()));
  }
  let mut millis = [0u8; 8];
  millis.copy_from_slice(&payload[..8]);
  Ok((Duration::from_millis(u64::from_le_bytes(millis)), &payload[8..]))
}

pub(crate) fn encode_set_target_streams(mode: TargetStreamMode, root: &str) -> Result<Vec<u8>, Error> {
  let mut buffer = Vec::new();
  write_u8(&mut buffer, mode.to_u8())?;
  write_string(&mut buffer, root)?;
  Ok(buffer)
}

pub(crate) fn decode_set_target_streams(payload: &[u8]) -> Result<(TargetStreamMode, PathBuf), Error> {
  let mut reader = Cursor::new(payload);
  let mode = TargetStreamMode::from_u8(read_u8(&mut reader).map_err(malformed)?)?;
  let root = read_string(&mut reader).map_err(malformed)?;
  Ok((mode, PathBuf::from(root)))
}

pub(crate) fn encode_verify(trust_local_cache: bool, concurrency: u32) -> Result<Vec<u8>, Error> {
  let mut buffer = Vec::new();
  write_u8(&mut buffer, trust_local_cache as u8)?;
  write_u32(&mut buffer, concurrency)?;
  Ok(buffer)
}

pub(crate) fn decode_verify(payload: &[u8]) -> Result<(bool, u32), Error> {
  let mut reader = Cursor::new(payload);
  let trust_local_cache = read_u8(&mut reader).map_err(malformed)? != 0;
  let concurrency = read_u32(&mut reader).map_err(malformed)?;
  Ok((trust_local_cache, concurrency))
}

pub(crate) fn encode_missing_request(grouping: MissingPartGrouping) -> Vec<u8> {
  vec![grouping.to_u8()]
}

pub(crate) fn decode_missing_request(payload: &[u8]) -> Result<MissingPartGrouping, Error> {
  let mut reader = Cursor::new(payload);
  MissingPartGrouping::from_u8(read_u8(&mut reader).map_err(malformed)?)
}

pub(crate) fn encode_missing_per_target(missing: &[Vec<u32>]) -> Result<Vec<u8>, Error> {
  let mut buffer = Vec::new();
  write_u32(&mut buffer, missing.len() as u32)?;
  for parts in missing {
    write_u32(&mut buffer, parts.len() as u32)?;
    for part in parts {
      write_u32(&mut buffer, *part)?;
    }
  }
  Ok(buffer)
}

pub(crate) fn decode_missing_per_target(payload: &[u8]) -> Result<Vec<Vec<u32>>, Error> {
  let mut reader = Cursor::new(payload);
  let target_count = read_u32(&mut reader).map_err(malformed)? as usize;
  let mut missing = Vec::with_capacity(target_count);
  for _ in 0..target_count {
    let part_count = read_u32(&mut reader).map_err(malformed)? as usize;
    let mut parts = Vec::with_capacity(part_count);
    for _ in 0..part_count {
      parts.push(read_u32(&mut reader).map_err(malformed)?);
    }
    missing.push(parts);
  }
  Ok(missing)
}

pub(crate) fn encode_missing_per_source(missing: &[Vec<(u32, u32)>]) -> Result<Vec<u8>, Error> {
  let mut buffer = Vec::new();
  write_u32(&mut buffer, missing.len() as u32)?;
  for parts in missing {
    write_u32(&mut buffer, parts.len() as u32)?;
    for (target, part) in parts {
      write_u32(&mut buffer, *target)?;
      write_u32(&mut buffer, *part)?;
    }
  }
  Ok(buffer)
}

pub(crate) fn decode_missing_per_source(payload: &[u8]) -> Result<Vec<Vec<(u32, u32)>>, Error> {
  let mut reader = Cursor::new(payload);
  let source_count = read_u32(&mut reader).map_err(malformed)? as usize;
  let mut missing = Vec::with_capacity(source_count);
  for _ in 0..source_count {
    let part_count = read_u32(&mut reader).map_err(malformed)? as usize;
    let mut parts = Vec::with_capacity(part_count);
    for _ in 0..part_count {
      let target = read_u32(&mut reader).map_err(malformed)?;
      let part = read_u32(&mut reader).map_err(malformed)?;
      parts.push((target, part));
    }
    missing.push(parts);
  }
  Ok(missing)
}

pub(crate) fn encode_queue_install(source_index: u16, location: &InstallLocation, max_connections: u32) -> Result<Vec<u8>, Error> {
  let mut buffer = Vec::new();
  write_u16(&mut buffer, source_index)?;
  match location {
    InstallLocation::Local(path) => {
      write_u8(&mut buffer, 0)?;
      write_string(&mut buffer, &path.to_string_lossy())?;
    },
    InstallLocation::Remote(uri) => {
      write_u8(&mut buffer, 1)?;
      write_string(&mut buffer, uri)?;
    },
  }
  write_u32(&mut buffer, max_connections)?;
  Ok(buffer)
}

pub(crate) fn decode_queue_install(payload: &[u8]) -> Result<(u16, InstallLocation, u32), Error> {
  let mut reader = Cursor::new(payload);
  let source_index = read_u16(&mut reader).map_err(malformed)?;
  let kind = read_u8(&mut reader).map_err(malformed)?;
  let location = read_string(&mut reader).map_err(malformed)?;
  let location = match kind {
    0 => InstallLocation::Local(PathBuf::from(location)),
    1 => InstallLocation::Remote(location),
    other => return Err(Error::Channel(format!("unknown install location kind {}", other))),
  };
  let max_connections = read_u32(&mut reader).map_err(malformed)?;
  Ok((source_index, location, max_connections))
}

pub(crate) fn encode_install(max_connections: u32) -> Result<Vec<u8>, Error> {
  let mut buffer = Vec::new();
  write_u32(&mut buffer, max_connections)?;
  Ok(buffer)
}

pub(crate) fn decode_install(payload: &[u8]) -> Result<u32, Error> {
  let mut reader = Cursor::new(payload);
  read_u32(&mut reader).map_err(malformed)
}

pub(crate) fn encode_write_version_stamps(root: &str, version: &str, with_backup: bool) -> Result<Vec<u8>, Error> {
  let mut buffer = Vec::new();
  write_string(&mut buffer, root)?;
  write_string(&mut buffer, version)?;
  write_u8(&mut buffer, with_backup as u8)?;
  Ok(buffer)
}

pub(crate) fn decode_write_version_stamps(payload: &[u8]) -> Result<(PathBuf, String, bool), Error> {
  let mut reader = Cursor::new(payload);
  let root = read_string(&mut reader).map_err(malformed)?;
  let version = read_string(&mut reader).map_err(malformed)?;
  let with_backup = read_u8(&mut reader).map_err(malformed)? != 0;
  Ok((PathBuf::from(root), version, with_backup))
}

pub(crate) fn encode_progress_event(event: &ProgressEvent) -> Result<(Opcode, Vec<u8>), Error> {
  let mut buffer = Vec::new();
  match event {
    ProgressEvent::Verify { target_index, progress, total } => {
      write_u32(&mut buffer, *target_index)?;
      write_u64(&mut buffer, *progress)?;
      write_u64(&mut buffer, *total)?;
      Ok((Opcode::VerifyProgress, buffer))
    },
    ProgressEvent::Install { source_index, progress, total, state } => {
      write_u32(&mut buffer, *source_index)?;
      write_u64(&mut buffer, *progress)?;
      write_u64(&mut buffer, *total)?;
      write_u8(&mut buffer, state.to_u8())?;
      Ok((Opcode::InstallProgress, buffer))
    },
  }
}

pub(crate) fn decode_progress_event(opcode: Opcode, payload: &[u8]) -> Result<ProgressEvent, Error> {
  let mut reader = Cursor::new(payload);
  match opcode {
    Opcode::VerifyProgress => Ok(ProgressEvent::Verify {
      target_index: read_u32(&mut reader).map_err(malformed)?,
      progress: read_u64(&mut reader).map_err(malformed)?,
      total: read_u64(&mut reader).map_err(malformed)?,
    }),
    Opcode::InstallProgress => {
      let source_index = read_u32(&mut reader).map_err(malformed)?;
      let progress = read_u64(&mut reader).map_err(malformed)?;
      let total = read_u64(&mut reader).map_err(malformed)?;
      let state = read_u8(&mut reader).map_err(malformed)?;
      Ok(ProgressEvent::Install {
        source_index,
        progress,
        total,
        state: InstallTaskState::from_u8(state)
          .ok_or_else(|| Error::Channel(format!("unknown install task state {}", state)))?,
      })
    },
    other => Err(Error::Channel(format!("{:?} is not a progress event", other))),
  }
}

pub(crate) fn encode_error(error: &Error) -> Result<Vec<u8>, Error> {
  let mut buffer = Vec::new();
  write_u8(&mut buffer, error.wire_kind())?;
  write_string(&mut buffer, &error.to_string())?;
  Ok(buffer)
}

pub(crate) fn decode_error(payload: &[u8]) -> Result<Error, Error> {
  let mut reader = Cursor::new(payload);
  let kind = read_u8(&mut reader).map_err(malformed)?;
  let message = read_string(&mut reader).map_err(malformed)?;
  Ok(Error::from_wire(kind, message))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn frame_round_trip() {
    let frame = Frame::new(Opcode::QueueInstall, 42, vec![1, 2, 3]);
    assert_eq!(Frame::decode(&frame.encode()).unwrap(), frame);
  }

  #[test]
  fn unknown_opcode_is_a_channel_error() {
    assert!(matches!(Frame::decode(&[0x7f, 0, 0, 0, 0]), Err(Error::Channel(_))));
  }

  #[test]
  fn progress_event_round_trip() {
    let events = [
      ProgressEvent::Verify { target_index: 3, progress: 1024, total: 4096 },
      ProgressEvent::Install { source_index: 1, progress: 10, total: 20, state: InstallTaskState::Downloading },
    ];
    for event in events {
      let (opcode, payload) = encode_progress_event(&event).unwrap();
      assert_eq!(decode_progress_event(opcode, &payload).unwrap(), event);
    }
  }

  #[test]
  fn queue_install_round_trip() {
    let payload = encode_queue_install(7, &InstallLocation::Remote("http://example/p.patch".to_string()), 8).unwrap();
    let (source_index, location, max_connections) = decode_queue_install(&payload).unwrap();
    assert_eq!(source_index, 7);
    assert_eq!(location, InstallLocation::Remote("http://example/p.patch".to_string()));
    assert_eq!(max_connections, 8);
  }

  #[test]
  fn error_round_trip_preserves_the_kind() {
    let payload = encode_error(&Error::Install("patch source missing".to_string())).unwrap();
    assert!(matches!(decode_error(&payload).unwrap(), Error::Install(_)));

    let payload = encode_error(&Error::Cancelled).unwrap();
    assert!(matches!(decode_error(&payload).unwrap(), Error::Cancelled));
  }
}
