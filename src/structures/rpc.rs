/// First message on the channel, worker to caller.
pub(crate) const PROTOCOL_VERSION: u32 = 1;

/// Correlation id carried by asynchronous progress events.
pub(crate) const EVENT_CORRELATION_ID: u32 = 0;

/// Message kinds of the worker channel. Requests flow caller to worker,
/// responses echo the request's correlation id, events are pushed by the
/// worker outside the request/response flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
  Hello = 0x00,
  ConstructFromIndex = 0x01,
  SetTargetStreams = 0x02,
  VerifyFiles = 0x03,
  GetMissingParts = 0x04,
  QueueInstall = 0x05,
  Install = 0x06,
  WriteVersionStamps = 0x07,
  SetProcessPriority = 0x08,
  Bye = 0x09,
  VerifyProgress = 0x40,
  InstallProgress = 0x41,
  ResponseOk = 0x80,
  ResponseErr = 0x81,
}

/// One framed message: `{opcode, correlation id, payload}` behind a u32
/// little-endian length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub opcode: Opcode,
  pub correlation_id: u32,
  pub payload: Vec<u8>,
}

/// How target streams are (re)opened for an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStreamMode {
  ReadOnly,
  ReadWriteMissing,
}

/// Which shape of missing-part report is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingPartGrouping {
  PerTarget,
  PerSource,
}

/// Scheduling class the worker should run itself at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPriority {
  Idle,
  BelowNormal,
  Normal,
}
