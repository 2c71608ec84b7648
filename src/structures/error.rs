use crate::structures::Repository;

#[derive(Debug)]
pub enum Error {
  /// Malformed patch index, fatal, never retried.
  Format(String),
  /// The metadata server has no patch chain for this version.
  NoVersionReference(Repository, String),
  /// Writing to the installation requires elevation.
  AccessDenied(String),
  /// One patch source failed to resolve or apply; retried within the attempt budget.
  Install(String),
  /// The worker process died or the channel desynchronized.
  Channel(String),
  Cancelled,

  InvalidUri(download_async::http::uri::InvalidUri),
  UrlParse(url::ParseError),
  InvalidHeader(download_async::http::header::InvalidHeaderValue),
  HttpError(download_async::http::Error),
  /// Unexpected HTTP status, first argument is the status code, second the uri.
  HttpStatus(u16, String),
  DownloadTimeout(tokio::time::error::Elapsed),
  DownloadError(Box<dyn std::error::Error + Sync + std::marker::Send>),
  JsonError(json::Error),
  NotUtf8(std::string::FromUtf8Error),
  IoError(std::io::Error),
  MutexPoisoned(String),
  None(String),
}

impl Error {
  pub fn is_cancellation(&self) -> bool {
    matches!(self, Self::Cancelled)
  }

  /// Kind byte used when carrying an error over the worker channel.
  pub(crate) fn wire_kind(&self) -> u8 {
    match self {
      Self::Format(_) => 1,
      Self::AccessDenied(_) => 2,
      Self::Install(_) => 3,
      Self::Cancelled => 4,
      Self::Channel(_) => 5,
      _ => 0,
    }
  }

  pub(crate) fn from_wire(kind: u8, message: String) -> Self {
    match kind {
      1 => Self::Format(message),
      2 => Self::AccessDenied(message),
      3 => Self::Install(message),
      4 => Self::Cancelled,
      5 => Self::Channel(message),
      _ => Self::None(message),
    }
  }
}
