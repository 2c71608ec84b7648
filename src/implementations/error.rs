use tracing::error;

use crate::structures::Error;

impl std::fmt::Display for Error {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    match self {
      Self::Format(message) => write!(f, "malformed patch index: {}", message),
      Self::NoVersionReference(repository, version) => {
        write!(f, "no patch index is published for {} version {}", repository.shorthand(), version)
      },
      Self::AccessDenied(message) => write!(f, "access denied: {}", message),
      Self::Install(message) => write!(f, "install failed: {}", message),
      Self::Channel(message) => write!(f, "worker channel failed: {}", message),
      Self::Cancelled => write!(f, "operation was cancelled"),
      Self::InvalidUri(error) => write!(f, "invalid uri: {}", error),
      Self::UrlParse(error) => write!(f, "invalid url: {}", error),
      Self::InvalidHeader(error) => write!(f, "invalid header value: {}", error),
      Self::HttpError(error) => write!(f, "http error: {}", error),
      Self::HttpStatus(status, uri) => write!(f, "unexpected http status {} for {}", status, uri),
      Self::DownloadTimeout(error) => write!(f, "download timed out: {}", error),
      Self::DownloadError(error) => write!(f, "download failed: {}", error),
      Self::JsonError(error) => write!(f, "invalid json: {}", error),
      Self::NotUtf8(error) => write!(f, "response was not utf-8: {}", error),
      Self::IoError(error) => write!(f, "io error: {}", error),
      Self::MutexPoisoned(message) => write!(f, "mutex poisoned: {}", message),
      Self::None(message) => write!(f, "{}", message),
    }
  }
}

impl std::error::Error for Error { }

impl From<download_async::http::uri::InvalidUri> for Error {
  #[inline(always)]
  fn from(error: download_async::http::uri::InvalidUri) -> Self {
    error!("http::uri::InvalidUri: {:#?}", error);
    Self::InvalidUri(error)
  }
}

impl From<url::ParseError> for Error {
  #[inline(always)]
  fn from(error: url::ParseError) -> Self {
    error!("url::ParseError: {:#?}", error);
    Self::UrlParse(error)
  }
}

impl From<download_async::http::header::InvalidHeaderValue> for Error {
  #[inline(always)]
  fn from(error: download_async::http::header::InvalidHeaderValue) -> Self {
    Self::InvalidHeader(error)
  }
}

impl From<download_async::http::Error> for Error {
  #[inline(always)]
  fn from(error: download_async::http::Error) -> Self {
    error!("http::Error: {:#?}", error);
    Self::HttpError(error)
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  #[inline(always)]
  fn from(error: tokio::time::error::Elapsed) -> Self {
    Self::DownloadTimeout(error)
  }
}

impl From<std::io::Error> for Error {
  #[inline(always)]
  fn from(error: std::io::Error) -> Self {
    if error.kind() == std::io::ErrorKind::PermissionDenied {
      Self::AccessDenied(error.to_string())
    } else {
      Self::IoError(error)
    }
  }
}

impl From<std::string::FromUtf8Error> for Error {
  #[inline(always)]
  fn from(error: std::string::FromUtf8Error) -> Self {
    Self::NotUtf8(error)
  }
}

impl From<download_async::Error> for Error {
  #[inline(always)]
  fn from(error: download_async::Error) -> Self {
    error!("download_async::Error: {:#?}", error);
    Self::DownloadError(Box::new(error))
  }
}

impl From<Box<dyn std::error::Error + Sync + std::marker::Send>> for Error {
  #[inline(always)]
  fn from(error: Box<dyn std::error::Error + Sync + std::marker::Send>) -> Self {
    Self::DownloadError(error)
  }
}

impl From<json::Error> for Error {
  #[inline(always)]
  fn from(error: json::Error) -> Self {
    Self::JsonError(error)
  }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
  #[inline(always)]
  fn from(error: std::sync::PoisonError<T>) -> Self {
    Self::MutexPoisoned(error.to_string())
  }
}
