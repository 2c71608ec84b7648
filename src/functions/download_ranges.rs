use std::time::Duration;

use tracing::trace;

use crate::structures::Error;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

fn user_agent() -> String {
  format!("indexed-patcher ({})", env!("CARGO_PKG_VERSION"))
}

/// Fetches one inclusive byte range of a patch source.
pub(crate) async fn download_range(uri: &str, from: u64, to: u64) -> Result<Vec<u8>, Error> {
  let parsed = uri.parse::<download_async::http::Uri>()?;
  let mut downloader = download_async::Downloader::new();
  downloader.use_uri(parsed);
  let headers = downloader.headers().ok_or_else(|| Error::None("downloader lost its headers".to_string()))?;
  headers.append("User-Agent", user_agent().parse()?);
  headers.append("Range", format!("bytes={}-{}", from, to).parse()?);
  downloader.allow_http();

  let mut buffer = vec![];
  let response = downloader.download(download_async::Body::empty(), &mut buffer);
  let parts = tokio::time::timeout(DOWNLOAD_TIMEOUT, response).await??;
  let status = parts.status.as_u16();
  if !(status == 200 || status == 206) {
    return Err(Error::HttpStatus(status, uri.to_string()));
  }
  trace!("fetched bytes {}-{} of {}", from, to, uri);
  Ok(buffer)
}

/// Plain GET, returning the status code so callers can distinguish a missing
/// resource from a transport failure.
pub(crate) async fn download_file(uri: &str) -> Result<(u16, Vec<u8>), Error> {
  let parsed = uri.parse::<download_async::http::Uri>()?;
  let mut downloader = download_async::Downloader::new();
  downloader.use_uri(parsed);
  let headers = downloader.headers().ok_or_else(|| Error::None("downloader lost its headers".to_string()))?;
  headers.append("User-Agent", user_agent().parse()?);
  downloader.allow_http();

  let mut buffer = vec![];
  let response = downloader.download(download_async::Body::empty(), &mut buffer);
  let parts = tokio::time::timeout(DOWNLOAD_TIMEOUT, response).await??;
  Ok((parts.status.as_u16(), buffer))
}
