use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::functions::download_ranges::download_file;
use crate::structures::{Error, Repository, BASE_GAME_VERSION};

/// Latest version reference for one repository, from `latest.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryVersion {
  pub version: String,
  pub revision: i32,
}

fn version_entry(parsed: &json::JsonValue, key: &str) -> Option<RepositoryVersion> {
  let version = parsed[key].as_str()?.to_string();
  let revision = parsed[format!("{}Revision", key)].as_i32().unwrap_or(0);
  Some(RepositoryVersion { version, revision })
}

/// Fetches `{base}/latest.json` and returns the repositories to process in
/// fixed order: base game, expansions up to `max_expansion`, then boot.
/// Repositories the server does not list are skipped.
pub(crate) async fn fetch_latest_versions(base_url: &str, max_expansion: u8) -> Result<Vec<(Repository, RepositoryVersion)>, Error> {
  let uri = format!("{}latest.json", base_url);
  let (status, body) = download_file(&uri).await?;
  if status != 200 {
    return Err(Error::HttpStatus(status, uri));
  }
  let parsed = json::parse(&String::from_utf8(body)?)?;

  let mut versions = Vec::new();
  if let Some(version) = version_entry(&parsed, "game") {
    versions.push((Repository::BaseGame, version));
  }
  for number in 1..=max_expansion {
    if let Some(version) = version_entry(&parsed, &format!("ex{}", number)) {
      versions.push((Repository::Expansion(number), version));
    }
  }
  if let Some(version) = version_entry(&parsed, "boot") {
    versions.push((Repository::Boot, version));
  }
  Ok(versions)
}

pub(crate) fn meta_file_name(version: &RepositoryVersion) -> String {
  if version.revision > 0 {
    format!("{}.patch.index.v{}", version.version, version.revision)
  } else {
    format!("{}.patch.index", version.version)
  }
}

/// Ensures the repository's patch index is cached under
/// `{roaming}/patchMeta/{shorthand}/` and returns its path. A 404 from the
/// server is the distinguished "no version reference" failure.
pub(crate) async fn fetch_repo_meta(
  base_url: &str,
  roaming_dir: &Path,
  repository: Repository,
  latest: &RepositoryVersion,
) -> Result<PathBuf, Error> {
  let file_name = meta_file_name(latest);
  let meta_dir = roaming_dir.join("patchMeta").join(repository.shorthand());
  std::fs::create_dir_all(&meta_dir)?;
  let file_path = meta_dir.join(&file_name);

  if !file_path.is_file() {
    let uri = format!("{}{}/{}", base_url, repository.shorthand(), file_name);
    let (status, body) = download_file(&uri).await?;
    if status == 404 {
      return Err(Error::NoVersionReference(repository, latest.version.clone()));
    }
    if status != 200 {
      return Err(Error::HttpStatus(status, uri));
    }
    std::fs::write(&file_path, body)?;
    info!("downloaded patch index for {} ({})", repository.shorthand(), latest.version);
  } else {
    debug!("patch index for {} ({}) already cached", repository.shorthand(), latest.version);
  }
  Ok(file_path)
}

/// Repositories whose local stamp still reads the base version have nothing
/// installed to verify.
pub(crate) fn is_fresh_install(repository: Repository, game_root: &Path) -> bool {
  repository.local_version(game_root) == BASE_GAME_VERSION
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn version_entries_parse_revisions() {
    let parsed = json::parse(r#"{"game": "2024.03.01.0000.0000", "gameRevision": 2, "boot": "2024.01.01.0000.0001"}"#).unwrap();
    assert_eq!(version_entry(&parsed, "game"),
      Some(RepositoryVersion { version: "2024.03.01.0000.0000".to_string(), revision: 2 }));
    assert_eq!(version_entry(&parsed, "boot"),
      Some(RepositoryVersion { version: "2024.01.01.0000.0001".to_string(), revision: 0 }));
    assert_eq!(version_entry(&parsed, "ex1"), None);
  }

  #[test]
  fn meta_file_names_carry_the_revision_suffix() {
    let plain = RepositoryVersion { version: "2024.03.01.0000.0000".to_string(), revision: 0 };
    let revised = RepositoryVersion { version: "2024.03.01.0000.0000".to_string(), revision: 3 };
    assert_eq!(meta_file_name(&plain), "2024.03.01.0000.0000.patch.index");
    assert_eq!(meta_file_name(&revised), "2024.03.01.0000.0000.patch.index.v3");
  }
}
