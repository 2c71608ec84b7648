use std::path::{Path, PathBuf};

use crate::structures::{Error, Repository, BASE_GAME_VERSION, EXPAC_VERSION_BOOT};

impl Repository {
  /// Shorthand used in metadata urls and cache folders.
  pub fn shorthand(&self) -> String {
    match self {
      Self::BaseGame => "game".to_string(),
      Self::Expansion(number) => format!("ex{}", number),
      Self::Boot => "boot".to_string(),
    }
  }

  /// Shorthand used in patch source keys, where the base game uses the "ex0" sentinel.
  pub fn source_key_shorthand(&self) -> String {
    match self {
      Self::BaseGame => "ex0".to_string(),
      _ => self.shorthand(),
    }
  }

  pub fn expansion_version(&self) -> i32 {
    match self {
      Self::BaseGame => 0,
      Self::Expansion(number) => *number as i32,
      Self::Boot => EXPAC_VERSION_BOOT,
    }
  }

  pub fn from_expansion_version(version: i32) -> Result<Self, Error> {
    match version {
      EXPAC_VERSION_BOOT => Ok(Self::Boot),
      0 => Ok(Self::BaseGame),
      number if number > 0 && number <= u8::MAX as i32 => Ok(Self::Expansion(number as u8)),
      other => Err(Error::Format(format!("invalid expansion version: {}", other))),
    }
  }

  /// The live subfolder of the installation this repository's files reside in.
  pub fn subfolder(&self) -> &'static str {
    match self {
      Self::Boot => "boot",
      _ => "game",
    }
  }

  /// Version stamp location, relative to the repository's subfolder.
  pub fn stamp_relative_path(&self) -> PathBuf {
    match self {
      Self::BaseGame => PathBuf::from("game.ver"),
      Self::Expansion(number) => PathBuf::from(format!("ex{}", number)).join(format!("ex{}.ver", number)),
      Self::Boot => PathBuf::from("boot.ver"),
    }
  }

  /// Reads the installed version from the stamp file, or the base version when no stamp exists.
  pub fn local_version(&self, game_root: &Path) -> String {
    let stamp = game_root.join(self.subfolder()).join(self.stamp_relative_path());
    match std::fs::read_to_string(&stamp) {
      Ok(version) => version.trim().to_string(),
      Err(_) => BASE_GAME_VERSION.to_string(),
    }
  }

  /// Writes the stamp file under the repository's subfolder; the `.bck` copy is
  /// only written once the new version is confirmed live.
  pub fn write_version_stamp(&self, subfolder_root: &Path, version: &str, with_backup: bool) -> Result<(), Error> {
    let stamp = subfolder_root.join(self.stamp_relative_path());
    if let Some(parent) = stamp.parent() {
      std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&stamp, version)?;
    if with_backup {
      std::fs::write(stamp.with_extension("bck"), version)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shorthands() {
    assert_eq!(Repository::BaseGame.shorthand(), "game");
    assert_eq!(Repository::BaseGame.source_key_shorthand(), "ex0");
    assert_eq!(Repository::Expansion(2).shorthand(), "ex2");
    assert_eq!(Repository::Boot.shorthand(), "boot");
  }

  #[test]
  fn expansion_version_round_trip() {
    for repository in [Repository::BaseGame, Repository::Expansion(3), Repository::Boot] {
      assert_eq!(Repository::from_expansion_version(repository.expansion_version()).unwrap(), repository);
    }
    assert!(Repository::from_expansion_version(-2).is_err());
  }

  #[test]
  fn version_stamps() {
    let root = tempfile::tempdir().unwrap();
    let repository = Repository::Expansion(1);
    assert_eq!(repository.local_version(root.path()), BASE_GAME_VERSION);

    let subfolder = root.path().join(repository.subfolder());
    repository.write_version_stamp(&subfolder, "2024.01.01.0000.0001", false).unwrap();
    assert_eq!(repository.local_version(root.path()), "2024.01.01.0000.0001");
    assert!(!subfolder.join("ex1").join("ex1.bck").exists());

    repository.write_version_stamp(&subfolder, "2024.01.01.0000.0001", true).unwrap();
    assert!(subfolder.join("ex1").join("ex1.bck").exists());
  }
}
