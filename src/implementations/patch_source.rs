use crate::structures::{InstallLocation, PatchSource, PatchSourceKey};
use crate::verifier::Trust;

impl std::fmt::Display for PatchSourceKey {
  fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
    write!(f, "{}:{}", self.repository.source_key_shorthand(), self.file_name)
  }
}

impl PatchSource {
  /// Picks where to install from under the current trust regime. The local
  /// copy is only consulted while it is still trusted; distrusted attempts
  /// prefer the uri and fall back to the local file only when none is known.
  pub fn location(&self, trust: Trust) -> Option<InstallLocation> {
    let local = self.local_file.as_ref().filter(|path| path.is_file()).cloned().map(InstallLocation::Local);
    let remote = self.uri.clone().map(InstallLocation::Remote);
    match trust {
      Trust::TrustLocal => local.or(remote),
      Trust::DistrustLocal | Trust::Exhausted => remote.or(local),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::structures::Repository;

  #[test]
  fn key_display_uses_the_base_game_sentinel() {
    let key = PatchSourceKey { repository: Repository::BaseGame, file_name: "D2024.01.01.patch".to_string() };
    assert_eq!(key.to_string(), "ex0:D2024.01.01.patch");
  }

  #[test]
  fn distrusted_attempts_prefer_the_uri() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("D2024.01.01.patch");
    std::fs::write(&local, b"cached").unwrap();
    let source = PatchSource {
      local_file: Some(local.clone()),
      uri: Some("http://patches.example/D2024.01.01.patch".to_string()),
    };

    assert_eq!(source.location(Trust::TrustLocal), Some(InstallLocation::Local(local.clone())));
    assert_eq!(source.location(Trust::DistrustLocal),
      Some(InstallLocation::Remote("http://patches.example/D2024.01.01.patch".to_string())));

    let local_only = PatchSource { local_file: Some(local.clone()), uri: None };
    assert_eq!(local_only.location(Trust::DistrustLocal), Some(InstallLocation::Local(local)));

    let missing = PatchSource { local_file: Some(dir.path().join("gone.patch")), uri: None };
    assert_eq!(missing.location(Trust::TrustLocal), None);
  }
}
