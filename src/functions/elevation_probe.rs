use std::path::Path;

use tracing::info;
use uuid::Uuid;

use crate::structures::Error;

/// Probes whether the current process may write to the game root by creating
/// and deleting a uniquely named temp file. Access denied means repair needs
/// an elevated worker. The probe never leaves a stray file behind.
pub fn admin_access_required(game_root: &Path) -> Result<bool, Error> {
  let probe = loop {
    let candidate = game_root.join(Uuid::new_v4().to_string());
    if !candidate.exists() {
      break candidate;
    }
  };
  match std::fs::write(&probe, b"") {
    Ok(()) => {
      std::fs::remove_file(&probe)?;
      Ok(false)
    },
    Err(error) if error.kind() == std::io::ErrorKind::PermissionDenied => {
      info!("writability probe on {} was denied, elevation required", game_root.display());
      Ok(true)
    },
    Err(error) => Err(error.into()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn is_empty(path: &Path) -> bool {
    std::fs::read_dir(path).unwrap().next().is_none()
  }

  #[test]
  fn writable_root_requires_no_elevation_and_leaves_no_file() {
    let root = tempfile::tempdir().unwrap();
    assert!(!admin_access_required(root.path()).unwrap());
    assert!(is_empty(root.path()));
  }

  #[cfg(unix)]
  #[test]
  fn read_only_root_requires_elevation_and_leaves_no_file() {
    use std::os::unix::fs::PermissionsExt;

    if unsafe { libc::geteuid() } == 0 {
      // Root ignores mode bits, the denied branch is unreachable.
      return;
    }

    let root = tempfile::tempdir().unwrap();
    let mut permissions = std::fs::metadata(root.path()).unwrap().permissions();
    permissions.set_mode(0o555);
    std::fs::set_permissions(root.path(), permissions.clone()).unwrap();

    let required = admin_access_required(root.path()).unwrap();

    permissions.set_mode(0o755);
    std::fs::set_permissions(root.path(), permissions).unwrap();
    assert!(required);
    assert!(is_empty(root.path()));
  }
}
