//! High-level entry points for operating on one already-downloaded index
//! file, shared by the command line and by embedders.

use std::path::PathBuf;

use tracing::info;

use crate::structures::{Error, PatchIndex, PatchSource, PatchSourceKey, VerifyState};
use crate::verifier::Verifier;
use crate::verifier_builder::VerifierBuilder;

/// What to verify or repair and where to fetch repairs from. Patch sources
/// are resolved per source name against `patch_dir` and/or `patch_base_url`.
pub struct IndexOperation {
  pub index_path: PathBuf,
  pub game_root: PathBuf,
  pub patch_dir: Option<PathBuf>,
  pub patch_base_url: Option<String>,
  pub worker_executable: Option<PathBuf>,
  pub concurrency: u32,
}

fn build_verifier(operation: &IndexOperation) -> Result<Verifier, Error> {
  let index = PatchIndex::load(&operation.index_path)?;
  let repository = index.repository()?;

  let mut builder = VerifierBuilder::new();
  builder.set_game_root(operation.game_root.clone());
  builder.set_concurrency(operation.concurrency);
  if let Some(executable) = &operation.worker_executable {
    builder.set_worker_executable(executable.clone());
  }
  for name in &index.sources {
    let source = PatchSource {
      local_file: operation.patch_dir.as_ref().map(|dir| dir.join(name)),
      uri: operation.patch_base_url.as_ref().map(|base| format!("{}{}", base, name)),
    };
    builder.register_source(PatchSourceKey { repository, file_name: name.clone() }, source);
  }
  builder.build()
}

fn unwrap_state(verifier: &Verifier, state: VerifyState) -> Result<(), Error> {
  match state {
    VerifyState::Done => Ok(()),
    VerifyState::Cancelled => Err(Error::Cancelled),
    _ => Err(verifier.take_last_error()
      .unwrap_or_else(|| Error::None("verification ended in an unknown state".to_string()))),
  }
}

/// Verifies the installation against the index and returns the number of
/// files with at least one diverging part. Nothing on disk is modified.
pub async fn verify_from_index_file(operation: &IndexOperation) -> Result<usize, Error> {
  let verifier = build_verifier(operation)?;
  let state = verifier.verify_index_file(&operation.index_path).await;
  unwrap_state(&verifier, state)?;
  let broken = verifier.progress().num_broken_files();
  info!("verify finished, {} broken files", broken);
  Ok(broken)
}

/// Verifies and repairs the installation from the index's patch sources,
/// retrying within the attempt budget until a verify comes back clean.
pub async fn repair_from_index_file(operation: &IndexOperation) -> Result<(), Error> {
  let verifier = build_verifier(operation)?;
  let state = verifier.repair_index_file(&operation.index_path).await;
  unwrap_state(&verifier, state)?;
  info!("repair finished");
  Ok(())
}
