use std::path::PathBuf;

use crate::structures::Repository;

/// Typed composite key mapping a queued source back to the caller-supplied
/// patch file, instead of the old string-concatenated `"{repo}:{file}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PatchSourceKey {
  pub repository: Repository,
  pub file_name: String,
}

/// Caller-supplied resolution of one source name: a locally cached patch file
/// and/or a uri to fetch ranges from.
#[derive(Debug, Clone)]
pub struct PatchSource {
  pub local_file: Option<PathBuf>,
  pub uri: Option<String>,
}

/// What actually gets queued for one source during an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallLocation {
  Local(PathBuf),
  Remote(String),
}
