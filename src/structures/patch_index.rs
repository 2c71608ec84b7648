/// Smallest independently verifiable/installable byte range of a target file.
///
/// `source_offset`/`source_size` locate the part's raw delta record inside its
/// patch source so install can fetch minimal ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
  pub source_index: u16,
  pub target_offset: u64,
  pub length: u32,
  pub source_offset: u64,
  pub source_size: u32,
  pub hash: [u8; 32],
}

/// One file of the installed tree, tiled completely by its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFile {
  pub relative_path: String,
  pub file_size: u64,
  pub parts: Vec<Part>,
}

/// Immutable manifest of one version's expected files, patch sources and
/// byte-range hashes. Rebuilt wholesale on version change, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchIndex {
  pub expansion_version: i32,
  pub targets: Vec<TargetFile>,
  pub sources: Vec<String>,
}
