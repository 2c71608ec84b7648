use std::io::{Read, Write};
use std::path::Path;

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::functions::binary::*;
use crate::structures::{Error, PatchIndex, Part, Repository, TargetFile};

const FORMAT_VERSION: u8 = 1;

// Guards against nonsense counts in a corrupted header before any allocation.
const MAX_TABLE_ENTRIES: u32 = 1 << 24;

impl PatchIndex {
  /// Decodes a deflate-compressed patch index. All-or-nothing: any truncation
  /// or inconsistency fails with `Error::Format` and no partial manifest.
  pub fn decode(reader: impl Read) -> Result<Self, Error> {
    let mut reader = DeflateDecoder::new(reader);

    let version = read_u8(&mut reader)?;
    if version != FORMAT_VERSION {
      return Err(Error::Format(format!("unsupported patch index version {}", version)));
    }
    let expansion_version = read_i32(&mut reader)?;
    Repository::from_expansion_version(expansion_version)?;
    let target_count = read_u32(&mut reader)?;
    let source_count = read_u32(&mut reader)?;
    if target_count > MAX_TABLE_ENTRIES || source_count > MAX_TABLE_ENTRIES {
      return Err(Error::Format(format!("implausible table sizes: {} targets, {} sources", target_count, source_count)));
    }

    let mut targets = Vec::with_capacity(target_count as usize);
    let mut part_counts = Vec::with_capacity(target_count as usize);
    for _ in 0..target_count {
      let relative_path = read_string(&mut reader)?;
      let file_size = read_u64(&mut reader)?;
      let part_count = read_u32(&mut reader)?;
      if part_count > MAX_TABLE_ENTRIES {
        return Err(Error::Format(format!("implausible part count {} for {}", part_count, relative_path)));
      }
      part_counts.push(part_count);
      targets.push(TargetFile { relative_path, file_size, parts: Vec::with_capacity(part_count as usize) });
    }

    let mut sources = Vec::with_capacity(source_count as usize);
    for _ in 0..source_count {
      sources.push(read_string(&mut reader)?);
    }

    for (target, part_count) in targets.iter_mut().zip(part_counts) {
      for _ in 0..part_count {
        target.parts.push(Part {
          source_index: read_u16(&mut reader)?,
          target_offset: read_u64(&mut reader)?,
          length: read_u32(&mut reader)?,
          source_offset: read_u64(&mut reader)?,
          source_size: read_u32(&mut reader)?,
          hash: read_hash(&mut reader)?,
        });
      }
    }

    let index = Self { expansion_version, targets, sources };
    index.validate()?;
    Ok(index)
  }

  pub fn load(path: &Path) -> Result<Self, Error> {
    let file = std::fs::File::open(path)?;
    Self::decode(std::io::BufReader::new(file))
  }

  pub fn encode(&self, writer: impl Write) -> Result<(), Error> {
    let mut writer = DeflateEncoder::new(writer, Compression::default());

    write_u8(&mut writer, FORMAT_VERSION)?;
    write_i32(&mut writer, self.expansion_version)?;
    write_u32(&mut writer, self.targets.len() as u32)?;
    write_u32(&mut writer, self.sources.len() as u32)?;
    for target in &self.targets {
      write_string(&mut writer, &target.relative_path)?;
      write_u64(&mut writer, target.file_size)?;
      write_u32(&mut writer, target.parts.len() as u32)?;
    }
    for source in &self.sources {
      write_string(&mut writer, source)?;
    }
    for target in &self.targets {
      for part in &target.parts {
        write_u16(&mut writer, part.source_index)?;
        write_u64(&mut writer, part.target_offset)?;
        write_u32(&mut writer, part.length)?;
        write_u64(&mut writer, part.source_offset)?;
        write_u32(&mut writer, part.source_size)?;
        writer.write_all(&part.hash)?;
      }
    }
    writer.finish()?;
    Ok(())
  }

  /// Every target's parts must exactly tile `[0, file_size)` and reference a
  /// known source.
  pub(crate) fn validate(&self) -> Result<(), Error> {
    for target in &self.targets {
      let mut expected_offset = 0u64;
      for part in &target.parts {
        if part.source_index as usize >= self.sources.len() {
          return Err(Error::Format(format!("{}: part references source {} of {}",
            target.relative_path, part.source_index, self.sources.len())));
        }
        if part.target_offset != expected_offset {
          return Err(Error::Format(format!("{}: part at offset {} does not tile, expected offset {}",
            target.relative_path, part.target_offset, expected_offset)));
        }
        expected_offset += part.length as u64;
      }
      if expected_offset != target.file_size {
        return Err(Error::Format(format!("{}: parts cover {} of {} bytes",
          target.relative_path, expected_offset, target.file_size)));
      }
    }
    Ok(())
  }

  pub fn repository(&self) -> Result<Repository, Error> {
    Repository::from_expansion_version(self.expansion_version)
  }

  pub fn total_size(&self) -> u64 {
    self.targets.iter().map(|target| target.file_size).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::functions::get_hash::hash_bytes;

  fn part(source_index: u16, target_offset: u64, length: u32, data: &[u8]) -> Part {
    Part {
      source_index,
      target_offset,
      length,
      source_offset: target_offset,
      source_size: length,
      hash: hash_bytes(data),
    }
  }

  fn sample_index() -> PatchIndex {
    PatchIndex {
      expansion_version: 1,
      targets: vec![
        TargetFile {
          relative_path: "sqpack/ex1/data.dat".to_string(),
          file_size: 24,
          parts: vec![
            part(0, 0, 16, &[0xAA; 16]),
            part(1, 16, 8, &[0xBB; 8]),
          ],
        },
        TargetFile { relative_path: "sqpack/ex1/empty.dat".to_string(), file_size: 0, parts: vec![] },
      ],
      sources: vec!["D2024.01.01.patch".to_string(), "D2024.02.01.patch".to_string()],
    }
  }

  fn encode_to_vec(index: &PatchIndex) -> Vec<u8> {
    let mut buffer = Vec::new();
    index.encode(&mut buffer).unwrap();
    buffer
  }

  #[test]
  fn round_trip() {
    let index = sample_index();
    let decoded = PatchIndex::decode(&encode_to_vec(&index)[..]).unwrap();
    assert_eq!(decoded, index);
  }

  #[test]
  fn truncated_stream_is_a_format_error() {
    let buffer = encode_to_vec(&sample_index());
    for length in [0, 1, buffer.len() / 2, buffer.len() - 1] {
      match PatchIndex::decode(&buffer[..length]) {
        Err(Error::Format(_)) | Err(Error::IoError(_)) => {},
        other => panic!("expected decode failure, got {:?}", other),
      }
    }
  }

  #[test]
  fn unsupported_version_is_a_format_error() {
    let mut index_bytes = Vec::new();
    let mut encoder = DeflateEncoder::new(&mut index_bytes, Compression::default());
    encoder.write_all(&[99]).unwrap();
    encoder.finish().unwrap();
    assert!(matches!(PatchIndex::decode(&index_bytes[..]), Err(Error::Format(_))));
  }

  #[test]
  fn gap_between_parts_is_a_format_error() {
    let mut index = sample_index();
    index.targets[0].parts[1].target_offset = 20;
    assert!(matches!(PatchIndex::decode(&encode_to_vec(&index)[..]), Err(Error::Format(_))));
  }

  #[test]
  fn overlapping_parts_are_a_format_error() {
    let mut index = sample_index();
    index.targets[0].parts[1].target_offset = 8;
    assert!(matches!(PatchIndex::decode(&encode_to_vec(&index)[..]), Err(Error::Format(_))));
  }

  #[test]
  fn short_coverage_is_a_format_error() {
    let mut index = sample_index();
    index.targets[0].file_size = 32;
    assert!(matches!(PatchIndex::decode(&encode_to_vec(&index)[..]), Err(Error::Format(_))));
  }

  #[test]
  fn dangling_source_index_is_a_format_error() {
    let mut index = sample_index();
    index.targets[0].parts[0].source_index = 7;
    assert!(matches!(PatchIndex::decode(&encode_to_vec(&index)[..]), Err(Error::Format(_))));
  }
}
