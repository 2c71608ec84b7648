use sha2::{Digest, Sha256};

/// SHA256 of one part's content, compared against the hash the index expects.
pub(crate) fn hash_bytes(buffer: &[u8]) -> [u8; 32] {
  let mut hasher = Sha256::new();
  hasher.update(buffer);
  hasher.finalize().into()
}

pub(crate) fn hash_hex(buffer: &[u8]) -> String {
  hex::encode_upper(hash_bytes(buffer))
}
