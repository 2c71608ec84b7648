use async_trait::async_trait;

use crate::structures::Error;

/// External capability that decodes one raw delta-patch record into the bytes
/// of the target range it repairs. The installer only ever hands it the
/// record fetched for a single part and expects exactly that part back.
#[async_trait]
pub trait ChunkCodec: Send + Sync {
  async fn decode_chunk(&self, record: &[u8], target_length: u32) -> Result<Vec<u8>, Error>;
}

/// Pass-through codec for patch chains whose records carry the literal target
/// bytes. Also the codec the test suites install with.
pub struct RawChunkCodec;

#[async_trait]
impl ChunkCodec for RawChunkCodec {
  async fn decode_chunk(&self, record: &[u8], target_length: u32) -> Result<Vec<u8>, Error> {
    if record.len() != target_length as usize {
      return Err(Error::Install(format!("chunk of {} bytes does not decode to the expected {}", record.len(), target_length)));
    }
    Ok(record.to_vec())
  }
}
