//! Little-endian read/write helpers shared by the patch index codec and the
//! worker channel payloads.

use std::io::{Read, Write};

use crate::structures::Error;

fn eof(error: std::io::Error) -> Error {
  if error.kind() == std::io::ErrorKind::UnexpectedEof {
    Error::Format("unexpected end of stream".to_string())
  } else {
    error.into()
  }
}

pub(crate) fn read_u8(reader: &mut impl Read) -> Result<u8, Error> {
  let mut buffer = [0u8; 1];
  reader.read_exact(&mut buffer).map_err(eof)?;
  Ok(buffer[0])
}

pub(crate) fn read_u16(reader: &mut impl Read) -> Result<u16, Error> {
  let mut buffer = [0u8; 2];
  reader.read_exact(&mut buffer).map_err(eof)?;
  Ok(u16::from_le_bytes(buffer))
}

pub(crate) fn read_u32(reader: &mut impl Read) -> Result<u32, Error> {
  let mut buffer = [0u8; 4];
  reader.read_exact(&mut buffer).map_err(eof)?;
  Ok(u32::from_le_bytes(buffer))
}

pub(crate) fn read_i32(reader: &mut impl Read) -> Result<i32, Error> {
  let mut buffer = [0u8; 4];
  reader.read_exact(&mut buffer).map_err(eof)?;
  Ok(i32::from_le_bytes(buffer))
}

pub(crate) fn read_u64(reader: &mut impl Read) -> Result<u64, Error> {
  let mut buffer = [0u8; 8];
  reader.read_exact(&mut buffer).map_err(eof)?;
  Ok(u64::from_le_bytes(buffer))
}

pub(crate) fn read_hash(reader: &mut impl Read) -> Result<[u8; 32], Error> {
  let mut buffer = [0u8; 32];
  reader.read_exact(&mut buffer).map_err(eof)?;
  Ok(buffer)
}

/// A u16 length prefix followed by utf-8 bytes.
pub(crate) fn read_string(reader: &mut impl Read) -> Result<String, Error> {
  let length = read_u16(reader)? as usize;
  let mut buffer = vec![0u8; length];
  reader.read_exact(&mut buffer).map_err(eof)?;
  Ok(String::from_utf8(buffer).map_err(|e| Error::Format(format!("invalid utf-8 string: {}", e)))?)
}

pub(crate) fn write_u8(writer: &mut impl Write, value: u8) -> Result<(), Error> {
  Ok(writer.write_all(&[value])?)
}

pub(crate) fn write_u16(writer: &mut impl Write, value: u16) -> Result<(), Error> {
  Ok(writer.write_all(&value.to_le_bytes())?)
}

pub(crate) fn write_u32(writer: &mut impl Write, value: u32) -> Result<(), Error> {
  Ok(writer.write_all(&value.to_le_bytes())?)
}

pub(crate) fn write_i32(writer: &mut impl Write, value: i32) -> Result<(), Error> {
  Ok(writer.write_all(&value.to_le_bytes())?)
}

pub(crate) fn write_u64(writer: &mut impl Write, value: u64) -> Result<(), Error> {
  Ok(writer.write_all(&value.to_le_bytes())?)
}

pub(crate) fn write_string(writer: &mut impl Write, value: &str) -> Result<(), Error> {
  let bytes = value.as_bytes();
  if bytes.len() > u16::MAX as usize {
    return Err(Error::Format(format!("string of {} bytes does not fit a u16 length prefix", bytes.len())));
  }
  write_u16(writer, bytes.len() as u16)?;
  Ok(writer.write_all(bytes)?)
}
