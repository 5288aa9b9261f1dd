//! Streaming TLV codec used by asset leaves, commitment proofs and
//! transition proofs. Types and lengths are BigSize varints; unknown even
//! types are a decode error while unknown odd types are skippable, following
//! the usual lightning TLV semantics.

use std::io::{Read, Write};

use crate::AssetError;

/// Upper bound on a single record's length, to bound allocations.
const MAX_RECORD_LEN: u64 = 1 << 20;

/// A TLV record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Type(pub u64);

impl Type {
    /// Returns true for odd (optional) types.
    pub fn is_odd(self) -> bool {
        self.0 % 2 != 0
    }

    /// Returns true for even (required-to-understand) types.
    pub fn is_even(self) -> bool {
        self.0 % 2 == 0
    }
}

/// A decoded TLV record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    tlv_type: Type,
    value: Vec<u8>,
}

impl Record {
    /// The record type.
    pub fn tlv_type(&self) -> Type {
        self.tlv_type
    }

    /// The raw record value.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// A cursor over the record value.
    pub fn value_reader(&self) -> std::io::Cursor<&[u8]> {
        std::io::Cursor::new(&self.value)
    }
}

/// Reads a BigSize varint.
pub fn read_varint<R: Read>(r: &mut R) -> Result<u64, AssetError> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first)
        .map_err(|e| AssetError::Io(e.to_string()))?;
    match first[0] {
        0xFD => {
            let mut buf = [0u8; 2];
            r.read_exact(&mut buf)
                .map_err(|e| AssetError::Io(e.to_string()))?;
            Ok(u16::from_be_bytes(buf) as u64)
        }
        0xFE => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)
                .map_err(|e| AssetError::Io(e.to_string()))?;
            Ok(u32::from_be_bytes(buf) as u64)
        }
        0xFF => {
            let mut buf = [0u8; 8];
            r.read_exact(&mut buf)
                .map_err(|e| AssetError::Io(e.to_string()))?;
            Ok(u64::from_be_bytes(buf))
        }
        b => Ok(b as u64),
    }
}

/// Writes a BigSize varint.
pub fn write_varint<W: Write>(w: &mut W, value: u64) -> Result<(), AssetError> {
    let io_err = |e: std::io::Error| AssetError::Io(e.to_string());
    match value {
        0..=0xFC => w.write_all(&[value as u8]).map_err(io_err),
        0xFD..=0xFFFF => {
            w.write_all(&[0xFD]).map_err(io_err)?;
            w.write_all(&(value as u16).to_be_bytes()).map_err(io_err)
        }
        0x1_0000..=0xFFFF_FFFF => {
            w.write_all(&[0xFE]).map_err(io_err)?;
            w.write_all(&(value as u32).to_be_bytes()).map_err(io_err)
        }
        _ => {
            w.write_all(&[0xFF]).map_err(io_err)?;
            w.write_all(&value.to_be_bytes()).map_err(io_err)
        }
    }
}

/// Reads a varint-length-prefixed byte vector bounded by `max_len`.
pub fn read_var_bytes<R: Read>(r: &mut R, max_len: u64) -> Result<Vec<u8>, AssetError> {
    let len = read_varint(r)?;
    if len > max_len {
        return Err(AssetError::TlvStream(format!(
            "var bytes too large: {len} (max {max_len})"
        )));
    }
    let mut bytes = vec![0u8; len as usize];
    r.read_exact(&mut bytes)
        .map_err(|e| AssetError::Io(e.to_string()))?;
    Ok(bytes)
}

/// Writes a varint-length-prefixed byte vector.
pub fn write_var_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> Result<(), AssetError> {
    write_varint(w, bytes.len() as u64)?;
    w.write_all(bytes).map_err(|e| AssetError::Io(e.to_string()))
}

/// A TLV record reader over an underlying byte stream.
pub struct Stream<R: Read> {
    reader: R,
}

impl<R: Read> Stream<R> {
    /// Creates a stream over the reader.
    pub fn new(reader: R) -> Self {
        Stream { reader }
    }

    /// Reads the next record, or `None` at a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<Record>, AssetError> {
        let tlv_type = match read_varint(&mut self.reader) {
            Ok(value) => Type(value),
            // EOF while reading a type terminates the stream.
            Err(AssetError::Io(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let length = read_varint(&mut self.reader)?;
        if length > MAX_RECORD_LEN {
            return Err(AssetError::TlvStream(format!(
                "record too large: {length} bytes for type {}",
                tlv_type.0
            )));
        }

        let mut value = vec![0u8; length as usize];
        self.reader
            .read_exact(&mut value)
            .map_err(|e| AssetError::Io(e.to_string()))?;
        Ok(Some(Record { tlv_type, value }))
    }
}

/// Writes one TLV record.
pub fn write_record<W: Write>(w: &mut W, tlv_type: Type, value: &[u8]) -> Result<(), AssetError> {
    write_varint(w, tlv_type.0)?;
    write_varint(w, value.len() as u64)?;
    w.write_all(value).map_err(|e| AssetError::Io(e.to_string()))
}
