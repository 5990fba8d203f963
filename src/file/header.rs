//! File Header
//!
//! Bookkeeping stored in the first [`HEADER_SIZE`] bytes of every file.

use std::os::unix::fs::FileExt;

use serde::{Deserialize, Serialize};

use crate::config::FileKind;
use crate::error::{PageHashError, Result};

use super::HEADER_SIZE;

/// Magic bytes identifying a pagehash file
pub(crate) const MAGIC: [u8; 4] = *b"PGHF";

/// Current header format version
pub(crate) const VERSION: u16 = 1;

/// Decoded header fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct FileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    /// Which file variant wrote the header last (diagnostic only)
    pub kind: u8,
    /// Set on clean close, cleared while the file is open
    pub softly_closed: bool,
    /// Logical size of the data region
    pub size: u64,
}

impl FileHeader {
    pub fn new(kind: FileKind, size: u64, softly_closed: bool) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            kind: kind_to_byte(kind),
            softly_closed,
            size,
        }
    }

    /// Encode into a full header block: fields, CRC32, zero padding
    pub fn encode(&self) -> Result<Vec<u8>> {
        let fields = bincode::serialize(self)?;
        let crc = crc32fast::hash(&fields);

        let mut block = vec![0u8; HEADER_SIZE as usize];
        block[..fields.len()].copy_from_slice(&fields);
        block[fields.len()..fields.len() + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(block)
    }

    /// Decode and verify a header block
    pub fn decode(block: &[u8]) -> Result<Self> {
        let header: FileHeader = bincode::deserialize(block)
            .map_err(|e| PageHashError::InvalidHeader(e.to_string()))?;

        if header.magic != MAGIC {
            return Err(PageHashError::InvalidHeader(format!(
                "bad magic {:?}",
                header.magic
            )));
        }
        if header.version != VERSION {
            return Err(PageHashError::InvalidHeader(format!(
                "unsupported version {}",
                header.version
            )));
        }

        // Re-encode to learn the field length, then check the stored CRC
        let fields_len = bincode::serialized_size(&header)? as usize;
        let stored = block
            .get(fields_len..fields_len + 4)
            .ok_or_else(|| PageHashError::InvalidHeader("header truncated".to_string()))?;
        let stored_crc = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
        if crc32fast::hash(&block[..fields_len]) != stored_crc {
            return Err(PageHashError::InvalidHeader(
                "header checksum mismatch".to_string(),
            ));
        }

        Ok(header)
    }

    pub fn read_from(handle: &std::fs::File) -> Result<Self> {
        let mut block = vec![0u8; HEADER_SIZE as usize];
        handle.read_exact_at(&mut block, 0)?;
        Self::decode(&block)
    }

    pub fn write_to(&self, handle: &std::fs::File) -> Result<()> {
        handle.write_all_at(&self.encode()?, 0)?;
        Ok(())
    }
}

fn kind_to_byte(kind: FileKind) -> u8 {
    match kind {
        FileKind::Sync => 0,
        FileKind::Async => 1,
        FileKind::Mmap => 2,
    }
}
