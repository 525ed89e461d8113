//! Chunked file transfer assembly.
//!
//! Files move as base64 chunks of at most 16 KiB raw bytes. The router
//! assembles its own copy while relaying chunks; every member assembles
//! independently. Out-of-order and duplicate chunks are tolerated.

use crate::error::{Error, Result};
use crate::MAX_FILE_CHUNK_SIZE;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::HashMap;

/// Split raw bytes into wire-sized chunks.
pub fn chunk_bytes(bytes: &[u8]) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return vec![Vec::new()];
    }
    bytes
        .chunks(MAX_FILE_CHUNK_SIZE)
        .map(|c| c.to_vec())
        .collect()
}

/// An in-progress inbound transfer.
#[derive(Debug)]
pub struct FileAssembly {
    /// Transfer id.
    pub tid: String,
    /// File name.
    pub name: String,
    /// Announced size in bytes.
    pub size: u64,
    /// Announced chunk count.
    pub total: u32,
    /// Sender fingerprint, when known.
    pub from_fp: Option<String>,
    chunks: HashMap<u32, Vec<u8>>,
}

impl FileAssembly {
    /// Start assembling from a `file-start` announcement.
    pub fn new(
        tid: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        total: u32,
        from_fp: Option<String>,
    ) -> Self {
        Self {
            tid: tid.into(),
            name: name.into(),
            size,
            total,
            from_fp,
            chunks: HashMap::new(),
        }
    }

    /// Record one base64 chunk. Duplicates and out-of-order arrivals are
    /// fine; an index beyond the announced total is a protocol error.
    pub fn add_chunk(&mut self, index: u32, bytes_b64: &str) -> Result<()> {
        if index >= self.total {
            return Err(Error::Protocol(format!(
                "chunk index {index} out of range (total {})",
                self.total
            )));
        }
        let bytes = BASE64
            .decode(bytes_b64)
            .map_err(|e| Error::Protocol(e.to_string()))?;
        if bytes.len() > MAX_FILE_CHUNK_SIZE {
            return Err(Error::Protocol("oversized chunk".into()));
        }
        self.chunks.insert(index, bytes);
        Ok(())
    }

    /// Whether every announced chunk has arrived.
    pub fn is_complete(&self) -> bool {
        self.chunks.len() as u32 == self.total
    }

    /// Concatenate the chunks in order.
    ///
    /// Fails if any chunk is missing or the result disagrees with the
    /// announced size.
    pub fn assemble(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.size as usize);
        for index in 0..self.total {
            let chunk = self
                .chunks
                .get(&index)
                .ok_or_else(|| Error::Protocol(format!("missing chunk {index}")))?;
            out.extend_from_slice(chunk);
        }
        if out.len() as u64 != self.size {
            return Err(Error::Protocol("assembled size mismatch".into()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_bounds() {
        let data = vec![7u8; MAX_FILE_CHUNK_SIZE * 2 + 10];
        let chunks = chunk_bytes(&data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_FILE_CHUNK_SIZE);
        assert_eq!(chunks[2].len(), 10);
    }

    #[test]
    fn test_out_of_order_assembly() {
        let data: Vec<u8> = (0..100u8).cycle().take(40_000).collect();
        let chunks = chunk_bytes(&data);

        let mut assembly =
            FileAssembly::new("t1", "data.bin", data.len() as u64, chunks.len() as u32, None);
        for (index, chunk) in chunks.iter().enumerate().rev() {
            assembly
                .add_chunk(index as u32, &BASE64.encode(chunk))
                .unwrap();
        }
        assert!(assembly.is_complete());
        assert_eq!(assembly.assemble().unwrap(), data);
    }

    #[test]
    fn test_duplicate_chunk_tolerated() {
        let mut assembly = FileAssembly::new("t1", "x", 2, 1, None);
        assembly.add_chunk(0, &BASE64.encode([1, 2])).unwrap();
        assembly.add_chunk(0, &BASE64.encode([1, 2])).unwrap();
        assert!(assembly.is_complete());
        assert_eq!(assembly.assemble().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_out_of_range_chunk_rejected() {
        let mut assembly = FileAssembly::new("t1", "x", 2, 1, None);
        assert!(assembly.add_chunk(1, &BASE64.encode([0])).is_err());
    }

    #[test]
    fn test_incomplete_assembly_fails() {
        let assembly = FileAssembly::new("t1", "x", 4, 2, None);
        assert!(!assembly.is_complete());
        assert!(assembly.assemble().is_err());
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut assembly = FileAssembly::new("t1", "x", 99, 1, None);
        assembly.add_chunk(0, &BASE64.encode([1, 2, 3])).unwrap();
        assert!(assembly.assemble().is_err());
    }
}
