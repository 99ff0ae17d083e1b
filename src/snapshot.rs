//! Snapshot stream framing (spec §6.2).
//!
//! Each record is `size:u32 BE ‖ crc:u32 BE ‖ body`, where `size` counts
//! `crc` plus `body` (so `size` is always `> 4` for a real record) and `crc`
//! is the IEEE CRC32 of `body`. A `size == 0` record is a clean end of
//! stream; `size <= 4` with no trailing body is a framing error. Grounded in
//! `original_source/raft/state_machine.go`'s `SaveSnapshot` (writer) and
//! `recoverDataSize`/`recoverItem` (reader).

use std::io::{Read, Write};

use crc32fast::Hasher;

use crate::errors::StateMachineError;
use crate::types::Item;

const WRITE_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Streams `Item` records out in the framed format, using a 2 MiB buffer to
/// match `original_source`'s `bufio.Writer` sizing.
pub struct SnapshotWriter<W: Write> {
    inner: std::io::BufWriter<W>,
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(writer: W) -> Self {
        SnapshotWriter {
            inner: std::io::BufWriter::with_capacity(WRITE_BUFFER_SIZE, writer),
        }
    }

    pub fn write_item(&mut self, item: &Item) -> Result<(), StateMachineError> {
        let body = serde_json::to_vec(item)?;
        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let size = (body.len() + 4) as u32;
        self.inner
            .write_all(&size.to_be_bytes())
            .map_err(|_| StateMachineError::Cancelled)?;
        self.inner
            .write_all(&crc.to_be_bytes())
            .map_err(|_| StateMachineError::Cancelled)?;
        self.inner
            .write_all(&body)
            .map_err(|_| StateMachineError::Cancelled)?;
        Ok(())
    }

    /// Writes the end-of-stream marker and flushes the buffer.
    pub fn finish(mut self) -> Result<W, StateMachineError> {
        self.inner
            .write_all(&0u32.to_be_bytes())
            .map_err(|_| StateMachineError::Cancelled)?;
        self.inner.flush().map_err(|_| StateMachineError::Cancelled)?;
        self.inner
            .into_inner()
            .map_err(|_| StateMachineError::Cancelled)
    }
}

/// Reads framed `Item` records back out, verifying the CRC of each.
pub struct SnapshotReader<R: Read> {
    inner: R,
}

impl<R: Read> SnapshotReader<R> {
    pub fn new(reader: R) -> Self {
        SnapshotReader { inner: reader }
    }

    /// Reads the next record. Returns `Ok(None)` at a clean `size == 0` end
    /// of stream marker.
    pub fn read_item(&mut self) -> Result<Option<Item>, StateMachineError> {
        let mut size_buf = [0u8; 4];
        if let Err(e) = self.inner.read_exact(&mut size_buf) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(StateMachineError::Framing("failed reading record size"));
        }
        let size = u32::from_be_bytes(size_buf);
        if size == 0 {
            return Ok(None);
        }
        if size <= 4 {
            return Err(StateMachineError::Framing("record size too small"));
        }

        let mut crc_buf = [0u8; 4];
        self.inner
            .read_exact(&mut crc_buf)
            .map_err(|_| StateMachineError::Framing("truncated record crc"))?;
        let expected_crc = u32::from_be_bytes(crc_buf);

        let body_len = (size - 4) as usize;
        let mut body = vec![0u8; body_len];
        self.inner
            .read_exact(&mut body)
            .map_err(|_| StateMachineError::Framing("truncated record body"))?;

        let mut hasher = Hasher::new();
        hasher.update(&body);
        if hasher.finalize() != expected_crc {
            return Err(StateMachineError::ChecksumMismatch);
        }

        let item: Item = serde_json::from_slice(&body)?;
        Ok(Some(item))
    }
}
