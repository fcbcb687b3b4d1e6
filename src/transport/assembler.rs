//! Reassembly of base64 payloads delivered as indexed chunks

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("no chunk buffer for job {0}")]
    UnknownJob(String),

    #[error("invalid chunk total {0}")]
    InvalidTotal(i64),

    #[error("chunk index {index} outside 0..{total}")]
    IndexOutOfRange { index: i64, total: usize },

    #[error("chunk declares {declared} chunks but buffer holds {expected}")]
    TotalMismatch { expected: usize, declared: i64 },

    #[error("received {received} of {total} chunks")]
    Incomplete { received: usize, total: usize },

    #[error("chunk {0} missing")]
    MissingChunk(usize),

    #[error("assembled payload length {0} is not a multiple of 4")]
    Misaligned(usize),

    #[error("invalid base64 payload: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, AssemblyError>;

#[derive(Debug)]
struct ChunkBuffer {
    slots: Vec<Option<String>>,
    received: usize,
}

impl ChunkBuffer {
    fn total(&self) -> usize {
        self.slots.len()
    }
}

/// Chunk buffers keyed by job id
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    buffers: HashMap<String, ChunkBuffer>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty buffer; a buffer that already exists is kept
    pub fn initialize(&mut self, job_id: &str, total: i64) -> Result<()> {
        let total = usize::try_from(total)
            .ok()
            .filter(|t| *t > 0)
            .ok_or(AssemblyError::InvalidTotal(total))?;

        self.buffers
            .entry(job_id.to_string())
            .or_insert_with(|| ChunkBuffer {
                slots: vec![None; total],
                received: 0,
            });
        Ok(())
    }

    pub fn is_initialized(&self, job_id: &str) -> bool {
        self.buffers.contains_key(job_id)
    }

    /// Store one chunk and return the number of distinct chunks received.
    /// A chunk for an already filled slot changes nothing.
    pub fn add_chunk(&mut self, job_id: &str, index: i64, total: i64, data: &str) -> Result<usize> {
        let buffer = self
            .buffers
            .get_mut(job_id)
            .ok_or_else(|| AssemblyError::UnknownJob(job_id.to_string()))?;

        if usize::try_from(total).ok() != Some(buffer.total()) {
            return Err(AssemblyError::TotalMismatch {
                expected: buffer.total(),
                declared: total,
            });
        }

        let slot = usize::try_from(index)
            .ok()
            .filter(|i| *i < buffer.total())
            .ok_or(AssemblyError::IndexOutOfRange {
                index,
                total: buffer.total(),
            })?;

        if buffer.slots[slot].is_none() {
            buffer.slots[slot] = Some(sanitize_chunk(data));
            buffer.received += 1;
        }
        Ok(buffer.received)
    }

    /// (received, total) for a job
    pub fn progress(&self, job_id: &str) -> Option<(usize, usize)> {
        self.buffers
            .get(job_id)
            .map(|buffer| (buffer.received, buffer.total()))
    }

    pub fn is_complete(&self, job_id: &str) -> bool {
        self.progress(job_id)
            .is_some_and(|(received, total)| received == total)
    }

    /// Concatenate and decode. The buffer is gone afterwards, whatever the outcome.
    pub fn assemble(&mut self, job_id: &str) -> Result<Bytes> {
        let buffer = self
            .buffers
            .remove(job_id)
            .ok_or_else(|| AssemblyError::UnknownJob(job_id.to_string()))?;

        if buffer.received != buffer.total() {
            return Err(AssemblyError::Incomplete {
                received: buffer.received,
                total: buffer.total(),
            });
        }

        let mut encoded = String::new();
        for (index, slot) in buffer.slots.iter().enumerate() {
            match slot {
                Some(chunk) => encoded.push_str(chunk),
                None => return Err(AssemblyError::MissingChunk(index)),
            }
        }

        if encoded.len() % 4 != 0 {
            return Err(AssemblyError::Misaligned(encoded.len()));
        }
        decode_base64(&encoded)
    }

    pub fn discard(&mut self, job_id: &str) {
        self.buffers.remove(job_id);
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

/// Drop everything outside the standard base64 alphabet
pub fn sanitize_chunk(data: &str) -> String {
    data.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '='))
        .collect()
}

pub fn decode_base64(data: &str) -> Result<Bytes> {
    STANDARD
        .decode(sanitize_chunk(data))
        .map(Bytes::from)
        .map_err(|e| AssemblyError::Decode(e.to_string()))
}
