//! Chunk accumulation
//!
//! Collects the fragments a recorder emits and assembles them on stop.

use super::artifact::{Artifact, ArtifactStore};
use super::state::SessionState;
use crate::utils::error::{CaptureResult, ChunkError};

/// Ordered, append-only chunk list for one session
#[derive(Debug, Default)]
pub struct ChunkBuffer {
    chunks: Vec<Vec<u8>>,
    byte_size: u64,
    finalized: bool,
}

impl ChunkBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk emitted while the session is in `state`
    ///
    /// Only `Recording` and the `Stopping` flush accept chunks. Anything
    /// else means a native event raced a transition. Empty chunks are
    /// dropped. Returns the running byte total.
    pub fn append(&mut self, state: SessionState, chunk: Vec<u8>) -> Result<u64, ChunkError> {
        if self.finalized {
            return Err(ChunkError::AlreadyFinalized);
        }
        if !state.accepts_chunks() {
            return Err(ChunkError::NotAccepting(state));
        }
        if chunk.is_empty() {
            return Ok(self.byte_size);
        }

        self.byte_size += chunk.len() as u64;
        self.chunks.push(chunk);
        Ok(self.byte_size)
    }

    /// Bytes received so far. Not reset by [`ChunkBuffer::discard`].
    pub fn byte_size(&self) -> u64 {
        self.byte_size
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Assemble every chunk, in arrival order, into an artifact
    pub fn finalize(&mut self, mime_hint: &str, store: &dyn ArtifactStore) -> CaptureResult<Artifact> {
        if self.finalized {
            return Err(ChunkError::AlreadyFinalized.into());
        }
        self.finalized = true;

        let chunks = std::mem::take(&mut self.chunks);
        tracing::debug!(
            "Finalizing {} chunk(s), {} bytes as {}",
            chunks.len(),
            self.byte_size,
            mime_hint
        );
        store.materialize(chunks, mime_hint)
    }

    /// Drop every chunk without producing an artifact
    pub fn discard(&mut self) {
        if !self.chunks.is_empty() {
            tracing::debug!("Discarding {} chunk(s)", self.chunks.len());
        }
        self.chunks.clear();
        self.finalized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::artifact::MemoryArtifactStore;

    #[test]
    fn test_split_and_reassemble_matches_reference() {
        let reference: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let store = MemoryArtifactStore::new();

        for pieces in [1usize, 3, 7, 64] {
            let mut buffer = ChunkBuffer::new();
            let size = reference.len().div_ceil(pieces);
            for chunk in reference.chunks(size) {
                buffer.append(SessionState::Recording, chunk.to_vec()).unwrap();
            }

            assert_eq!(buffer.byte_size(), reference.len() as u64);
            let artifact = buffer.finalize("audio/webm", &store).unwrap();
            assert_eq!(artifact.bytes(), reference.as_slice());
        }
    }

    #[test]
    fn test_append_rejected_outside_recording() {
        let mut buffer = ChunkBuffer::new();

        assert_eq!(
            buffer.append(SessionState::Paused, vec![1]),
            Err(ChunkError::NotAccepting(SessionState::Paused))
        );
        assert!(buffer.append(SessionState::Stopping, vec![1]).is_ok());
        assert_eq!(buffer.byte_size(), 1);
    }

    #[test]
    fn test_finalize_only_once() {
        let store = MemoryArtifactStore::new();
        let mut buffer = ChunkBuffer::new();
        buffer.append(SessionState::Recording, vec![9; 3]).unwrap();

        assert!(buffer.finalize("audio/webm", &store).is_ok());
        assert!(buffer.finalize("audio/webm", &store).is_err());
        assert_eq!(
            buffer.append(SessionState::Recording, vec![1]),
            Err(ChunkError::AlreadyFinalized)
        );
    }

    #[test]
    fn test_discard_keeps_byte_total() {
        let mut buffer = ChunkBuffer::new();
        buffer.append(SessionState::Recording, vec![0; 10]).unwrap();
        buffer.append(SessionState::Recording, Vec::new()).unwrap();
        assert_eq!(buffer.len(), 1);

        buffer.discard();

        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 10);
    }
}
