use crate::{
    Result,
    signature::verify_signature,
    signer::{Signer, Verifier},
};

/// Operations common to the sequential tree and the concurrent workers.
pub trait Engine<S: Signer + ?Sized> {
    /// Insert `value` as a chunk before `position` (append at `size()`).
    fn insert(&self, value: &[u8], position: usize, signer: &S) -> Result<()>;

    /// Remove the chunk at `position`.
    fn delete(&self, position: usize, signer: &S) -> Result<()>;

    /// Serialize the tree into a signature blob.
    fn generate_signature(&self) -> Result<Vec<u8>>;

    /// Number of chunks.
    fn size(&self) -> usize;

    fn chunk_size(&self) -> usize;

    /// Check `blob` against `original` with this engine's chunk size.
    fn verify_signature<V: Verifier + ?Sized>(
        &self,
        original: &[u8],
        blob: &[u8],
        verifier: &V,
    ) -> bool {
        verify_signature(original, blob, verifier, self.chunk_size())
    }
}
