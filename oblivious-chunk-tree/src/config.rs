//! Tree configuration.

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

use crate::{Error, Result};

/// Chunk size used when none is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Settings shared by both engines.
///
/// `rng_seed` makes every coin flip reproducible; leave it unset outside of
/// tests so the branching structure stays unpredictable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TreeConfig {
    pub chunk_size: usize,
    pub rng_seed: Option<u64>,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            rng_seed: None,
        }
    }
}

impl TreeConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "chunk size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Create the random source for one engine or worker.
    ///
    /// `stream` separates the sequences drawn by different workers sharing a
    /// seeded config.
    pub(crate) fn rng(&self, stream: u64) -> ChaCha20Rng {
        match self.rng_seed {
            Some(seed) => {
                let mut rng = ChaCha20Rng::seed_from_u64(seed);
                rng.set_stream(stream);
                rng
            }
            None => ChaCha20Rng::from_entropy(),
        }
    }

    /// Split `bytes` into chunks of at most `chunk_size` bytes.
    pub fn chunks<'a>(&self, bytes: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
        bytes.chunks(self.chunk_size)
    }

    /// Check that placing `value` at `position` keeps every chunk but the last
    /// exactly `chunk_size` bytes long.
    ///
    /// `last_len` is the length of the current last chunk, if any.
    pub(crate) fn check_insert(
        &self,
        value: &[u8],
        position: usize,
        size: usize,
        last_len: Option<usize>,
    ) -> Result<()> {
        if position > size {
            return Err(Error::IndexOutOfRange { position, size });
        }
        if value.is_empty() || value.len() > self.chunk_size {
            return Err(Error::InvalidChunk(format!(
                "chunk of {} bytes, expected 1..={}",
                value.len(),
                self.chunk_size
            )));
        }
        let appending = position == size;
        if value.len() < self.chunk_size && !appending {
            return Err(Error::InvalidChunk(format!(
                "short chunk of {} bytes may only be appended",
                value.len()
            )));
        }
        if appending && last_len.is_some_and(|len| len < self.chunk_size) {
            return Err(Error::InvalidChunk(
                "cannot append after a short final chunk".to_string(),
            ));
        }
        Ok(())
    }
}
