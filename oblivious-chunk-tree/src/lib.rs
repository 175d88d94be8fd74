//! Randomized, tamper-evident chunk tree.
//!
//! A byte stream is split into fixed-size chunks which become the leaves of
//! a 2-3 tree. Every leaf carries a signature of its chunk and every internal
//! node a signature over its children's signatures, so the root signature
//! authenticates the whole stream. Branching degrees are chosen by coin flips
//! on every build and edit, which keeps the tree's shape independent of the
//! history of insertions and deletions that produced it.
//!
//! # Engines
//!
//! - [`SequentialTree`]: single writer, journaled so a failed signing leaves
//!   the tree untouched.
//! - [`ConcurrentTree`]: lock-free. Operations are queued as tasks and any
//!   [`Worker`] helps whichever task is current.
//!
//! Both implement [`Engine`] and serialize to the same signature blob, which
//! [`verify_signature`] checks against the original bytes.
//!
//! # Signers
//!
//! - [`Blake3Mac`]: keyed BLAKE3, symmetric.
//! - [`Ed25519Signer`] / [`Ed25519Verifier`]: public-key signatures.

mod builder;
pub mod concurrent;
mod config;
pub mod element;
mod engine;
mod error;
mod sequential;
pub mod signature;
pub mod signer;
#[cfg(test)]
mod tests;
pub mod tree;
pub mod visualize;

pub use builder::TreeBuilder;
pub use concurrent::{ConcurrentTree, Operation, TaskHandle, TaskOutcome, Worker};
pub use config::{DEFAULT_CHUNK_SIZE, TreeConfig};
pub use element::{Element, ElementId, ElementKind};
pub use engine::Engine;
pub use error::{Error, Result};
pub use sequential::SequentialTree;
pub use signature::{
    BLOB_VERSION, check_signature, decode_records, generate_signature, verify_signature,
};
pub use signer::{
    Blake3Mac, Ed25519Signer, Ed25519Verifier, Signer, SignerSession, Verifier, VerifierSession,
};
pub use tree::Tree;
