//! Pluggable signing capability.
//!
//! A [`Signer`] hands out a fresh [`SignerSession`] for every element, so no
//! state leaks between the signatures of two nodes. [`Verifier`] mirrors it
//! for checking.

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};

use crate::{Error, Result};

/// Length of a BLAKE3 MAC tag.
pub const MAC_LENGTH: usize = 32;

/// Factory for signing sessions.
pub trait Signer {
    type Session: SignerSession;

    /// Start a freshly reset session.
    fn session(&self) -> Self::Session;
}

/// Streaming signature computation over the bytes fed with `update`.
pub trait SignerSession {
    fn update(&mut self, bytes: &[u8]);

    fn sign(self) -> Result<Vec<u8>>;
}

/// Factory for verifying sessions.
pub trait Verifier {
    type Session: VerifierSession;

    fn session(&self) -> Self::Session;
}

/// Streaming signature check over the bytes fed with `update`.
pub trait VerifierSession {
    fn update(&mut self, bytes: &[u8]);

    fn verify(self, signature: &[u8]) -> bool;
}

impl<T: Signer + ?Sized> Signer for &T {
    type Session = T::Session;

    fn session(&self) -> Self::Session {
        (**self).session()
    }
}

impl<T: Verifier + ?Sized> Verifier for &T {
    type Session = T::Session;

    fn session(&self) -> Self::Session {
        (**self).session()
    }
}

/// Sign a chunk: `sign(chunk)`.
pub fn sign_leaf<S: Signer + ?Sized>(signer: &S, chunk: &[u8]) -> Result<Vec<u8>> {
    let mut session = signer.session();
    session.update(chunk);
    session.sign()
}

/// Sign a node: `sign(concat(children signatures))`.
pub fn sign_node<'a, S, I>(signer: &S, child_signatures: I) -> Result<Vec<u8>>
where
    S: Signer + ?Sized,
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut session = signer.session();
    for signature in child_signatures {
        session.update(signature);
    }
    session.sign()
}

// ── Keyed BLAKE3 ────────────────────────────────────────────────────────

/// Symmetric signer and verifier backed by keyed BLAKE3.
#[derive(Clone)]
pub struct Blake3Mac {
    key: [u8; 32],
}

impl Blake3Mac {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Derive a key from an arbitrary context string and key material.
    pub fn derive(context: &str, material: &[u8]) -> Self {
        Self::new(blake3::derive_key(context, material))
    }
}

impl core::fmt::Debug for Blake3Mac {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Blake3Mac").finish_non_exhaustive()
    }
}

pub struct Blake3Session(blake3::Hasher);

impl Signer for Blake3Mac {
    type Session = Blake3Session;

    fn session(&self) -> Self::Session {
        Blake3Session(blake3::Hasher::new_keyed(&self.key))
    }
}

impl Verifier for Blake3Mac {
    type Session = Blake3Session;

    fn session(&self) -> Self::Session {
        Blake3Session(blake3::Hasher::new_keyed(&self.key))
    }
}

impl SignerSession for Blake3Session {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn sign(self) -> Result<Vec<u8>> {
        Ok(self.0.finalize().as_bytes().to_vec())
    }
}

impl VerifierSession for Blake3Session {
    fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    fn verify(self, signature: &[u8]) -> bool {
        let Ok(tag) = <[u8; MAC_LENGTH]>::try_from(signature) else {
            return false;
        };
        // `blake3::Hash` equality is constant time.
        self.0.finalize() == blake3::Hash::from_bytes(tag)
    }
}

// ── Ed25519 ─────────────────────────────────────────────────────────────

/// Ed25519 signer. Sessions buffer the message because Ed25519 signs the
/// whole input at once.
#[derive(Clone)]
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn new(key: SigningKey) -> Self {
        Self { key }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self::new(SigningKey::from_bytes(secret))
    }

    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier::new(self.key.verifying_key())
    }
}

impl core::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public", &hex::encode(self.key.verifying_key().as_bytes()))
            .finish()
    }
}

pub struct Ed25519SignerSession {
    key: SigningKey,
    message: Vec<u8>,
}

impl Signer for Ed25519Signer {
    type Session = Ed25519SignerSession;

    fn session(&self) -> Self::Session {
        Ed25519SignerSession {
            key: self.key.clone(),
            message: Vec::new(),
        }
    }
}

impl SignerSession for Ed25519SignerSession {
    fn update(&mut self, bytes: &[u8]) {
        self.message.extend_from_slice(bytes);
    }

    fn sign(self) -> Result<Vec<u8>> {
        use ed25519_dalek::Signer as _;

        self.key
            .try_sign(&self.message)
            .map(|signature| signature.to_bytes().to_vec())
            .map_err(|e| Error::SignatureComputationFailure(e.to_string()))
    }
}

/// Ed25519 verifier for signatures produced by [`Ed25519Signer`].
#[derive(Clone, Debug)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    pub fn new(key: VerifyingKey) -> Self {
        Self { key }
    }
}

pub struct Ed25519VerifierSession {
    key: VerifyingKey,
    message: Vec<u8>,
}

impl Verifier for Ed25519Verifier {
    type Session = Ed25519VerifierSession;

    fn session(&self) -> Self::Session {
        Ed25519VerifierSession {
            key: self.key,
            message: Vec::new(),
        }
    }
}

impl VerifierSession for Ed25519VerifierSession {
    fn update(&mut self, bytes: &[u8]) {
        self.message.extend_from_slice(bytes);
    }

    fn verify(self, signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(signature) => self.key.verify_strict(&self.message, &signature).is_ok(),
            Err(_) => false,
        }
    }
}
