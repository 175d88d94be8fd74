//! Depth-first signature blob: generation and verification.
//!
//! Format: one version byte, then one record per element in pre-order
//! (an element, then its children left to right):
//!
//! `signature_len(i32 BE) || signature || degree(i32 BE)`
//!
//! A leaf signs its chunk, a node signs the concatenation of its children's
//! signatures. The empty tree serializes to the version byte alone.

use crate::{
    Error, Result,
    signer::{Verifier, VerifierSession},
};

/// Version byte leading every blob.
pub const BLOB_VERSION: u8 = 1;

/// Deepest nesting accepted while verifying. A 2-3 tree this deep would hold
/// more than 2^64 leaves, so anything beyond is malformed.
const MAX_DEPTH: usize = 64;

/// Read access to a signed tree, implemented by both engines.
pub trait SignedView {
    type Id: Copy;

    fn root(&self) -> Option<Self::Id>;

    fn signature(&self, id: Self::Id) -> &[u8];

    fn children(
        &self,
        id: Self::Id,
    ) -> impl DoubleEndedIterator<Item = Self::Id> + ExactSizeIterator;
}

/// One decoded blob record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRecord {
    pub signature: Vec<u8>,
    pub degree: usize,
}

/// Serialize every element of `view` in pre-order.
pub fn generate_signature<T: SignedView + ?Sized>(view: &T) -> Result<Vec<u8>> {
    let mut blob = vec![BLOB_VERSION];
    let mut stack: Vec<T::Id> = view.root().into_iter().collect();
    while let Some(id) = stack.pop() {
        let children = view.children(id);
        write_record(&mut blob, view.signature(id), children.len())?;
        stack.extend(children.rev());
    }
    blob.shrink_to_fit();
    Ok(blob)
}

fn write_record(blob: &mut Vec<u8>, signature: &[u8], degree: usize) -> Result<()> {
    let len = i32::try_from(signature.len()).map_err(|_| {
        Error::SignatureComputationFailure(format!(
            "signature of {} bytes does not fit a record",
            signature.len()
        ))
    })?;
    blob.reserve(signature.len() + 8);
    blob.extend_from_slice(&len.to_be_bytes());
    blob.extend_from_slice(signature);
    blob.extend_from_slice(&(degree as i32).to_be_bytes());
    Ok(())
}

/// Decode the records of `blob` without verifying them.
pub fn decode_records(blob: &[u8]) -> Result<Vec<BlobRecord>> {
    let mut reader = BlobReader::new(blob)?;
    let mut records = Vec::new();
    while !reader.is_exhausted() {
        let (signature, degree) = reader.record()?;
        records.push(BlobRecord {
            signature: signature.to_vec(),
            degree,
        });
    }
    Ok(records)
}

/// `true` iff `blob` is a valid signature of `original` under `verifier`.
pub fn verify_signature<V: Verifier + ?Sized>(
    original: &[u8],
    blob: &[u8],
    verifier: &V,
    chunk_size: usize,
) -> bool {
    check_signature(original, blob, verifier, chunk_size).is_ok()
}

/// Like [`verify_signature`] but reports why verification failed.
///
/// Stops at the first mismatch.
pub fn check_signature<V: Verifier + ?Sized>(
    original: &[u8],
    blob: &[u8],
    verifier: &V,
    chunk_size: usize,
) -> Result<()> {
    if chunk_size == 0 {
        return Err(Error::InvalidConfig("chunk size must be greater than zero".to_string()));
    }
    let mut reader = BlobReader::new(blob)?;
    let mut remaining = original;
    if reader.is_exhausted() {
        if original.is_empty() {
            return Ok(());
        }
        return Err(Error::SignatureVerificationFailure(
            "empty tree signature for non-empty content".to_string(),
        ));
    }
    verify_record(&mut reader, &mut remaining, verifier, chunk_size, 0)?;
    if !reader.is_exhausted() {
        return Err(Error::structural("trailing bytes after the root record"));
    }
    if !remaining.is_empty() {
        return Err(Error::SignatureVerificationFailure(format!(
            "{} bytes of content are not covered by the signature",
            remaining.len()
        )));
    }
    Ok(())
}

/// Verify the record at the reader's position and everything below it.
///
/// Returns the record's raw signature for the parent to fold in.
fn verify_record<'b, V: Verifier + ?Sized>(
    reader: &mut BlobReader<'b>,
    original: &mut &[u8],
    verifier: &V,
    chunk_size: usize,
    depth: usize,
) -> Result<&'b [u8]> {
    if depth > MAX_DEPTH {
        return Err(Error::structural("signature blob nested too deeply"));
    }
    let (signature, degree) = reader.record()?;
    let mut session = verifier.session();
    match degree {
        0 => {
            if original.is_empty() {
                return Err(Error::SignatureVerificationFailure(
                    "signature has more leaves than the content has chunks".to_string(),
                ));
            }
            let (chunk, rest) = original.split_at(chunk_size.min(original.len()));
            *original = rest;
            session.update(chunk);
        }
        2 | 3 => {
            for _ in 0..degree {
                let child = verify_record(reader, original, verifier, chunk_size, depth + 1)?;
                session.update(child);
            }
        }
        _ => {
            return Err(Error::structural(format!("record with degree {degree}")));
        }
    }
    if !session.verify(signature) {
        return Err(Error::SignatureVerificationFailure(format!(
            "{} signature mismatch at depth {depth}",
            if degree == 0 { "leaf" } else { "node" }
        )));
    }
    Ok(signature)
}

struct BlobReader<'b> {
    bytes: &'b [u8],
}

impl<'b> BlobReader<'b> {
    fn new(blob: &'b [u8]) -> Result<Self> {
        match blob.split_first() {
            Some((&BLOB_VERSION, rest)) => Ok(BlobReader { bytes: rest }),
            Some((version, _)) => Err(Error::structural(format!(
                "unsupported signature blob version {version}"
            ))),
            None => Err(Error::structural("empty signature blob")),
        }
    }

    fn is_exhausted(&self) -> bool {
        self.bytes.is_empty()
    }

    fn take(&mut self, len: usize) -> Result<&'b [u8]> {
        if len > self.bytes.len() {
            return Err(Error::structural(format!(
                "record needs {len} bytes, {} left",
                self.bytes.len()
            )));
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    fn read_len(&mut self) -> Result<usize> {
        let raw: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| Error::structural("truncated length field"))?;
        usize::try_from(i32::from_be_bytes(raw))
            .map_err(|_| Error::structural("negative length field"))
    }

    fn record(&mut self) -> Result<(&'b [u8], usize)> {
        let len = self.read_len()?;
        let signature = self.take(len)?;
        let degree = self.read_len()?;
        Ok((signature, degree))
    }
}
