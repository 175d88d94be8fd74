mod test_sequential;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering::SeqCst},
};

use crate::{
    Blake3Mac, Error, Result, Signer, SignerSession, TreeConfig, signer::Blake3Session,
};

pub(crate) fn mac() -> Blake3Mac {
    Blake3Mac::derive("oblivious-chunk-tree tests", b"primary key")
}

pub(crate) fn other_mac() -> Blake3Mac {
    Blake3Mac::derive("oblivious-chunk-tree tests", b"rotated key")
}

pub(crate) fn config(chunk_size: usize) -> TreeConfig {
    TreeConfig::default().with_chunk_size(chunk_size).with_seed(7)
}

/// Deterministic filler bytes.
pub(crate) fn bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// A full chunk whose bytes all equal `tag`.
pub(crate) fn chunk_of(tag: u8, chunk_size: usize) -> Vec<u8> {
    vec![tag; chunk_size]
}

/// Byte offsets of the signature in each blob record, with its length and
/// the record's degree.
pub(crate) fn record_layout(blob: &[u8]) -> Vec<(usize, usize, usize)> {
    let mut layout = Vec::new();
    let mut offset = 1;
    while offset < blob.len() {
        let read = |at: usize| i32::from_be_bytes(blob[at..at + 4].try_into().unwrap()) as usize;
        let len = read(offset);
        let degree_at = offset + 4 + len;
        let degree = read(degree_at);
        layout.push((offset + 4, len, degree));
        offset = degree_at + 4;
    }
    layout
}

/// Signer that starts failing once its signing budget is spent.
#[derive(Clone)]
pub(crate) struct FlakySigner {
    inner: Blake3Mac,
    budget: Arc<AtomicUsize>,
}

impl FlakySigner {
    pub(crate) fn new(inner: Blake3Mac, budget: usize) -> Self {
        FlakySigner {
            inner,
            budget: Arc::new(AtomicUsize::new(budget)),
        }
    }
}

pub(crate) struct FlakySession(Option<Blake3Session>);

impl Signer for FlakySigner {
    type Session = FlakySession;

    fn session(&self) -> FlakySession {
        let allowed = self
            .budget
            .fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1))
            .is_ok();
        FlakySession(allowed.then(|| Signer::session(&self.inner)))
    }
}

impl SignerSession for FlakySession {
    fn update(&mut self, bytes: &[u8]) {
        if let Some(session) = &mut self.0 {
            SignerSession::update(session, bytes);
        }
    }

    fn sign(self) -> Result<Vec<u8>> {
        match self.0 {
            Some(session) => SignerSession::sign(session),
            None => Err(Error::SignatureComputationFailure(
                "signing budget exhausted".to_string(),
            )),
        }
    }
}
