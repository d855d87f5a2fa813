//! Digest Engine
//!
//! Streaming SHA-1 used for whole-partition verification and per-record checks.

use sha1::{Digest as _, Sha1};

/// Length in bytes of every digest in the update format
pub const DIGEST_LEN: usize = 20;

/// A finalized 20-byte digest
pub type Digest = [u8; DIGEST_LEN];

/// Incremental hasher. Each logical computation gets a fresh instance.
#[derive(Clone, Default)]
pub struct DigestEngine {
    hasher: Sha1,
}

impl DigestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a chunk into the running state
    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finalize, consuming the engine
    pub fn digest(self) -> Digest {
        self.hasher.finalize().into()
    }
}

/// One-shot digest of a byte slice
pub fn digest_of(bytes: &[u8]) -> Digest {
    let mut engine = DigestEngine::new();
    engine.update(bytes);
    engine.digest()
}

/// True when every byte is zero (the "unchecked" marker)
pub fn is_zero(digest: &Digest) -> bool {
    digest.iter().all(|b| *b == 0)
}

/// Lowercase hex rendering for logs and error messages
pub fn to_hex(digest: &Digest) -> String {
    hex::encode(digest)
}

/// Parse a 40-character hex string
pub fn from_hex(s: &str) -> Option<Digest> {
    let bytes = hex::decode(s.trim()).ok()?;
    bytes.try_into().ok()
}
