//! Hash algorithms used for exchange hashing and key derivation.

use super::Digest;
use sha1::Sha1;
use sha2::{Digest as _, Sha256};

/// SHA-1, for `diffie-hellman-group14-sha1`.
#[derive(Debug, Default)]
pub struct Sha1Digest(Sha1);

impl Sha1Digest {
    /// Creates a fresh SHA-1 state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Digest for Sha1Digest {
    fn size(&self) -> usize {
        20
    }

    fn update(&mut self, data: &[u8]) {
        sha1::Digest::update(&mut self.0, data);
    }

    fn finish(&mut self) -> Vec<u8> {
        sha1::Digest::finalize_reset(&mut self.0).to_vec()
    }
}

/// SHA-256, for `curve25519-sha256` and `diffie-hellman-group14-sha256`.
#[derive(Debug, Default)]
pub struct Sha256Digest(Sha256);

impl Sha256Digest {
    /// Creates a fresh SHA-256 state.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Digest for Sha256Digest {
    fn size(&self) -> usize {
        32
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(&mut self) -> Vec<u8> {
        self.0.finalize_reset().to_vec()
    }
}
