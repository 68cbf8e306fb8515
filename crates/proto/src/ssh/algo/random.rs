//! CSPRNG used for packet padding and KEXINIT cookies.

use super::Random;
use rand::RngCore;

/// The process-wide CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRandom;

impl SystemRandom {
    /// Creates a handle to the system CSPRNG.
    pub fn new() -> Self {
        Self
    }
}

impl Random for SystemRandom {
    fn fill(&self, buf: &mut [u8]) {
        rand::thread_rng().fill_bytes(buf);
    }
}
