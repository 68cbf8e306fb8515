//! HMAC message authentication (RFC 4253 Section 6.4).
//!
//! The MAC for each packet is computed over the packet sequence number
//! concatenated with the unencrypted packet:
//!
//! ```text
//! mac = MAC(key, sequence_number || unencrypted_packet)
//! ```
//!
//! Tag verification uses constant-time comparison.

use super::Mac;
use hmac::{Hmac, Mac as _};
use skiff_platform::{Error, Result};
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

macro_rules! impl_hmac {
    ($(#[$doc:meta])* $name:ident, $digest:ty, $size:expr) => {
        $(#[$doc])*
        #[derive(Default)]
        pub struct $name {
            key: Vec<u8>,
        }

        impl $name {
            /// Creates an uninitialized instance; call `init` with the key.
            pub fn new() -> Self {
                Self::default()
            }
        }

        impl Mac for $name {
            fn size(&self) -> usize {
                $size
            }

            fn key_len(&self) -> usize {
                $size
            }

            fn init(&mut self, key: &[u8]) -> Result<()> {
                if key.len() < self.key_len() {
                    return Err(Error::Protocol(format!(
                        "MAC key too short: expected {}, got {}",
                        self.key_len(),
                        key.len()
                    )));
                }
                self.key.zeroize();
                self.key = key[..self.key_len()].to_vec();
                Ok(())
            }

            fn compute(&mut self, seq: u32, packet: &[u8]) -> Result<Vec<u8>> {
                if self.key.is_empty() {
                    return Err(Error::Protocol("MAC key not initialized".to_string()));
                }
                let mut mac = Hmac::<$digest>::new_from_slice(&self.key)
                    .map_err(|_| Error::Protocol("invalid HMAC key length".to_string()))?;
                mac.update(&seq.to_be_bytes());
                mac.update(packet);
                Ok(mac.finalize().into_bytes().to_vec())
            }

            fn verify(&mut self, seq: u32, packet: &[u8], tag: &[u8]) -> Result<()> {
                let expected = self.compute(seq, packet)?;
                if expected.len() == tag.len() && bool::from(expected.ct_eq(tag)) {
                    Ok(())
                } else {
                    Err(Error::Mac(format!(
                        "MAC verification failed for inbound packet #{}",
                        seq
                    )))
                }
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.key.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("key", &"<redacted>")
                    .finish()
            }
        }
    };
}

impl_hmac!(
    /// `hmac-sha1` (RFC 4253).
    HmacSha1,
    sha1::Sha1,
    20
);

impl_hmac!(
    /// `hmac-sha2-256` (RFC 6668).
    HmacSha256,
    sha2::Sha256,
    32
);

impl_hmac!(
    /// `hmac-sha2-512` (RFC 6668).
    HmacSha512,
    sha2::Sha512,
    64
);
