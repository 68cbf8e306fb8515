//! Packet ciphers.
//!
//! CTR-mode AES applies the same keystream in both directions, so
//! [`CipherMode`] only matters to implementations that distinguish them.
//! Before NEWKEYS no cipher is installed and packets travel in the clear.

use super::{Cipher, CipherMode};
use aes::{Aes128, Aes256};
use cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use skiff_platform::{Error, Result};

macro_rules! impl_aes_ctr {
    ($(#[$doc:meta])* $name:ident, $core:ty, $key_len:expr) => {
        $(#[$doc])*
        #[derive(Default)]
        pub struct $name {
            cipher: Option<Ctr128BE<$core>>,
        }

        impl $name {
            /// Creates an uninitialized instance; call `init` with key and IV.
            pub fn new() -> Self {
                Self::default()
            }
        }

        impl Cipher for $name {
            fn block_size(&self) -> usize {
                16
            }

            fn key_len(&self) -> usize {
                $key_len
            }

            fn iv_len(&self) -> usize {
                16
            }

            fn init(&mut self, _mode: CipherMode, key: &[u8], iv: &[u8]) -> Result<()> {
                if key.len() < self.key_len() || iv.len() < self.iv_len() {
                    return Err(Error::Protocol(format!(
                        "cipher key material too short: key {}/{}, iv {}/{}",
                        key.len(),
                        self.key_len(),
                        iv.len(),
                        self.iv_len()
                    )));
                }
                self.cipher = Some(
                    Ctr128BE::<$core>::new_from_slices(
                        &key[..self.key_len()],
                        &iv[..self.iv_len()],
                    )
                    .map_err(|_| Error::Protocol("invalid cipher key length".to_string()))?,
                );
                Ok(())
            }

            fn update(&mut self, data: &mut [u8]) -> Result<()> {
                let cipher = self
                    .cipher
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("cipher not initialized".to_string()))?;
                cipher.apply_keystream(data);
                Ok(())
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("initialized", &self.cipher.is_some())
                    .finish()
            }
        }
    };
}

impl_aes_ctr!(
    /// `aes128-ctr` (RFC 4344).
    Aes128Ctr,
    Aes128,
    16
);

impl_aes_ctr!(
    /// `aes256-ctr` (RFC 4344).
    Aes256Ctr,
    Aes256,
    32
);
