//! Name-to-factory mappings for every pluggable algorithm kind.
//!
//! A [`Registry`] holds one ordered factory list per algorithm kind. List
//! order is the local preference order and is what gets advertised in
//! KEXINIT; [`FactorySet::create`] instantiates an implementation by its
//! negotiated wire name.

use super::cipher::{Aes128Ctr, Aes256Ctr};
use super::compress::Zlib;
use super::digest::{Sha1Digest, Sha256Digest};
use super::kex::{Curve25519, DhGroup14};
use super::mac::{HmacSha1, HmacSha256, HmacSha512};
use super::random::SystemRandom;
use super::{Cipher, Compression, Digest, KeyExchange, Mac, Random, Signature};
use crate::ssh::hostkey::{RsaSha256, RsaSha512, SshEd25519, SshRsa};
use skiff_platform::{Error, Result};

/// A named constructor for one algorithm implementation.
pub struct Factory<T: ?Sized> {
    /// Wire name advertised during negotiation.
    pub name: &'static str,
    /// Builds a fresh, uninitialized instance.
    pub make: fn() -> Box<T>,
}

impl<T: ?Sized> Factory<T> {
    /// Creates a factory.
    pub fn new(name: &'static str, make: fn() -> Box<T>) -> Self {
        Self { name, make }
    }
}

impl<T: ?Sized> std::fmt::Debug for Factory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Factory").field("name", &self.name).finish()
    }
}

/// An ordered list of factories for one algorithm kind.
pub struct FactorySet<T: ?Sized> {
    factories: Vec<Factory<T>>,
}

impl<T: ?Sized> std::fmt::Debug for FactorySet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactorySet")
            .field("names", &self.names())
            .finish()
    }
}

impl<T: ?Sized> FactorySet<T> {
    /// Creates a set from factories in preference order.
    pub fn new(factories: Vec<Factory<T>>) -> Self {
        Self { factories }
    }

    /// The comma-joined names in preference order, as advertised in KEXINIT.
    pub fn names(&self) -> String {
        self.factories
            .iter()
            .map(|f| f.name)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Instantiates the factory whose name equals `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownAlgorithm`] when no factory matches.
    pub fn create(&self, name: &str) -> Result<Box<T>> {
        self.factories
            .iter()
            .find(|f| f.name == name)
            .map(|f| (f.make)())
            .ok_or_else(|| Error::UnknownAlgorithm(format!("'{}' is not registered", name)))
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

/// A named constructor for one compression algorithm.
///
/// `none` is a registered name whose factory produces no instance at all,
/// which is how "no compression" flows through negotiation.
pub struct CompressionFactory {
    /// Wire name advertised during negotiation.
    pub name: &'static str,
    /// Builds a direction instance, or `None` for the `none` algorithm.
    pub make: fn() -> Option<Box<dyn Compression>>,
}

/// Ordered compression factory list.
pub struct CompressionSet {
    factories: Vec<CompressionFactory>,
}

impl CompressionSet {
    /// Creates a set from factories in preference order.
    pub fn new(factories: Vec<CompressionFactory>) -> Self {
        Self { factories }
    }

    /// The comma-joined names in preference order.
    pub fn names(&self) -> String {
        self.factories
            .iter()
            .map(|f| f.name)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Instantiates the named compression, `Ok(None)` for `none`.
    pub fn create(&self, name: &str) -> Result<Option<Box<dyn Compression>>> {
        self.factories
            .iter()
            .find(|f| f.name == name)
            .map(|f| (f.make)())
            .ok_or_else(|| Error::UnknownAlgorithm(format!("'{}' is not registered", name)))
    }
}

impl std::fmt::Debug for CompressionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionSet")
            .field("names", &self.names())
            .finish()
    }
}

/// All algorithm factories for one transport.
#[derive(Debug)]
pub struct Registry {
    /// Key exchange methods.
    pub kex: FactorySet<dyn KeyExchange>,
    /// Host-key signature algorithms.
    pub signature: FactorySet<dyn Signature>,
    /// Packet ciphers.
    pub cipher: FactorySet<dyn Cipher>,
    /// Packet MACs.
    pub mac: FactorySet<dyn Mac>,
    /// Payload compression.
    pub compression: CompressionSet,
    /// Hash functions for key derivation, looked up by the name the key
    /// exchange reports.
    pub digest: FactorySet<dyn Digest>,
    /// The CSPRNG used for cookies and padding.
    pub random: fn() -> Box<dyn Random>,
}

impl Registry {
    /// The default client algorithm suite, in preference order.
    pub fn default_client() -> Self {
        Self {
            kex: FactorySet::new(vec![
                Factory::new("curve25519-sha256", || Box::new(Curve25519::new())),
                Factory::new("curve25519-sha256@libssh.org", || {
                    Box::new(Curve25519::new())
                }),
                Factory::new("diffie-hellman-group14-sha256", || {
                    Box::new(DhGroup14::sha256())
                }),
                Factory::new("diffie-hellman-group14-sha1", || Box::new(DhGroup14::sha1())),
            ]),
            signature: FactorySet::new(vec![
                Factory::new("ssh-ed25519", || Box::new(SshEd25519::new())),
                Factory::new("rsa-sha2-512", || Box::new(RsaSha512::new())),
                Factory::new("rsa-sha2-256", || Box::new(RsaSha256::new())),
                Factory::new("ssh-rsa", || Box::new(SshRsa::new())),
            ]),
            cipher: FactorySet::new(vec![
                Factory::new("aes128-ctr", || Box::new(Aes128Ctr::new())),
                Factory::new("aes256-ctr", || Box::new(Aes256Ctr::new())),
            ]),
            mac: FactorySet::new(vec![
                Factory::new("hmac-sha2-256", || Box::new(HmacSha256::new())),
                Factory::new("hmac-sha1", || Box::new(HmacSha1::new())),
                Factory::new("hmac-sha2-512", || Box::new(HmacSha512::new())),
            ]),
            compression: CompressionSet::new(vec![
                CompressionFactory {
                    name: "none",
                    make: || None,
                },
                CompressionFactory {
                    name: "zlib@openssh.com",
                    make: || Some(Box::new(Zlib::new(true))),
                },
                CompressionFactory {
                    name: "zlib",
                    make: || Some(Box::new(Zlib::new(false))),
                },
            ]),
            digest: FactorySet::new(vec![
                Factory::new("sha256", || Box::new(Sha256Digest::new())),
                Factory::new("sha1", || Box::new(Sha1Digest::new())),
            ]),
            random: || Box::new(SystemRandom::new()),
        }
    }

    /// Checks that every kind required for negotiation is populated.
    pub fn validate(&self) -> Result<()> {
        if self.kex.is_empty()
            || self.signature.is_empty()
            || self.cipher.is_empty()
            || self.mac.is_empty()
            || self.compression.factories.is_empty()
        {
            return Err(Error::Config(
                "registry must provide at least one algorithm of every kind".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::default_client()
    }
}
