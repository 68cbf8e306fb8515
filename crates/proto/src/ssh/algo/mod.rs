//! Pluggable algorithm interfaces and built-in implementations.
//!
//! Every cryptographic primitive the transport uses sits behind one of the
//! traits in this module, so the negotiation machinery can pick
//! implementations by wire name at runtime:
//!
//! - [`Cipher`] - block/stream ciphers applied in place to packet bytes
//! - [`Mac`] - per-packet message authentication over `seq || packet`
//! - [`Digest`] - hash functions for the exchange hash and key derivation
//! - [`Compression`] - payload compression, optionally "delayed" until
//!   user authentication completes
//! - [`KeyExchange`] - one full client-side key exchange run
//! - [`Signature`] - host-key signature verification
//! - [`Random`] - the CSPRNG used for padding and cookies
//!
//! The name-to-factory mappings live in [`registry`].

pub mod cipher;
pub mod compress;
pub mod digest;
pub mod kex;
pub mod mac;
pub mod random;
pub mod registry;

use crate::ssh::buffer::Buffer;
use crate::ssh::hostkey::HostKey;
use num_bigint::BigInt;
use skiff_platform::Result;

/// Direction a cipher instance is initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Outbound packets.
    Encrypt,
    /// Inbound packets.
    Decrypt,
}

/// An SSH packet cipher, operating in place on packet bytes.
pub trait Cipher: Send {
    /// Cipher block size in bytes (the packet framing granularity).
    fn block_size(&self) -> usize;

    /// Required key length in bytes.
    fn key_len(&self) -> usize;

    /// Required IV length in bytes.
    fn iv_len(&self) -> usize;

    /// Loads key material for the given direction.
    fn init(&mut self, mode: CipherMode, key: &[u8], iv: &[u8]) -> Result<()>;

    /// Transforms `data` in place.
    fn update(&mut self, data: &mut [u8]) -> Result<()>;
}

/// A per-packet MAC over the packet sequence number and unencrypted packet.
pub trait Mac: Send {
    /// Output (tag) length in bytes.
    fn size(&self) -> usize;

    /// Required key length in bytes.
    fn key_len(&self) -> usize;

    /// Loads the MAC key.
    fn init(&mut self, key: &[u8]) -> Result<()>;

    /// Computes `MAC(key, seq || packet)`.
    fn compute(&mut self, seq: u32, packet: &[u8]) -> Result<Vec<u8>>;

    /// Verifies a received tag in constant time.
    fn verify(&mut self, seq: u32, packet: &[u8], tag: &[u8]) -> Result<()>;
}

/// An incremental hash function. `finish` resets the state for reuse.
pub trait Digest: Send {
    /// Output length in bytes.
    fn size(&self) -> usize;

    /// Absorbs bytes.
    fn update(&mut self, data: &[u8]);

    /// Produces the digest and resets.
    fn finish(&mut self) -> Vec<u8>;
}

/// Direction a compression instance is initialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMode {
    /// Compressing outbound payloads.
    Deflate,
    /// Decompressing inbound payloads.
    Inflate,
}

/// Payload compression. One instance handles one direction and keeps its
/// stream state across packets.
pub trait Compression: Send {
    /// Whether this algorithm only activates after user authentication
    /// (`zlib@openssh.com`).
    fn is_delayed(&self) -> bool;

    /// Prepares the stream for the given direction. `level` below zero
    /// selects the implementation default.
    fn init(&mut self, mode: CompressionMode, level: i32) -> Result<()>;

    /// Compresses one payload.
    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompresses one payload.
    fn uncompress(&mut self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Identification strings and KEXINIT payloads a key exchange hashes over.
#[derive(Debug, Clone, Copy)]
pub struct KexInput<'a> {
    /// Our identification line, without terminator (`V_C`).
    pub client_id: &'a str,
    /// The server's identification line, without terminator (`V_S`).
    pub server_id: &'a str,
    /// Raw payload of our KEXINIT, including the message byte (`I_C`).
    pub client_kexinit: &'a [u8],
    /// Raw payload of the server's KEXINIT, including the message byte (`I_S`).
    pub server_kexinit: &'a [u8],
}

/// One client-side key exchange run.
///
/// `init` produces the first outbound packet; each server packet is fed to
/// `next` until it reports completion, after which the shared secret `K`,
/// exchange hash `H` and the server's host key are available.
pub trait KeyExchange: Send {
    /// Begins the exchange. Returns the first packet to send.
    ///
    /// `signature` verifies the server's signature over the exchange hash and
    /// must match the negotiated host-key algorithm.
    fn init(&mut self, input: KexInput<'_>, signature: Box<dyn Signature>) -> Result<Buffer>;

    /// Feeds one key-exchange packet, message byte included.
    ///
    /// Returns `true` when the exchange has completed.
    fn next(&mut self, packet: &mut Buffer) -> Result<bool>;

    /// The shared secret `K`. Only available after completion.
    fn shared_secret(&self) -> Result<&BigInt>;

    /// The exchange hash `H`. Only available after completion.
    fn exchange_hash(&self) -> Result<&[u8]>;

    /// Wire name of the hash algorithm this exchange uses.
    fn hash_name(&self) -> &'static str;

    /// The server's host key. Only available after completion.
    fn server_host_key(&self) -> Result<&HostKey>;
}

/// Host-key signature verification for one algorithm name.
pub trait Signature: Send {
    /// Verifies `sig_blob` (the wire-format signature, algorithm name
    /// included) over `data` with the given host key.
    fn verify(&self, key: &HostKey, data: &[u8], sig_blob: &[u8]) -> Result<()>;
}

/// Cryptographically secure random source.
pub trait Random: Send + Sync {
    /// Fills `buf` with random bytes.
    fn fill(&self, buf: &mut [u8]);
}
