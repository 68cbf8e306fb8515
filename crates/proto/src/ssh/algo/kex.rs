//! Key exchange methods (RFC 4253 Section 8, RFC 8731).
//!
//! Implements the client side of:
//! - `diffie-hellman-group14-sha1` (RFC 4253)
//! - `diffie-hellman-group14-sha256` (RFC 8268)
//! - `curve25519-sha256` / `curve25519-sha256@libssh.org` (RFC 8731)
//!
//! Each exchange sends one init packet, consumes the server's reply, and
//! produces the shared secret `K`, the exchange hash `H`, and the server's
//! host key with its signature over `H` already verified.

use super::digest::{Sha1Digest, Sha256Digest};
use super::{Digest, KexInput, KeyExchange, Signature};
use crate::ssh::buffer::Buffer;
use crate::ssh::hostkey::HostKey;
use crate::ssh::message::Message;
use num_bigint::{BigInt, RandBigInt, Sign};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use skiff_platform::{Error, Result};

/// Diffie-Hellman group 14 parameters (RFC 3526): a 2048-bit MODP group.
mod dh_group14 {
    use super::*;

    const P_HEX: &str = concat!(
        "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
        "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
        "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
        "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
        "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D",
        "C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F",
        "83655D23DCA3AD961C62F356208552BB9ED529077096966D",
        "670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B",
        "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9",
        "DE2BCBF6955817183995497CEA956AE515D2261898FA0510",
        "15728E5A8AACAA68FFFFFFFFFFFFFFFF"
    );

    /// The group prime.
    pub static P: Lazy<BigInt> = Lazy::new(|| {
        BigInt::from_bytes_be(Sign::Plus, &hex::decode(P_HEX).expect("valid group-14 hex"))
    });

    /// The group generator.
    pub static G: Lazy<BigInt> = Lazy::new(|| BigInt::from(2u32));
}

/// Owned copies of the identification strings and KEXINIT payloads that feed
/// the exchange hash.
#[derive(Debug, Default)]
struct HashInputs {
    client_id: String,
    server_id: String,
    client_kexinit: Vec<u8>,
    server_kexinit: Vec<u8>,
}

impl HashInputs {
    fn capture(input: &KexInput<'_>) -> Self {
        Self {
            client_id: input.client_id.to_string(),
            server_id: input.server_id.to_string(),
            client_kexinit: input.client_kexinit.to_vec(),
            server_kexinit: input.server_kexinit.to_vec(),
        }
    }

    /// Writes the common exchange-hash prefix: V_C, V_S, I_C, I_S, K_S.
    fn put_prefix(&self, buf: &mut Buffer, host_key_blob: &[u8]) {
        buf.put_string(self.client_id.as_bytes());
        buf.put_string(self.server_id.as_bytes());
        buf.put_string(&self.client_kexinit);
        buf.put_string(&self.server_kexinit);
        buf.put_string(host_key_blob);
    }
}

/// Results of a completed exchange.
#[derive(Debug)]
struct KexOutcome {
    k: BigInt,
    h: Vec<u8>,
    host_key: HostKey,
}

fn not_done<T>() -> Result<T> {
    Err(Error::Protocol(
        "key exchange has not completed".to_string(),
    ))
}

/// Classic `diffie-hellman-group14-*` key exchange.
pub struct DhGroup14 {
    hash_name: &'static str,
    make_digest: fn() -> Box<dyn Digest>,
    inputs: HashInputs,
    signature: Option<Box<dyn Signature>>,
    x: Option<BigInt>,
    e: Option<BigInt>,
    outcome: Option<KexOutcome>,
}

impl DhGroup14 {
    /// `diffie-hellman-group14-sha1`.
    pub fn sha1() -> Self {
        Self::with_hash("sha1", || Box::new(Sha1Digest::new()))
    }

    /// `diffie-hellman-group14-sha256`.
    pub fn sha256() -> Self {
        Self::with_hash("sha256", || Box::new(Sha256Digest::new()))
    }

    fn with_hash(hash_name: &'static str, make_digest: fn() -> Box<dyn Digest>) -> Self {
        Self {
            hash_name,
            make_digest,
            inputs: HashInputs::default(),
            signature: None,
            x: None,
            e: None,
            outcome: None,
        }
    }
}

impl KeyExchange for DhGroup14 {
    fn init(&mut self, input: KexInput<'_>, signature: Box<dyn Signature>) -> Result<Buffer> {
        self.inputs = HashInputs::capture(&input);
        self.signature = Some(signature);

        // Ephemeral exponent x in (1, p-1), e = g^x mod p.
        let mut rng = rand::thread_rng();
        let x = rng.gen_bigint_range(&BigInt::from(2u32), &(&*dh_group14::P - 1u32));
        let e = dh_group14::G.modpow(&x, &dh_group14::P);

        let mut packet = Buffer::packet(Message::KexdhInit);
        packet.put_mpint(&e);

        self.x = Some(x);
        self.e = Some(e);
        Ok(packet)
    }

    fn next(&mut self, packet: &mut Buffer) -> Result<bool> {
        let msg = packet.get_u8()?;
        if msg != Message::KexdhReply as u8 {
            return Err(Error::Protocol(format!(
                "expected SSH_MSG_KEXDH_REPLY, got message {}",
                msg
            )));
        }
        let (x, e) = match (&self.x, &self.e) {
            (Some(x), Some(e)) => (x, e),
            _ => return Err(Error::Protocol("key exchange not initialized".to_string())),
        };

        let host_key_blob = packet.get_string()?;
        let f = packet.get_mpint()?;
        let sig_blob = packet.get_string()?;

        // Reject trivial or out-of-range server values.
        if f <= BigInt::from(1u32) || f >= &*dh_group14::P - 1u32 {
            return Err(Error::Protocol(
                "server DH public value out of range".to_string(),
            ));
        }

        let k = f.modpow(x, &dh_group14::P);
        let host_key = HostKey::parse(&host_key_blob)?;

        let mut hash_input = Buffer::new();
        self.inputs.put_prefix(&mut hash_input, &host_key_blob);
        hash_input.put_mpint(e);
        hash_input.put_mpint(&f);
        hash_input.put_mpint(&k);

        let mut digest = (self.make_digest)();
        digest.update(hash_input.unread());
        let h = digest.finish();

        self.signature
            .as_ref()
            .ok_or_else(|| Error::Protocol("key exchange not initialized".to_string()))?
            .verify(&host_key, &h, &sig_blob)?;

        self.outcome = Some(KexOutcome { k, h, host_key });
        Ok(true)
    }

    fn shared_secret(&self) -> Result<&BigInt> {
        self.outcome.as_ref().map(|o| &o.k).map_or_else(not_done, Ok)
    }

    fn exchange_hash(&self) -> Result<&[u8]> {
        self.outcome
            .as_ref()
            .map(|o| o.h.as_slice())
            .map_or_else(not_done, Ok)
    }

    fn hash_name(&self) -> &'static str {
        self.hash_name
    }

    fn server_host_key(&self) -> Result<&HostKey> {
        self.outcome
            .as_ref()
            .map(|o| &o.host_key)
            .map_or_else(not_done, Ok)
    }
}

impl std::fmt::Debug for DhGroup14 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhGroup14")
            .field("hash", &self.hash_name)
            .field("done", &self.outcome.is_some())
            .finish()
    }
}

/// `curve25519-sha256` key exchange (RFC 8731).
pub struct Curve25519 {
    inputs: HashInputs,
    signature: Option<Box<dyn Signature>>,
    private: Option<EphemeralPrivateKey>,
    public: [u8; 32],
    outcome: Option<KexOutcome>,
}

impl Curve25519 {
    /// Creates an exchange; the ephemeral key pair is generated in `init`.
    pub fn new() -> Self {
        Self {
            inputs: HashInputs::default(),
            signature: None,
            private: None,
            public: [0u8; 32],
            outcome: None,
        }
    }
}

impl Default for Curve25519 {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange for Curve25519 {
    fn init(&mut self, input: KexInput<'_>, signature: Box<dyn Signature>) -> Result<Buffer> {
        self.inputs = HashInputs::capture(&input);
        self.signature = Some(signature);

        let rng = ring::rand::SystemRandom::new();
        let private = EphemeralPrivateKey::generate(&X25519, &rng)
            .map_err(|_| Error::Protocol("failed to generate curve25519 key".to_string()))?;
        let public = private
            .compute_public_key()
            .map_err(|_| Error::Protocol("failed to compute curve25519 public key".to_string()))?;
        self.public.copy_from_slice(public.as_ref());
        self.private = Some(private);

        let mut packet = Buffer::packet(Message::KexdhInit);
        packet.put_string(&self.public);
        Ok(packet)
    }

    fn next(&mut self, packet: &mut Buffer) -> Result<bool> {
        let msg = packet.get_u8()?;
        if msg != Message::KexdhReply as u8 {
            return Err(Error::Protocol(format!(
                "expected SSH_MSG_KEX_ECDH_REPLY, got message {}",
                msg
            )));
        }
        let private = self
            .private
            .take()
            .ok_or_else(|| Error::Protocol("key exchange not initialized".to_string()))?;

        let host_key_blob = packet.get_string()?;
        let server_public = packet.get_string()?;
        let sig_blob = packet.get_string()?;

        if server_public.len() != 32 {
            return Err(Error::Protocol(format!(
                "curve25519 server public key must be 32 bytes, got {}",
                server_public.len()
            )));
        }

        let peer = UnparsedPublicKey::new(&X25519, &server_public);
        let shared = agree_ephemeral(private, &peer, |material| material.to_vec())
            .map_err(|_| Error::Protocol("curve25519 key agreement failed".to_string()))?;

        // K is interpreted as a positive mpint.
        let k = BigInt::from_bytes_be(Sign::Plus, &shared);
        let host_key = HostKey::parse(&host_key_blob)?;

        let mut hash_input = Buffer::new();
        self.inputs.put_prefix(&mut hash_input, &host_key_blob);
        hash_input.put_string(&self.public);
        hash_input.put_string(&server_public);
        hash_input.put_mpint(&k);

        let mut digest = Sha256Digest::new();
        Digest::update(&mut digest, hash_input.unread());
        let h = Digest::finish(&mut digest);

        self.signature
            .as_ref()
            .ok_or_else(|| Error::Protocol("key exchange not initialized".to_string()))?
            .verify(&host_key, &h, &sig_blob)?;

        self.outcome = Some(KexOutcome { k, h, host_key });
        Ok(true)
    }

    fn shared_secret(&self) -> Result<&BigInt> {
        self.outcome.as_ref().map(|o| &o.k).map_or_else(not_done, Ok)
    }

    fn exchange_hash(&self) -> Result<&[u8]> {
        self.outcome
            .as_ref()
            .map(|o| o.h.as_slice())
            .map_or_else(not_done, Ok)
    }

    fn hash_name(&self) -> &'static str {
        "sha256"
    }

    fn server_host_key(&self) -> Result<&HostKey> {
        self.outcome
            .as_ref()
            .map(|o| &o.host_key)
            .map_or_else(not_done, Ok)
    }
}

impl std::fmt::Debug for Curve25519 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519")
            .field("done", &self.outcome.is_some())
            .finish()
    }
}
