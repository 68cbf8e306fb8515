//! Server host keys: parsing, signature verification, and trust decisions.
//!
//! This module covers the client side of RFC 4253 Section 6.6:
//!
//! - [`HostKey`] parses the server's wire-format public key blob (`K_S`)
//! - [`Signature`] implementations verify the server's signature over the
//!   exchange hash, one per negotiated host-key algorithm name
//! - [`HostKeyVerifier`] is the caller-supplied trust predicate; the
//!   transport walks its verifier chain in registration order and accepts
//!   the key as soon as one verifier returns `true`
//!
//! # Supported algorithms
//!
//! - `ssh-ed25519` - EdDSA using Ed25519
//! - `rsa-sha2-256` / `rsa-sha2-512` - RSA with SHA-2 (RFC 8332)
//! - `ssh-rsa` - legacy RSA with SHA-1, for compatibility
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::hostkey::FingerprintVerifier;
//!
//! // Accept only the host key with this SHA-256 fingerprint.
//! let verifier = FingerprintVerifier::new(
//!     "SHA256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
//! );
//! # let _ = verifier;
//! ```

use crate::ssh::algo;
use crate::ssh::buffer::Buffer;
use ed25519_dalek::{Signature as Ed25519Sig, Verifier, VerifyingKey};
use num_bigint::Sign;
use ring::signature::{
    RsaPublicKeyComponents, RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha2::{Digest, Sha256};
use skiff_platform::{Error, Result};

/// Key material extracted from a host key blob.
#[derive(Debug, Clone, PartialEq, Eq)]
enum KeyMaterial {
    /// RSA public exponent and modulus, unsigned big-endian.
    Rsa { e: Vec<u8>, n: Vec<u8> },
    /// Ed25519 public point.
    Ed25519([u8; 32]),
}

/// A server host key, parsed from the wire-format blob carried in the key
/// exchange reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    key_type: String,
    blob: Vec<u8>,
    material: KeyMaterial,
}

impl HostKey {
    /// Parses a wire-format public key blob (`string` key type followed by
    /// type-specific fields).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] for malformed blobs and
    /// [`Error::UnknownAlgorithm`] for unsupported key types.
    pub fn parse(blob: &[u8]) -> Result<Self> {
        let mut buf = Buffer::from_vec(blob.to_vec());
        let key_type = buf.get_string_utf8()?;
        let material = match key_type.as_str() {
            "ssh-rsa" => {
                let e = buf.get_mpint()?;
                let n = buf.get_mpint()?;
                if e.sign() != Sign::Plus || n.sign() != Sign::Plus {
                    return Err(Error::Protocol(
                        "RSA host key with non-positive parameters".to_string(),
                    ));
                }
                KeyMaterial::Rsa {
                    e: e.to_bytes_be().1,
                    n: n.to_bytes_be().1,
                }
            }
            "ssh-ed25519" => {
                let point = buf.get_string()?;
                let point: [u8; 32] = point.as_slice().try_into().map_err(|_| {
                    Error::Protocol(format!(
                        "ed25519 host key must be 32 bytes, got {}",
                        point.len()
                    ))
                })?;
                KeyMaterial::Ed25519(point)
            }
            other => {
                return Err(Error::UnknownAlgorithm(format!(
                    "unsupported host key type '{}'",
                    other
                )))
            }
        };
        Ok(Self {
            key_type,
            blob: blob.to_vec(),
            material,
        })
    }

    /// The key type name from the blob (e.g. `ssh-rsa`).
    pub fn key_type(&self) -> &str {
        &self.key_type
    }

    /// The raw wire-format blob.
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// SHA-256 fingerprint of the key blob.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.blob);
        format!("SHA256:{}", hex::encode(hasher.finalize()))
    }
}

/// Splits a wire-format signature blob into its algorithm name and raw bytes.
fn parse_signature_blob(sig_blob: &[u8]) -> Result<(String, Vec<u8>)> {
    let mut buf = Buffer::from_vec(sig_blob.to_vec());
    let format = buf.get_string_utf8()?;
    let bytes = buf.get_string()?;
    Ok((format, bytes))
}

fn verify_rsa(
    key: &HostKey,
    params: &'static ring::signature::RsaParameters,
    data: &[u8],
    sig: &[u8],
) -> Result<()> {
    let (e, n) = match &key.material {
        KeyMaterial::Rsa { e, n } => (e, n),
        _ => {
            return Err(Error::Protocol(format!(
                "signature algorithm requires an RSA key, got '{}'",
                key.key_type()
            )))
        }
    };
    RsaPublicKeyComponents { n, e }
        .verify(params, data, sig)
        .map_err(|_| Error::HostKey("RSA signature verification failed".to_string()))
}

macro_rules! rsa_signature {
    ($(#[$doc:meta])* $name:ident, $format:expr, $params:expr) => {
        $(#[$doc])*
        #[derive(Debug, Default)]
        pub struct $name;

        impl $name {
            /// Creates the verifier.
            pub fn new() -> Self {
                Self
            }
        }

        impl algo::Signature for $name {
            fn verify(&self, key: &HostKey, data: &[u8], sig_blob: &[u8]) -> Result<()> {
                let (format, sig) = parse_signature_blob(sig_blob)?;
                if format != $format {
                    return Err(Error::Protocol(format!(
                        "signature format '{}' does not match negotiated '{}'",
                        format, $format
                    )));
                }
                verify_rsa(key, $params, data, &sig)
            }
        }
    };
}

rsa_signature!(
    /// Legacy `ssh-rsa` (RSA with SHA-1).
    SshRsa,
    "ssh-rsa",
    &RSA_PKCS1_1024_8192_SHA1_FOR_LEGACY_USE_ONLY
);

rsa_signature!(
    /// `rsa-sha2-256` (RFC 8332).
    RsaSha256,
    "rsa-sha2-256",
    &RSA_PKCS1_2048_8192_SHA256
);

rsa_signature!(
    /// `rsa-sha2-512` (RFC 8332).
    RsaSha512,
    "rsa-sha2-512",
    &RSA_PKCS1_2048_8192_SHA512
);

/// `ssh-ed25519` (RFC 8709).
#[derive(Debug, Default)]
pub struct SshEd25519;

impl SshEd25519 {
    /// Creates the verifier.
    pub fn new() -> Self {
        Self
    }
}

impl algo::Signature for SshEd25519 {
    fn verify(&self, key: &HostKey, data: &[u8], sig_blob: &[u8]) -> Result<()> {
        let point = match &key.material {
            KeyMaterial::Ed25519(point) => point,
            _ => {
                return Err(Error::Protocol(format!(
                    "ssh-ed25519 signature over non-ed25519 key '{}'",
                    key.key_type()
                )))
            }
        };
        let (format, sig) = parse_signature_blob(sig_blob)?;
        if format != "ssh-ed25519" {
            return Err(Error::Protocol(format!(
                "signature format '{}' does not match negotiated 'ssh-ed25519'",
                format
            )));
        }
        let verifying_key = VerifyingKey::from_bytes(point)
            .map_err(|_| Error::HostKey("invalid ed25519 host key".to_string()))?;
        let signature = Ed25519Sig::from_slice(&sig)
            .map_err(|_| Error::HostKey("malformed ed25519 signature".to_string()))?;
        verifying_key
            .verify(data, &signature)
            .map_err(|_| Error::HostKey("ed25519 signature verification failed".to_string()))
    }
}

/// Caller-supplied host key trust predicate.
///
/// Verifiers are consulted in registration order; the first one returning
/// `true` accepts the key. If none accepts, the transport disconnects with
/// reason code 9 (HOST_KEY_NOT_VERIFIABLE).
pub trait HostKeyVerifier: Send + Sync {
    /// Decides whether the connection to `remote_addr` may proceed with this
    /// host key.
    fn verify(&self, remote_addr: &str, key: &HostKey) -> bool;
}

impl<F> HostKeyVerifier for F
where
    F: Fn(&str, &HostKey) -> bool + Send + Sync,
{
    fn verify(&self, remote_addr: &str, key: &HostKey) -> bool {
        self(remote_addr, key)
    }
}

/// Accepts exactly one key, identified by its SHA-256 fingerprint.
#[derive(Debug, Clone)]
pub struct FingerprintVerifier {
    fingerprint: String,
}

impl FingerprintVerifier {
    /// Creates a verifier for the given `SHA256:<hex>` fingerprint.
    pub fn new(fingerprint: &str) -> Self {
        Self {
            fingerprint: fingerprint.to_string(),
        }
    }
}

impl HostKeyVerifier for FingerprintVerifier {
    fn verify(&self, _remote_addr: &str, key: &HostKey) -> bool {
        key.fingerprint() == self.fingerprint
    }
}

/// Accepts every host key. INSECURE; for tests and examples only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAnyVerifier;

impl HostKeyVerifier for AcceptAnyVerifier {
    fn verify(&self, _remote_addr: &str, _key: &HostKey) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::algo::Signature as _;
    use ed25519_dalek::{Signer, SigningKey};

    fn ed25519_fixture() -> (SigningKey, HostKey) {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let mut blob = Buffer::new();
        blob.put_string(b"ssh-ed25519");
        blob.put_string(signing_key.verifying_key().as_bytes());
        let key = HostKey::parse(&blob.into_vec()).unwrap();
        (signing_key, key)
    }

    #[test]
    fn test_parse_ed25519() {
        let (_, key) = ed25519_fixture();
        assert_eq!(key.key_type(), "ssh-ed25519");
        assert!(key.fingerprint().starts_with("SHA256:"));
    }

    #[test]
    fn test_parse_rsa() {
        let mut blob = Buffer::new();
        blob.put_string(b"ssh-rsa");
        blob.put_mpint(&num_bigint::BigInt::from(65537u32));
        blob.put_mpint(&num_bigint::BigInt::from(0x00c0ffee_u64));
        let key = HostKey::parse(&blob.into_vec()).unwrap();
        assert_eq!(key.key_type(), "ssh-rsa");
    }

    #[test]
    fn test_parse_unknown_type() {
        let mut blob = Buffer::new();
        blob.put_string(b"ssh-dss");
        let err = HostKey::parse(&blob.into_vec()).unwrap_err();
        assert!(matches!(err, Error::UnknownAlgorithm(_)));
    }

    #[test]
    fn test_ed25519_signature_round_trip() {
        let (signing_key, key) = ed25519_fixture();
        let data = b"exchange hash bytes";
        let raw_sig = signing_key.sign(data);

        let mut sig_blob = Buffer::new();
        sig_blob.put_string(b"ssh-ed25519");
        sig_blob.put_string(&raw_sig.to_bytes());

        let verifier = SshEd25519::new();
        assert!(verifier.verify(&key, data, &sig_blob.into_vec()).is_ok());
    }

    #[test]
    fn test_ed25519_signature_rejects_tamper() {
        let (signing_key, key) = ed25519_fixture();
        let raw_sig = signing_key.sign(b"exchange hash bytes");

        let mut sig_blob = Buffer::new();
        sig_blob.put_string(b"ssh-ed25519");
        sig_blob.put_string(&raw_sig.to_bytes());

        let verifier = SshEd25519::new();
        let err = verifier
            .verify(&key, b"different data", &sig_blob.into_vec())
            .unwrap_err();
        assert!(matches!(err, Error::HostKey(_)));
    }

    #[test]
    fn test_signature_format_mismatch() {
        let (signing_key, key) = ed25519_fixture();
        let raw_sig = signing_key.sign(b"data");

        let mut sig_blob = Buffer::new();
        sig_blob.put_string(b"ssh-rsa");
        sig_blob.put_string(&raw_sig.to_bytes());

        let verifier = SshEd25519::new();
        let err = verifier.verify(&key, b"data", &sig_blob.into_vec()).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_fingerprint_verifier() {
        let (_, key) = ed25519_fixture();
        let good = FingerprintVerifier::new(&key.fingerprint());
        let bad = FingerprintVerifier::new("SHA256:0000");
        assert!(good.verify("127.0.0.1:22", &key));
        assert!(!bad.verify("127.0.0.1:22", &key));
    }

    #[test]
    fn test_closure_verifier() {
        let (_, key) = ed25519_fixture();
        let verifier = |addr: &str, _key: &HostKey| addr.starts_with("10.");
        assert!(HostKeyVerifier::verify(&verifier, "10.0.0.1:22", &key));
        assert!(!HostKeyVerifier::verify(&verifier, "192.168.0.1:22", &key));
    }
}
