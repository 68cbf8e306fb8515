//! Algorithm negotiation and key exchange (RFC 4253 Section 7).
//!
//! The [`KeyExchanger`] owns the kex state machine. It is driven entirely by
//! the reader task:
//!
//! ```text
//! Idle --start--> AwaitPeerKexinit --KEXINIT--> AwaitFollowup
//!      --kex method completes, NEWKEYS sent--> AwaitNewkeys
//!      --NEWKEYS received--> Idle (done event set)
//! ```
//!
//! A KEXINIT received while idle starts a peer-initiated rekey. The write
//! gate closes for the whole exchange, so user packets never interleave with
//! kex traffic; outbound algorithms switch under the write lock immediately
//! after our NEWKEYS is queued, inbound ones when the peer's NEWKEYS arrives.

use crate::ssh::algo::registry::Registry;
use crate::ssh::algo::{Cipher, CipherMode, Compression, Digest, KexInput, KeyExchange, Mac, Random};
use crate::ssh::buffer::Buffer;
use crate::ssh::codec::Decoder;
use crate::ssh::hostkey::{HostKey, HostKeyVerifier};
use crate::ssh::message::Message;
use crate::ssh::proposal::{
    Negotiated, Proposal, PROP_CIPHER_C2S, PROP_CIPHER_S2C, PROP_COMP_C2S, PROP_COMP_S2C,
    PROP_MAC_C2S, PROP_MAC_S2C,
};
use crate::ssh::sync::Event;
use crate::ssh::transport::Outbound;
use num_bigint::BigInt;
use skiff_platform::{Error, Result};
use std::sync::{Arc, Mutex};
use tracing::debug;
use zeroize::Zeroizing;

/// What the exchanger expects from the next packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// No exchange in progress.
    Idle,
    /// We have sent KEXINIT and await the peer's.
    AwaitPeerKexinit,
    /// Awaiting key-exchange-method packets.
    AwaitFollowup,
    /// Awaiting the peer's NEWKEYS.
    AwaitNewkeys,
}

/// One direction's freshly keyed algorithm set, ready to install.
pub(crate) struct DirectionAlgs {
    pub(crate) cipher: Box<dyn Cipher>,
    pub(crate) mac: Box<dyn Mac>,
    pub(crate) compression: Option<Box<dyn Compression>>,
}

/// Key exchange driver, owned by the reader task.
pub(crate) struct KeyExchanger {
    registry: Arc<Registry>,
    outbound: Arc<Outbound>,
    verifiers: Vec<Box<dyn HostKeyVerifier>>,
    remote_addr: String,
    client_id: String,
    server_id: String,
    rng: Box<dyn Random>,
    stage: Stage,
    ongoing: bool,
    client_proposal: Option<Proposal>,
    i_c: Vec<u8>,
    i_s: Vec<u8>,
    negotiated: Option<Negotiated>,
    kex: Option<Box<dyn KeyExchange>>,
    discard_followup: bool,
    pending_inbound: Option<DirectionAlgs>,
    session_id: Arc<Mutex<Option<Vec<u8>>>>,
    done: Event,
}

impl KeyExchanger {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: Arc<Registry>,
        outbound: Arc<Outbound>,
        verifiers: Vec<Box<dyn HostKeyVerifier>>,
        remote_addr: String,
        client_id: String,
        server_id: String,
        session_id: Arc<Mutex<Option<Vec<u8>>>>,
        done: Event,
    ) -> Self {
        let rng = (registry.random)();
        Self {
            registry,
            outbound,
            verifiers,
            remote_addr,
            client_id,
            server_id,
            rng,
            stage: Stage::Idle,
            ongoing: false,
            client_proposal: None,
            i_c: Vec::new(),
            i_s: Vec::new(),
            negotiated: None,
            kex: None,
            discard_followup: false,
            pending_inbound: None,
            session_id,
            done,
        }
    }

    /// Whether an exchange is in progress.
    pub(crate) fn ongoing(&self) -> bool {
        self.ongoing
    }

    /// Initiates a key exchange if none is ongoing: builds the local
    /// proposal, closes the write gate, and sends KEXINIT.
    pub(crate) async fn start(&mut self) -> Result<()> {
        if self.ongoing {
            return Ok(());
        }
        self.ongoing = true;
        self.done.clear();
        self.outbound.close_gate();

        let proposal = Proposal::from_registry(&self.registry);
        let kexinit = proposal.to_kexinit(self.rng.as_ref());
        self.i_c = kexinit.compact_data();
        self.client_proposal = Some(proposal);

        debug!("sending SSH_MSG_KEXINIT");
        self.outbound.send(kexinit).await?;
        if self.stage == Stage::Idle {
            self.stage = Stage::AwaitPeerKexinit;
        }
        Ok(())
    }

    /// Feeds one kex-related packet (KEXINIT, NEWKEYS, or method-specific).
    ///
    /// Returns `true` once the exchange completes.
    pub(crate) async fn handle(
        &mut self,
        msg: u8,
        payload: Vec<u8>,
        decoder: &mut Decoder,
    ) -> Result<bool> {
        match self.stage {
            Stage::Idle | Stage::AwaitPeerKexinit => {
                if msg != Message::KexInit as u8 {
                    return Err(Error::Protocol(if self.ongoing {
                        format!("expected SSH_MSG_KEXINIT, got message {}", msg)
                    } else {
                        format!("kex packet {} received when no key exchange was ongoing", msg)
                    }));
                }
                debug!("received SSH_MSG_KEXINIT");
                // Peer-initiated rekey: answer with our own KEXINIT first.
                self.start().await?;
                self.got_kexinit(payload).await?;
                self.stage = Stage::AwaitFollowup;
                Ok(false)
            }

            Stage::AwaitFollowup => {
                if !Message::is_kex_followup(msg) {
                    return Err(Error::Protocol(format!(
                        "expected key exchange data, got message {}",
                        msg
                    )));
                }
                if self.discard_followup {
                    debug!("discarding peer's wrongly guessed first kex packet");
                    self.discard_followup = false;
                    return Ok(false);
                }
                let kex = self
                    .kex
                    .as_mut()
                    .ok_or_else(|| Error::Protocol("no active key exchange".to_string()))?;
                let mut packet = Buffer::from_vec(payload);
                if kex.next(&mut packet)? {
                    self.finish_exchange().await?;
                    self.stage = Stage::AwaitNewkeys;
                }
                Ok(false)
            }

            Stage::AwaitNewkeys => {
                if msg != Message::NewKeys as u8 {
                    return Err(Error::Protocol(format!(
                        "expected SSH_MSG_NEWKEYS, got message {}",
                        msg
                    )));
                }
                debug!("received SSH_MSG_NEWKEYS");
                let algs = self
                    .pending_inbound
                    .take()
                    .ok_or_else(|| Error::Protocol("no pending inbound keys".to_string()))?;
                decoder.install(algs.cipher, algs.mac, algs.compression)?;

                self.stage = Stage::Idle;
                self.ongoing = false;
                self.kex = None;
                self.outbound.open_gate();
                self.done.set();
                Ok(true)
            }
        }
    }

    /// Propagates a transport failure to anything blocked on this exchange.
    pub(crate) fn notify_error(&self, err: &Error) {
        self.done.fail(err.duplicate());
    }

    /// Records `I_S`, negotiates, and launches the chosen kex method.
    async fn got_kexinit(&mut self, payload: Vec<u8>) -> Result<()> {
        self.i_s = payload;
        let (server_proposal, first_packet_follows) = Proposal::from_kexinit(&self.i_s)?;
        let client_proposal = self
            .client_proposal
            .as_ref()
            .ok_or_else(|| Error::Protocol("no local proposal recorded".to_string()))?;

        let negotiated = Proposal::negotiate(client_proposal, &server_proposal)?;
        debug!("negotiated algorithms: {}", negotiated);

        let mut kex = self.registry.kex.create(negotiated.kex())?;
        let signature = self.registry.signature.create(negotiated.host_key())?;
        let first_packet = kex.init(
            KexInput {
                client_id: &self.client_id,
                server_id: &self.server_id,
                client_kexinit: &self.i_c,
                server_kexinit: &self.i_s,
            },
            signature,
        )?;

        if first_packet_follows && negotiated.wrong_guess(&server_proposal) {
            self.discard_followup = true;
        }

        self.outbound.send(first_packet).await?;
        self.kex = Some(kex);
        self.negotiated = Some(negotiated);
        Ok(())
    }

    /// Runs once the kex method reports completion: pins the session id,
    /// verifies the host key, derives both directions' keys, sends NEWKEYS
    /// and installs the outbound set under the write lock.
    async fn finish_exchange(&mut self) -> Result<()> {
        let kex = self
            .kex
            .as_ref()
            .ok_or_else(|| Error::Protocol("no active key exchange".to_string()))?;
        let h = kex.exchange_hash()?.to_vec();

        {
            let mut session_id = self
                .session_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if session_id.is_none() {
                *session_id = Some(h.clone());
            }
        }

        self.verify_host(kex.server_host_key()?)?;

        let (c2s, s2c) = self.derive_keys()?;
        debug!("sending SSH_MSG_NEWKEYS");
        self.outbound
            .send_and_install(Buffer::packet(Message::NewKeys), c2s)
            .await?;
        self.pending_inbound = Some(s2c);
        Ok(())
    }

    /// Walks the verifier chain in registration order.
    fn verify_host(&self, key: &HostKey) -> Result<()> {
        for verifier in &self.verifiers {
            if verifier.verify(&self.remote_addr, key) {
                return Ok(());
            }
        }
        Err(Error::HostKey(format!(
            "could not verify '{}' host key with fingerprint [{}]",
            key.key_type(),
            key.fingerprint()
        )))
    }

    /// Derives and keys both directions' algorithm sets (RFC 4253 §7.2).
    fn derive_keys(&self) -> Result<(DirectionAlgs, DirectionAlgs)> {
        let kex = self
            .kex
            .as_ref()
            .ok_or_else(|| Error::Protocol("no active key exchange".to_string()))?;
        let negotiated = self
            .negotiated
            .as_ref()
            .ok_or_else(|| Error::Protocol("nothing negotiated".to_string()))?;

        let k = kex.shared_secret()?;
        let h = kex.exchange_hash()?;
        let session_id = self
            .session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| Error::Protocol("session id not established".to_string()))?;
        let mut digest = self.registry.digest.create(kex.hash_name())?;

        let mut cipher_c2s = self.registry.cipher.create(negotiated.name(PROP_CIPHER_C2S))?;
        let mut cipher_s2c = self.registry.cipher.create(negotiated.name(PROP_CIPHER_S2C))?;
        let mut mac_c2s = self.registry.mac.create(negotiated.name(PROP_MAC_C2S))?;
        let mut mac_s2c = self.registry.mac.create(negotiated.name(PROP_MAC_S2C))?;
        let comp_c2s = self.registry.compression.create(negotiated.name(PROP_COMP_C2S))?;
        let comp_s2c = self.registry.compression.create(negotiated.name(PROP_COMP_S2C))?;

        // "A" through "F" per RFC 4253 Section 7.2.
        let mut derive = |letter: u8, len: usize| {
            Zeroizing::new(derive_key(digest.as_mut(), k, h, letter, &session_id, len))
        };
        let iv_c2s = derive(b'A', cipher_c2s.iv_len());
        let iv_s2c = derive(b'B', cipher_s2c.iv_len());
        let key_c2s = derive(b'C', cipher_c2s.key_len());
        let key_s2c = derive(b'D', cipher_s2c.key_len());
        let mac_key_c2s = derive(b'E', mac_c2s.key_len());
        let mac_key_s2c = derive(b'F', mac_s2c.key_len());

        cipher_c2s.init(CipherMode::Encrypt, &key_c2s, &iv_c2s)?;
        cipher_s2c.init(CipherMode::Decrypt, &key_s2c, &iv_s2c)?;
        mac_c2s.init(&mac_key_c2s)?;
        mac_s2c.init(&mac_key_s2c)?;

        Ok((
            DirectionAlgs {
                cipher: cipher_c2s,
                mac: mac_c2s,
                compression: comp_c2s,
            },
            DirectionAlgs {
                cipher: cipher_s2c,
                mac: mac_s2c,
                compression: comp_s2c,
            },
        ))
    }
}

/// `HASH(K || H || letter || session_id)`, extended with
/// `K_{n+1} = HASH(K || H || K_1 || ... || K_n)` until `len` bytes exist,
/// then truncated to exactly `len`.
fn derive_key(
    digest: &mut dyn Digest,
    k: &BigInt,
    h: &[u8],
    letter: u8,
    session_id: &[u8],
    len: usize,
) -> Vec<u8> {
    let mut seed = Buffer::new();
    seed.put_mpint(k);
    seed.put_raw(h);
    seed.put_u8(letter);
    seed.put_raw(session_id);
    digest.update(seed.unread());
    let mut key = digest.finish();

    while key.len() < len {
        let mut seed = Buffer::new();
        seed.put_mpint(k);
        seed.put_raw(h);
        seed.put_raw(&key);
        digest.update(seed.unread());
        let block = digest.finish();
        key.extend_from_slice(&block);
    }
    key.truncate(len);
    key
}
