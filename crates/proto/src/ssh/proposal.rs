//! Algorithm proposals and negotiation (RFC 4253 Section 7.1).
//!
//! A proposal is the fixed 10-tuple of comma-separated name-lists carried in
//! SSH_MSG_KEXINIT, in this exact order: kex, server host key, cipher c2s,
//! cipher s2c, MAC c2s, MAC s2c, compression c2s, compression s2c, language
//! c2s, language s2c. Language slots may be empty; the others must not be.
//!
//! Negotiation walks the client's preference list per slot and picks the
//! first name that also appears in the server's list. Client preference
//! dominates; no guess-agreement logic is attempted.

use crate::ssh::algo::registry::Registry;
use crate::ssh::algo::Random;
use crate::ssh::buffer::Buffer;
use crate::ssh::message::Message;
use skiff_platform::{Error, Result};

/// Proposal slot: key exchange algorithms.
pub const PROP_KEX: usize = 0;
/// Proposal slot: server host key algorithms.
pub const PROP_HOST_KEY: usize = 1;
/// Proposal slot: cipher, client to server.
pub const PROP_CIPHER_C2S: usize = 2;
/// Proposal slot: cipher, server to client.
pub const PROP_CIPHER_S2C: usize = 3;
/// Proposal slot: MAC, client to server.
pub const PROP_MAC_C2S: usize = 4;
/// Proposal slot: MAC, server to client.
pub const PROP_MAC_S2C: usize = 5;
/// Proposal slot: compression, client to server.
pub const PROP_COMP_C2S: usize = 6;
/// Proposal slot: compression, server to client.
pub const PROP_COMP_S2C: usize = 7;
/// Proposal slot: language, client to server.
pub const PROP_LANG_C2S: usize = 8;
/// Proposal slot: language, server to client.
pub const PROP_LANG_S2C: usize = 9;
/// Number of proposal slots.
pub const PROP_MAX: usize = 10;

/// The 10 comma-separated name-lists of one KEXINIT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    slots: [String; PROP_MAX],
}

impl Proposal {
    /// Builds the local proposal from a registry's preference lists.
    pub fn from_registry(registry: &Registry) -> Self {
        let compression = registry.compression.names();
        Self {
            slots: [
                registry.kex.names(),
                registry.signature.names(),
                registry.cipher.names(),
                registry.cipher.names(),
                registry.mac.names(),
                registry.mac.names(),
                compression.clone(),
                compression,
                String::new(),
                String::new(),
            ],
        }
    }

    /// Returns one slot's comma-separated name-list.
    pub fn slot(&self, index: usize) -> &str {
        &self.slots[index]
    }

    /// The first (most preferred) name of one slot.
    pub fn first(&self, index: usize) -> &str {
        self.slots[index].split(',').next().unwrap_or("")
    }

    /// Serializes this proposal as a KEXINIT packet, cookie included.
    ///
    /// The returned buffer has header space reserved for the encoder; its
    /// compact data is the exact `I_C` payload.
    pub fn to_kexinit(&self, rng: &dyn Random) -> Buffer {
        let mut cookie = [0u8; 16];
        rng.fill(&mut cookie);

        let mut buf = Buffer::packet(Message::KexInit);
        buf.put_raw(&cookie);
        for slot in &self.slots {
            buf.put_string(slot.as_bytes());
        }
        buf.put_bool(false); // first_kex_packet_follows
        buf.put_u32(0); // reserved
        buf
    }

    /// Parses a KEXINIT payload (message byte included).
    ///
    /// Returns the proposal and the peer's `first_kex_packet_follows` flag.
    pub fn from_kexinit(payload: &[u8]) -> Result<(Self, bool)> {
        let mut buf = Buffer::from_vec(payload.to_vec());
        let msg = buf.get_u8()?;
        if msg != Message::KexInit as u8 {
            return Err(Error::Protocol(format!(
                "expected SSH_MSG_KEXINIT, got message {}",
                msg
            )));
        }
        buf.get_raw(16)?; // cookie

        let mut slots: [String; PROP_MAX] = Default::default();
        for (index, slot) in slots.iter_mut().enumerate() {
            *slot = buf.get_string_utf8()?;
            if slot.is_empty() && index < PROP_LANG_C2S {
                return Err(Error::Protocol(format!(
                    "KEXINIT name-list {} is empty",
                    index
                )));
            }
        }

        let first_kex_packet_follows = buf.get_bool()?;
        buf.get_u32()?; // reserved

        Ok((Self { slots }, first_kex_packet_follows))
    }

    /// Negotiates all 10 slots, client preference first.
    pub fn negotiate(client: &Proposal, server: &Proposal) -> Result<Negotiated> {
        let mut names: [String; PROP_MAX] = Default::default();
        for index in 0..PROP_MAX {
            let server_names: Vec<&str> = server.slots[index].split(',').collect();
            let chosen = client.slots[index]
                .split(',')
                .find(|name| server_names.contains(name));

            match chosen {
                Some(name) => names[index] = name.to_string(),
                None if index == PROP_LANG_C2S || index == PROP_LANG_S2C => {}
                None => {
                    return Err(Error::Negotiation(format!(
                        "no common algorithm for slot {}: client [{}], server [{}]",
                        index, client.slots[index], server.slots[index]
                    )))
                }
            }
        }
        Ok(Negotiated { names })
    }
}

/// The chosen name per proposal slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    names: [String; PROP_MAX],
}

impl Negotiated {
    /// The chosen name for one slot (empty for unresolved language slots).
    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// The negotiated key exchange method.
    pub fn kex(&self) -> &str {
        &self.names[PROP_KEX]
    }

    /// The negotiated host key algorithm.
    pub fn host_key(&self) -> &str {
        &self.names[PROP_HOST_KEY]
    }

    /// Whether the peer's optimistic first kex packet used the wrong guess.
    ///
    /// RFC 4253 Section 7: the guess is the first algorithm of the kex and
    /// host key lists. A wrong guess means the packet that follows KEXINIT
    /// must be discarded.
    pub fn wrong_guess(&self, server: &Proposal) -> bool {
        server.first(PROP_KEX) != self.kex() || server.first(PROP_HOST_KEY) != self.host_key()
    }
}

impl std::fmt::Display for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "kex={}, host-key={}, c2s=({},{},{}), s2c=({},{},{})",
            self.names[PROP_KEX],
            self.names[PROP_HOST_KEY],
            self.names[PROP_CIPHER_C2S],
            self.names[PROP_MAC_C2S],
            self.names[PROP_COMP_C2S],
            self.names[PROP_CIPHER_S2C],
            self.names[PROP_MAC_S2C],
            self.names[PROP_COMP_S2C],
        )
    }
}
