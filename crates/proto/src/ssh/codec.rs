//! SSH binary packet protocol (RFC 4253 Section 6).
//!
//! # Packet format
//!
//! ```text
//! uint32    packet_length
//! byte      padding_length
//! byte[n1]  payload (n1 = packet_length - padding_length - 1)
//! byte[n2]  random padding (n2 = padding_length)
//! byte[m]   mac (m = mac_length, 0 when no MAC installed)
//! ```
//!
//! [`Encoder`] turns payloads into wire packets under the transport's write
//! lock; [`Decoder`] is a streaming parser driven by the single reader. Each
//! holds the cipher, MAC and compression for its direction together with the
//! direction's packet sequence number. Sequence numbers advance monotonically
//! modulo 2^32 across the whole connection; they do not reset at rekey.
//!
//! # Constraints
//!
//! - `packet_length` excludes the MAC and the length field itself
//! - `packet_length + 4` is a multiple of the cipher block size (8 for the
//!   initial null cipher)
//! - Inbound packets larger than 256 KiB are rejected outright

use crate::ssh::algo::{Cipher, Compression, CompressionMode, Mac, Random};
use crate::ssh::buffer::{Buffer, HEADER_RESERVE};
use bytes::{Buf, BytesMut};
use skiff_platform::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Maximum accepted `packet_length`.
pub const MAX_PACKET_LEN: usize = 256 * 1024;

/// Minimum legal `packet_length` (padding-length byte + 4 bytes padding).
pub const MIN_PACKET_LEN: usize = 5;

fn effective_block_size(cipher: &Option<Box<dyn Cipher>>) -> usize {
    cipher.as_ref().map_or(8, |c| c.block_size().max(8))
}

/// Computes the padding length for a payload.
///
/// Pads to the next block boundary and then adds one extra block, so the
/// padding always satisfies `4 <= padding < 256` for block sizes of 8 and
/// above.
fn padding_len(payload_len: usize, block: usize) -> usize {
    let mut pad = (block - (payload_len + HEADER_RESERVE) % block) % block;
    if pad < block {
        pad += block;
    }
    pad
}

/// Outbound packet pipeline: compress, frame, pad, MAC, encrypt.
pub struct Encoder {
    cipher: Option<Box<dyn Cipher>>,
    mac: Option<Box<dyn Mac>>,
    compression: Option<Box<dyn Compression>>,
    authed: Arc<AtomicBool>,
    rng: Box<dyn Random>,
    seq: u32,
}

impl Encoder {
    /// Creates an encoder with no algorithms installed (the pre-NEWKEYS
    /// state: plaintext, no MAC).
    ///
    /// The first encoded packet is sequence number 0.
    pub fn new(rng: Box<dyn Random>, authed: Arc<AtomicBool>) -> Self {
        Self {
            cipher: None,
            mac: None,
            compression: None,
            authed,
            rng,
            seq: u32::MAX,
        }
    }

    /// Atomically replaces the outbound algorithm set. Called with the write
    /// lock held, immediately after SSH_MSG_NEWKEYS has been queued.
    pub fn install(
        &mut self,
        cipher: Box<dyn Cipher>,
        mac: Box<dyn Mac>,
        compression: Option<Box<dyn Compression>>,
    ) -> Result<()> {
        let mut compression = compression;
        if let Some(comp) = compression.as_mut() {
            comp.init(CompressionMode::Deflate, -1)?;
        }
        self.cipher = Some(cipher);
        self.mac = Some(mac);
        self.compression = compression;
        Ok(())
    }

    /// The sequence number of the most recently encoded packet.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Encodes one payload into a wire packet.
    ///
    /// Returns the packet's sequence number and the bytes to enqueue.
    pub fn encode(&mut self, payload: Buffer) -> Result<(u32, Vec<u8>)> {
        let mut data = self.ensure_header_space(payload)?;

        let payload_len = data.len() - HEADER_RESERVE;
        let block = effective_block_size(&self.cipher);
        let pad_len = padding_len(payload_len, block);
        let packet_len = payload_len + pad_len + 1;

        data[0..4].copy_from_slice(&(packet_len as u32).to_be_bytes());
        data[4] = pad_len as u8;

        let pad_start = data.len();
        data.resize(pad_start + pad_len, 0);
        self.rng.fill(&mut data[pad_start..]);

        self.seq = self.seq.wrapping_add(1);

        let tag = match self.mac.as_mut() {
            Some(mac) => Some(mac.compute(self.seq, &data)?),
            None => None,
        };

        if let Some(cipher) = self.cipher.as_mut() {
            cipher.update(&mut data)?;
        }

        if let Some(tag) = tag {
            data.extend_from_slice(&tag);
        }

        Ok((self.seq, data))
    }

    /// Produces the packet bytes with the payload starting at
    /// [`HEADER_RESERVE`], compressing it first when eligible.
    fn ensure_header_space(&mut self, payload: Buffer) -> Result<Vec<u8>> {
        let compress = match self.compression.as_mut() {
            Some(comp) if self.authed.load(Ordering::Relaxed) || !comp.is_delayed() => Some(comp),
            _ => None,
        };

        if let Some(comp) = compress {
            let compressed = comp.compress(payload.unread())?;
            let mut data = vec![0u8; HEADER_RESERVE];
            data.extend_from_slice(&compressed);
            return Ok(data);
        }

        if payload.rpos() == HEADER_RESERVE {
            return Ok(payload.into_vec());
        }

        tracing::trace!(
            "copying payload without reserved header space (rpos {})",
            payload.rpos()
        );
        let mut data = vec![0u8; HEADER_RESERVE];
        data.extend_from_slice(payload.unread());
        Ok(data)
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("seq", &self.seq)
            .field("cipher", &self.cipher.is_some())
            .field("mac", &self.mac.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the first cipher block to learn the packet length.
    AwaitHeader,
    /// Waiting for the rest of the packet and its MAC.
    AwaitRest { packet_len: usize },
}

/// Streaming inbound packet pipeline: decrypt, verify, unframe, decompress.
pub struct Decoder {
    cipher: Option<Box<dyn Cipher>>,
    mac: Option<Box<dyn Mac>>,
    compression: Option<Box<dyn Compression>>,
    authed: Arc<AtomicBool>,
    seq: u32,
    state: DecodeState,
    input: BytesMut,
}

impl Decoder {
    /// Creates a decoder with no algorithms installed.
    pub fn new(authed: Arc<AtomicBool>) -> Self {
        Self {
            cipher: None,
            mac: None,
            compression: None,
            authed,
            seq: 0,
            state: DecodeState::AwaitHeader,
            input: BytesMut::new(),
        }
    }

    /// Replaces the inbound algorithm set. Called by the reader upon
    /// receiving SSH_MSG_NEWKEYS, at a packet boundary by construction.
    pub fn install(
        &mut self,
        cipher: Box<dyn Cipher>,
        mac: Box<dyn Mac>,
        compression: Option<Box<dyn Compression>>,
    ) -> Result<()> {
        debug_assert_eq!(self.state, DecodeState::AwaitHeader);
        let mut compression = compression;
        if let Some(comp) = compression.as_mut() {
            comp.init(CompressionMode::Inflate, -1)?;
        }
        self.cipher = Some(cipher);
        self.mac = Some(mac);
        self.compression = compression;
        Ok(())
    }

    /// Appends raw bytes from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.input.extend_from_slice(data);
    }

    /// The sequence number the next decoded packet will carry.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Attempts to decode the next complete packet.
    ///
    /// Returns the packet's sequence number and payload, or `None` when more
    /// input is needed.
    pub fn next_packet(&mut self) -> Result<Option<(u32, Buffer)>> {
        loop {
            match self.state {
                DecodeState::AwaitHeader => {
                    let block = effective_block_size(&self.cipher);
                    if self.input.len() < block {
                        return Ok(None);
                    }
                    if let Some(cipher) = self.cipher.as_mut() {
                        cipher.update(&mut self.input[..block])?;
                    }
                    let packet_len =
                        u32::from_be_bytes([self.input[0], self.input[1], self.input[2], self.input[3]])
                            as usize;
                    if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&packet_len) {
                        return Err(Error::Protocol(format!(
                            "bad packet length {} (limit {})",
                            packet_len, MAX_PACKET_LEN
                        )));
                    }
                    if (packet_len + 4) % block != 0 {
                        return Err(Error::Protocol(format!(
                            "packet length {} + 4 not a multiple of the cipher block size {}",
                            packet_len, block
                        )));
                    }
                    self.state = DecodeState::AwaitRest { packet_len };
                }
                DecodeState::AwaitRest { packet_len } => {
                    let mac_len = self.mac.as_ref().map_or(0, |m| m.size());
                    let total = 4 + packet_len + mac_len;
                    if self.input.len() < total {
                        return Ok(None);
                    }

                    let block = effective_block_size(&self.cipher);
                    if let Some(cipher) = self.cipher.as_mut() {
                        if 4 + packet_len > block {
                            cipher.update(&mut self.input[block..4 + packet_len])?;
                        }
                    }

                    if let Some(mac) = self.mac.as_mut() {
                        let (packet, tag) = self.input.split_at(4 + packet_len);
                        mac.verify(self.seq, packet, &tag[..mac_len])?;
                    }

                    let pad_len = self.input[4] as usize;
                    if pad_len < 4 || packet_len < pad_len + 1 {
                        return Err(Error::Protocol(format!(
                            "bad padding length {} for packet length {}",
                            pad_len, packet_len
                        )));
                    }

                    let payload_len = packet_len - pad_len - 1;
                    let raw = &self.input[HEADER_RESERVE..HEADER_RESERVE + payload_len];
                    let payload = match self.compression.as_mut() {
                        Some(comp) if self.authed.load(Ordering::Relaxed) || !comp.is_delayed() => {
                            comp.uncompress(raw)?
                        }
                        _ => raw.to_vec(),
                    };

                    self.input.advance(total);
                    let seq = self.seq;
                    self.seq = self.seq.wrapping_add(1);
                    self.state = DecodeState::AwaitHeader;
                    return Ok(Some((seq, Buffer::from_vec(payload))));
                }
            }
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("seq", &self.seq)
            .field("state", &self.state)
            .field("buffered", &self.input.len())
            .finish()
    }
}
