//! SSH transport layer implementation (RFC 4253, client side).
//!
//! # Architecture
//!
//! The implementation is layered, leaves first:
//!
//! 1. **Wire types** ([`buffer`], [`message`]) - the SSH wire format and
//!    message numbers
//! 2. **Algorithms** ([`algo`]) - pluggable cipher/MAC/digest/compression/
//!    key-exchange implementations behind a name-to-factory [`algo::registry`]
//! 3. **Packet codec** ([`codec`]) - binary packet framing with per-direction
//!    cipher, MAC, compression, and sequence numbers
//! 4. **Key exchange** ([`proposal`], [`kexer`], [`hostkey`]) - KEXINIT
//!    negotiation, the kex state machine, key derivation, host key trust
//! 5. **Transport core** ([`version`], [`transport`], [`service`], [`sync`]) -
//!    identification exchange, reader/writer pumps, dispatch, lifecycle
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::buffer::Buffer;
//! use skiff_proto::ssh::message::Message;
//!
//! let mut packet = Buffer::packet(Message::ServiceRequest);
//! packet.put_string(b"ssh-userauth");
//! assert_eq!(packet.compact_data()[0], 5);
//! ```

pub mod algo;
pub mod buffer;
pub mod codec;
pub mod hostkey;
pub mod kexer;
pub mod message;
pub mod proposal;
pub mod service;
pub mod sync;
pub mod transport;
pub mod version;

// Re-export main types
pub use buffer::Buffer;
pub use hostkey::{AcceptAnyVerifier, FingerprintVerifier, HostKey, HostKeyVerifier};
pub use message::Message;
pub use proposal::{Negotiated, Proposal};
pub use service::Service;
pub use transport::{Config, Transport, TransportState};
pub use version::Version;
