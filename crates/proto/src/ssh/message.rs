//! SSH protocol message types (RFC 4253).
//!
//! This module defines the transport-layer message numbers and their numeric
//! identifiers as specified in RFC 4253 Section 12.
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug, service requests
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//!
//! Message numbers 50 and above belong to the services the transport carries
//! (user authentication, connection protocol) and are routed to the active
//! service rather than interpreted here.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::message::Message;
//!
//! let msg = Message::KexInit;
//! assert_eq!(msg as u8, 20);
//! ```

/// First message number reserved for key-exchange-method-specific packets.
pub const KEX_FOLLOWUP_FIRST: u8 = 30;

/// Last message number reserved for key-exchange-method-specific packets.
pub const KEX_FOLLOWUP_LAST: u8 = 49;

/// SSH transport-layer message types as defined in RFC 4253 Section 12.
///
/// Each message type has a unique numeric identifier used in the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Message {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// Diffie-Hellman/ECDH key exchange init (both use the same message number).
    KexdhInit = 30,
    /// Diffie-Hellman/ECDH key exchange reply (both use the same message number).
    KexdhReply = 31,
}

impl Message {
    /// Converts a byte to a message type.
    ///
    /// Returns `None` for message numbers outside the transport layer; those
    /// bytes are dispatched to the active service or answered with
    /// SSH_MSG_UNIMPLEMENTED.
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::message::Message;
    ///
    /// assert_eq!(Message::from_u8(20), Some(Message::KexInit));
    /// assert_eq!(Message::from_u8(255), None);
    /// ```
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Message::Disconnect),
            2 => Some(Message::Ignore),
            3 => Some(Message::Unimplemented),
            4 => Some(Message::Debug),
            5 => Some(Message::ServiceRequest),
            6 => Some(Message::ServiceAccept),
            20 => Some(Message::KexInit),
            21 => Some(Message::NewKeys),
            30 => Some(Message::KexdhInit),
            31 => Some(Message::KexdhReply),
            _ => None,
        }
    }

    /// Returns whether a raw message number is key-exchange-method specific.
    pub fn is_kex_followup(byte: u8) -> bool {
        (KEX_FOLLOWUP_FIRST..=KEX_FOLLOWUP_LAST).contains(&byte)
    }

    /// Returns the message type name.
    ///
    /// # Example
    ///
    /// ```rust
    /// use skiff_proto::ssh::message::Message;
    ///
    /// assert_eq!(Message::KexInit.name(), "SSH_MSG_KEXINIT");
    /// ```
    pub fn name(&self) -> &'static str {
        match self {
            Message::Disconnect => "SSH_MSG_DISCONNECT",
            Message::Ignore => "SSH_MSG_IGNORE",
            Message::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            Message::Debug => "SSH_MSG_DEBUG",
            Message::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            Message::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            Message::KexInit => "SSH_MSG_KEXINIT",
            Message::NewKeys => "SSH_MSG_NEWKEYS",
            Message::KexdhInit => "SSH_MSG_KEXDH_INIT",
            Message::KexdhReply => "SSH_MSG_KEXDH_REPLY",
        }
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}
