//! Client-side SSH-2 transport layer for the Skiff stack.
//!
//! This crate implements the transport layer protocol of RFC 4253: the
//! identification exchange, the binary packet protocol, algorithm
//! negotiation and key exchange with atomic rekeying, and the session
//! lifecycle that carries higher-level SSH services (user authentication,
//! connection multiplexing) over a raw byte stream.
//!
//! Higher-level services plug in through the [`ssh::service::Service`]
//! trait; cryptographic primitives through the traits in [`ssh::algo`].
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::ssh::hostkey::AcceptAnyVerifier;
//! use skiff_proto::ssh::transport::{Config, Transport};
//! use tokio::net::TcpStream;
//!
//! # async fn example() -> skiff_platform::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:22").await?;
//! let mut config = Config::default();
//! config.add_host_key_verifier(Box::new(AcceptAnyVerifier));
//!
//! let transport = Transport::connect(stream, "127.0.0.1:22", config).await?;
//! println!("session id: {:02x?}", transport.session_id());
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, `dalek`,
//!   RustCrypto)
//! - MAC tags are compared in constant time
//! - Key material is zeroized after installation
//! - No `unsafe` code
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 8731](https://datatracker.ietf.org/doc/html/rfc8731) - Curve25519 Key Exchange

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ssh;
