//! # Skiff Platform
//!
//! Core platform types shared across the Skiff SSH stack.
//!
//! This crate provides:
//! - Unified error types (`Error`, `Result`)
//! - RFC 4253 disconnect reason constants
//!
//! # Examples
//!
//! ```
//! use skiff_platform::{Error, Result};
//!
//! fn example_function() -> Result<String> {
//!     Ok("Hello, Skiff!".to_string())
//! }
//!
//! # fn main() -> Result<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Skiff!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{
    Error, Result, DISCONNECT_BY_APPLICATION, DISCONNECT_COMPRESSION_ERROR,
    DISCONNECT_CONNECTION_LOST, DISCONNECT_HOST_KEY_NOT_VERIFIABLE,
    DISCONNECT_KEY_EXCHANGE_FAILED, DISCONNECT_MAC_ERROR, DISCONNECT_PROTOCOL_ERROR,
};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
