//! SSH identification exchange (RFC 4253 Section 4.2).
//!
//! The SSH protocol begins with an identification exchange where both client
//! and server send a line of the form:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! Example: `SSH-2.0-Skiff_0.1.0`
//!
//! Servers may precede their identification line with free-form header lines
//! (banners). [`IdentReader`] consumes the raw inbound byte stream, skipping
//! banner lines, until the identification line arrives.
//!
//! # Security
//!
//! - Maximum line length: 255 bytes
//! - At most 16 KiB of data before the identification line
//! - Lines end with CR LF; a bare LF is tolerated, a CR not followed by LF
//!   is not
//! - The server line must start with "SSH-2.0-" or "SSH-1.99-"
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::version::Version;
//!
//! let version = Version::new("Skiff_0.1.0");
//! assert_eq!(version.ident_line(), "SSH-2.0-Skiff_0.1.0");
//!
//! let parsed = Version::parse("SSH-2.0-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use skiff_platform::{Error, Result};

/// Maximum length of one identification or banner line.
pub const MAX_IDENT_LINE: usize = 255;

/// Maximum bytes of banner data tolerated before the identification line.
pub const MAX_PRE_IDENT: usize = 16 * 1024;

/// SSH identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "Skiff_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a client identification string with protocol version "2.0".
    pub fn new(software: &str) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: None,
        }
    }

    /// Parses an identification line (without line terminator).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the line is longer than
    /// [`MAX_IDENT_LINE`], does not start with `SSH-2.0-` or `SSH-1.99-`, or
    /// is otherwise malformed.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_IDENT_LINE {
            return Err(Error::Protocol(format!(
                "identification line too long: {} bytes (max {})",
                line.len(),
                MAX_IDENT_LINE
            )));
        }

        if !line.starts_with("SSH-2.0-") && !line.starts_with("SSH-1.99-") {
            return Err(Error::Protocol(format!(
                "peer does not support SSH 2.0, identified as: '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        let proto_version = parts[1];
        let rest = parts[2];

        let (software_version, comments) = match rest.find(' ') {
            Some(space) => (
                rest[..space].to_string(),
                Some(rest[space + 1..].to_string()),
            ),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version (e.g., "Skiff_0.1.0").
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// The identification line without terminator, as hashed into the
    /// key exchange.
    pub fn ident_line(&self) -> String {
        self.to_string()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Incremental reader for the peer's identification line.
///
/// Fed one byte at a time from the socket; banner lines before the
/// identification line are discarded.
#[derive(Debug, Default)]
pub struct IdentReader {
    line: Vec<u8>,
    total: usize,
    pending_cr: bool,
}

impl IdentReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one byte.
    ///
    /// Returns `Some(line)` once the identification line is complete, `None`
    /// while more input is needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] on a CR not followed by LF, a line longer
    /// than [`MAX_IDENT_LINE`], more than [`MAX_PRE_IDENT`] bytes before the
    /// identification line, or an identification line that is not SSH 2.0.
    pub fn feed(&mut self, byte: u8) -> Result<Option<String>> {
        self.total += 1;
        if self.total > MAX_PRE_IDENT {
            return Err(Error::Protocol(format!(
                "no identification line within {} bytes",
                MAX_PRE_IDENT
            )));
        }

        if self.pending_cr {
            if byte != b'\n' {
                return Err(Error::Protocol(
                    "bad line ending in identification: CR not followed by LF".to_string(),
                ));
            }
            self.pending_cr = false;
            return self.end_of_line();
        }

        match byte {
            b'\r' => {
                self.pending_cr = true;
                Ok(None)
            }
            b'\n' => self.end_of_line(),
            other => {
                if self.line.len() >= MAX_IDENT_LINE {
                    return Err(Error::Protocol(format!(
                        "identification line too long (max {} bytes)",
                        MAX_IDENT_LINE
                    )));
                }
                self.line.push(other);
                Ok(None)
            }
        }
    }

    fn end_of_line(&mut self) -> Result<Option<String>> {
        let line = String::from_utf8_lossy(&self.line).into_owned();
        self.line.clear();
        if line.starts_with("SSH-") {
            // Version::parse re-checks the protocol version prefix.
            Version::parse(&line)?;
            Ok(Some(line))
        } else {
            tracing::debug!("ignoring pre-identification line: {:?}", line);
            Ok(None)
        }
    }
}
