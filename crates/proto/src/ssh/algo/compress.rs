//! zlib payload compression (RFC 4253 Section 6.2).
//!
//! SSH compresses each direction as one continuous zlib stream: packet
//! boundaries are flush points, not stream restarts, so the [`Zlib`] instance
//! keeps its `flate2` stream state for the lifetime of the direction.
//!
//! `zlib@openssh.com` is the delayed variant: negotiated like any other name
//! but inactive until the transport is marked authenticated.

use super::{Compression, CompressionMode};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use skiff_platform::{Error, Result};

const CHUNK: usize = 4096;

enum Stream {
    Idle,
    Deflate(Compress),
    Inflate(Decompress),
}

/// `zlib` / `zlib@openssh.com` compression.
pub struct Zlib {
    delayed: bool,
    stream: Stream,
}

impl Zlib {
    /// Creates an uninitialized instance. `delayed` selects the
    /// `zlib@openssh.com` behavior.
    pub fn new(delayed: bool) -> Self {
        Self {
            delayed,
            stream: Stream::Idle,
        }
    }
}

impl Compression for Zlib {
    fn is_delayed(&self) -> bool {
        self.delayed
    }

    fn init(&mut self, mode: CompressionMode, level: i32) -> Result<()> {
        self.stream = match mode {
            CompressionMode::Deflate => {
                let level = if level < 0 {
                    flate2::Compression::default()
                } else {
                    flate2::Compression::new(level as u32)
                };
                Stream::Deflate(Compress::new(level, true))
            }
            CompressionMode::Inflate => Stream::Inflate(Decompress::new(true)),
        };
        Ok(())
    }

    fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let stream = match &mut self.stream {
            Stream::Deflate(s) => s,
            _ => {
                return Err(Error::Protocol(
                    "compression not initialized for deflate".to_string(),
                ))
            }
        };

        let mut out = Vec::with_capacity(data.len() / 2 + 16);
        let mut chunk = [0u8; CHUNK];
        let mut consumed = 0usize;
        loop {
            let in_before = stream.total_in();
            let out_before = stream.total_out();
            let status = stream
                .compress(&data[consumed..], &mut chunk, FlushCompress::Partial)
                .map_err(|e| Error::Protocol(format!("zlib deflate failed: {}", e)))?;
            consumed += (stream.total_in() - in_before) as usize;
            let produced = (stream.total_out() - out_before) as usize;
            out.extend_from_slice(&chunk[..produced]);

            match status {
                Status::Ok | Status::BufError => {
                    if consumed == data.len() && produced < CHUNK {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }
        Ok(out)
    }

    fn uncompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let stream = match &mut self.stream {
            Stream::Inflate(s) => s,
            _ => {
                return Err(Error::Protocol(
                    "compression not initialized for inflate".to_string(),
                ))
            }
        };

        let mut out = Vec::with_capacity(data.len() * 2 + 16);
        let mut chunk = [0u8; CHUNK];
        let mut consumed = 0usize;
        loop {
            let in_before = stream.total_in();
            let out_before = stream.total_out();
            let status = stream
                .decompress(&data[consumed..], &mut chunk, FlushDecompress::None)
                .map_err(|e| Error::Protocol(format!("zlib inflate failed: {}", e)))?;
            consumed += (stream.total_in() - in_before) as usize;
            let produced = (stream.total_out() - out_before) as usize;
            out.extend_from_slice(&chunk[..produced]);

            match status {
                Status::Ok | Status::BufError => {
                    if consumed == data.len() && produced < CHUNK {
                        break;
                    }
                    if produced == 0 && consumed == data.len() {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Zlib {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zlib").field("delayed", &self.delayed).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let mut tx = Zlib::new(false);
        tx.init(CompressionMode::Deflate, -1).unwrap();
        let mut rx = Zlib::new(false);
        rx.init(CompressionMode::Inflate, -1).unwrap();

        let payload = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaabbbbbbbbbbbbbbbb".to_vec();
        let compressed = tx.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(rx.uncompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_stream_state_spans_packets() {
        let mut tx = Zlib::new(false);
        tx.init(CompressionMode::Deflate, -1).unwrap();
        let mut rx = Zlib::new(false);
        rx.init(CompressionMode::Inflate, -1).unwrap();

        for i in 0..16u8 {
            let payload = vec![i; 100 + i as usize];
            let compressed = tx.compress(&payload).unwrap();
            assert_eq!(rx.uncompress(&compressed).unwrap(), payload, "packet {}", i);
        }
    }

    #[test]
    fn test_incompressible_data() {
        let mut tx = Zlib::new(false);
        tx.init(CompressionMode::Deflate, -1).unwrap();
        let mut rx = Zlib::new(false);
        rx.init(CompressionMode::Inflate, -1).unwrap();

        let payload: Vec<u8> = (0..=255u8).cycle().take(8192).collect();
        let compressed = tx.compress(&payload).unwrap();
        assert_eq!(rx.uncompress(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_delayed_flag() {
        assert!(Zlib::new(true).is_delayed());
        assert!(!Zlib::new(false).is_delayed());
    }

    #[test]
    fn test_uninitialized_fails() {
        let mut zlib = Zlib::new(false);
        assert!(zlib.compress(b"data").is_err());
        assert!(zlib.uncompress(b"data").is_err());
    }
}
