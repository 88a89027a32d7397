//! Incremental gzip decoding for parts that arrive as a sequence of chunks.

use flate2::write::GzDecoder;
use std::io::{self, Write};

/// Push-style gunzip: feed compressed chunks, take whatever plaintext they
/// released. Memory use is bounded by one chunk's expansion.
pub struct StreamingGunzip {
    decoder: GzDecoder<Vec<u8>>,
}

impl StreamingGunzip {
    pub fn new() -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
        }
    }

    pub fn feed(&mut self, compressed: &[u8]) -> io::Result<Vec<u8>> {
        self.decoder.write_all(compressed)?;
        Ok(std::mem::take(self.decoder.get_mut()))
    }

    /// Flush the decoder and return the remaining plaintext.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        self.decoder.finish()
    }
}

impl Default for StreamingGunzip {
    fn default() -> Self {
        Self::new()
    }
}
