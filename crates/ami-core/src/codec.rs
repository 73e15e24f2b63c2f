//! Incremental block framing
//!
//! [`BlockDecoder`] turns a growing byte stream into complete
//! [`Block`]s. Input arrives in arbitrary chunks from the socket; a
//! partial block stays buffered until later input completes it, so
//! decoding is restartable at any chunk boundary.
//!
//! Lines end in CRLF (the wire format) or bare LF (tolerated, some
//! switch builds emit it); a blank line terminates the block. The
//! switch greets each new connection with a one-line signature banner
//! before block framing starts; [`BlockDecoder::with_banner`] consumes
//! it.

use bytes::{Buf, BytesMut};

use crate::block::Block;
use crate::error::{CodecError, Result};

/// Incremental decoder over a growing byte buffer.
#[derive(Debug)]
pub struct BlockDecoder {
    buf: BytesMut,
    /// Fields of the block currently being assembled.
    partial: Vec<(String, String)>,
    /// Whether the next complete line is the connection banner.
    awaiting_banner: bool,
    banner: Option<String>,
}

impl BlockDecoder {
    /// Decoder that expects block framing from the first byte.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            partial: Vec::new(),
            awaiting_banner: false,
            banner: None,
        }
    }

    /// Decoder that treats the first line as the connection banner.
    pub fn with_banner() -> Self {
        Self {
            awaiting_banner: true,
            ..Self::new()
        }
    }

    /// Append raw bytes from the transport.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The connection banner, once a full banner line has been read.
    /// Returns `None` before that point and after it has been taken.
    pub fn take_banner(&mut self) -> Option<String> {
        self.banner.take()
    }

    /// Decode the next complete block, if the buffer holds one.
    ///
    /// `Ok(None)` means more input is needed. A malformed line is
    /// fatal for the stream; the caller drops the connection.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        while let Some(line) = self.take_line() {
            if self.awaiting_banner {
                tracing::debug!("connection banner: {}", line);
                self.banner = Some(line);
                self.awaiting_banner = false;
                continue;
            }

            if line.is_empty() {
                // Blank line between blocks with nothing buffered is
                // harmless keep-alive noise; skip it.
                if self.partial.is_empty() {
                    continue;
                }
                let block: Block = std::mem::take(&mut self.partial).into_iter().collect();
                return Ok(Some(block));
            }

            match line.split_once(':') {
                Some((key, value)) => {
                    self.partial
                        .push((key.trim().to_string(), value.trim_start().to_string()));
                }
                None => {
                    self.partial.clear();
                    return Err(CodecError::MalformedBlock { line });
                }
            }
        }
        Ok(None)
    }

    /// Remove and return the next complete line, without its
    /// terminator. Returns `None` when no full line is buffered.
    fn take_line(&mut self) -> Option<String> {
        let nl = self.buf.iter().position(|&b| b == b'\n')?;
        let mut line = self.buf.split_to(nl);
        self.buf.advance(1); // the \n itself
        if line.last() == Some(&b'\r') {
            line.truncate(line.len() - 1);
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    /// Bytes currently buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for BlockDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Render a block to its wire form: `Key: Value` CRLF lines plus the
/// trailing blank line.
pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut out = Vec::with_capacity(64 + block.len() * 32);
    for (key, value) in block.fields() {
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}
