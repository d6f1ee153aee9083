//! Element codec — raw bytes ⇄ structured [`Element`]s.
//!
//! Frames are newline-delimited JSON documents. After a successful
//! compression handshake each direction is switched in place to a zlib
//! layer: bytes already buffered but not yet decoded are fed through the
//! inflater, so no data is lost across the switch.

use std::io::Write;

use bytes::{Buf, BufMut, BytesMut};
use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::element::Element;
use crate::error::LinkError;

/// Largest frame (in uncompressed bytes) accepted in either direction.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Compression method names this codec can switch to.
pub const SUPPORTED_COMPRESSION: &[&str] = &["zlib"];

/// Newline-delimited JSON element codec with optional zlib layer.
pub struct ElementCodec {
    max_frame_size: usize,
    /// Inflated bytes waiting to be framed (compressed mode only).
    plain: BytesMut,
    inflater: Option<ZlibDecoder<Vec<u8>>>,
    deflater: Option<ZlibEncoder<Vec<u8>>>,
    label: String,
}

impl std::fmt::Debug for ElementCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElementCodec")
            .field("label", &self.label)
            .field("compressed", &self.is_compressed())
            .finish()
    }
}

impl Default for ElementCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            plain: BytesMut::new(),
            inflater: None,
            deflater: None,
            label: String::new(),
        }
    }

    /// Tag used in trace output, typically the stream id.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Whether `method` is a compression method this codec implements.
    pub fn supports(method: &str) -> bool {
        SUPPORTED_COMPRESSION.contains(&method)
    }

    /// Switch both directions to zlib. Calling it again is a no-op.
    pub fn enable_compression(&mut self) {
        if self.inflater.is_none() {
            self.inflater = Some(ZlibDecoder::new(Vec::new()));
        }
        if self.deflater.is_none() {
            self.deflater = Some(ZlibEncoder::new(Vec::new(), Compression::default()));
        }
        trace!("[{}] codec switched to zlib", self.label);
    }

    pub fn is_compressed(&self) -> bool {
        self.inflater.is_some()
    }

    fn next_line(
        buf: &mut BytesMut,
        max_frame_size: usize,
    ) -> Result<Option<BytesMut>, LinkError> {
        loop {
            let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
                if buf.len() > max_frame_size {
                    return Err(LinkError::protocol(format!(
                        "frame exceeds {max_frame_size} bytes"
                    )));
                }
                return Ok(None);
            };
            if pos > max_frame_size {
                return Err(LinkError::protocol(format!(
                    "frame exceeds {max_frame_size} bytes"
                )));
            }
            let mut line = buf.split_to(pos);
            buf.advance(1);
            // Whitespace keepalives between elements are allowed.
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            return Ok(Some(line));
        }
    }
}

impl Decoder for ElementCodec {
    type Item = Element;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Element>, LinkError> {
        let line = match self.inflater.as_mut() {
            Some(inflater) => {
                if !src.is_empty() {
                    inflater.write_all(src)?;
                    inflater.flush()?;
                    src.clear();
                    let inflated = std::mem::take(inflater.get_mut());
                    self.plain.extend_from_slice(&inflated);
                }
                Self::next_line(&mut self.plain, self.max_frame_size)?
            }
            None => Self::next_line(src, self.max_frame_size)?,
        };

        let Some(line) = line else {
            return Ok(None);
        };
        trace!(
            "[{}] <-- {}",
            self.label,
            String::from_utf8_lossy(&line)
        );
        let element = serde_json::from_slice::<Element>(&line)
            .map_err(|e| LinkError::protocol(format!("malformed element: {e}")))?;
        Ok(Some(element))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Element>, LinkError> {
        match self.decode(src)? {
            Some(element) => Ok(Some(element)),
            None => {
                // A trailing partial frame at EOF is discarded; the stream
                // layer reports the missing close element.
                if !src.is_empty() || !self.plain.is_empty() {
                    trace!("[{}] dropping partial frame at eof", self.label);
                    src.clear();
                    self.plain.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Element> for ElementCodec {
    type Error = LinkError;

    fn encode(&mut self, element: Element, dst: &mut BytesMut) -> Result<(), LinkError> {
        let mut line = serde_json::to_vec(&element)?;
        if line.len() > self.max_frame_size {
            return Err(LinkError::protocol(format!(
                "outgoing {} of {} bytes exceeds {} bytes",
                element.name(),
                line.len(),
                self.max_frame_size
            )));
        }
        trace!("[{}] --> {}", self.label, String::from_utf8_lossy(&line));
        line.push(b'\n');

        match self.deflater.as_mut() {
            Some(deflater) => {
                deflater.write_all(&line)?;
                // Sync flush so the peer can inflate this frame right away.
                deflater.flush()?;
                let compressed = std::mem::take(deflater.get_mut());
                dst.reserve(compressed.len());
                dst.put_slice(&compressed);
            }
            None => {
                dst.reserve(line.len());
                dst.put_slice(&line);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
