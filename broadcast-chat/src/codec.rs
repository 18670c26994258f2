use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits a byte stream into newline-terminated lines.
///
/// Unlike `tokio_util::codec::LinesCodec` the newline stays attached and no
/// UTF-8 validation happens here: the wire grammar needs the terminator, and
/// message text is decoded lossily further up. A trailing fragment without a
/// newline is still yielded at end of stream so the grammar can reject it.
///
/// Lines longer than `max_length` are an `InvalidData` error by default. A
/// codec built with [`LineCodec::skipping`] drops them up to the next newline
/// instead and keeps going.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_length: usize,
    // Bytes already scanned for a newline, so partial reads are not rescanned.
    next_index: usize,
    skip_oversized: bool,
    discarding: bool,
}

impl LineCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            skip_oversized: false,
            discarding: false,
        }
    }

    /// Like [`LineCodec::new`], but an oversized line is logged and dropped
    /// rather than ending the stream.
    pub fn skipping(max_length: usize) -> Self {
        Self {
            skip_oversized: true,
            ..Self::new(max_length)
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LENGTH)
    }
}

impl Decoder for LineCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        loop {
            let newline = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(index)) => {
                    src.advance(index + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    src.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(index)) if index <= self.max_length => {
                    self.next_index = 0;
                    return Ok(Some(src.split_to(index + 1)));
                }
                (false, Some(index)) => {
                    self.reject_oversized()?;
                    src.advance(index + 1);
                    self.next_index = 0;
                }
                (false, None) if src.len() > self.max_length => {
                    self.reject_oversized()?;
                    src.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Ok(None);
                }
                (false, None) => {
                    self.next_index = src.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }

        self.next_index = 0;
        if std::mem::take(&mut self.discarding) {
            src.clear();
        }
        if src.is_empty() {
            Ok(None)
        } else {
            Ok(Some(src.split()))
        }
    }
}

impl LineCodec {
    fn reject_oversized(&self) -> io::Result<()> {
        if !self.skip_oversized {
            return Err(line_too_long(self.max_length));
        }
        warn!(max_length = self.max_length, "skipping oversized line");
        Ok(())
    }
}

fn line_too_long(max_length: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line exceeds {max_length} bytes"),
    )
}
