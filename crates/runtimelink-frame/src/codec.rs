use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::envelope::{Envelope, Inbound, RemoteError};
use crate::error::{FrameError, Result};

/// Message terminator appended after every serialized envelope.
pub const TERMINATOR: &[u8] = b"\nOK";

/// Default limit on unterminated buffered bytes: 64 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Maximum bytes held while waiting for a terminator. Default: 64 MiB.
    pub max_message_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Serialize an envelope and append the terminator.
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    if envelope.identifier.is_empty() {
        return Err(FrameError::EmptyIdentifier);
    }
    encode_value(envelope)
}

/// Serialize the bare in-band error shape and append the terminator.
pub fn encode_error(error: &RemoteError) -> Result<Bytes> {
    encode_value(error)
}

fn encode_value<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    let mut dst = BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY).writer();
    serde_json::to_writer(&mut dst, value)?;
    let mut dst = dst.into_inner();
    dst.put_slice(TERMINATOR);
    Ok(dst.freeze())
}

/// Reassembles terminator-delimited messages from arbitrary read chunks.
///
/// The codec never performs I/O. Bytes go in through [`FrameCodec::feed`];
/// complete messages come out of the returned iterator.
#[derive(Debug)]
pub struct FrameCodec {
    buf: BytesMut,
    /// Bytes before this offset are known not to start a terminator.
    scanned: usize,
    /// Dropping an oversized message until its terminator shows up.
    discarding: bool,
    config: CodecConfig,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_config(CodecConfig::default())
    }

    pub fn with_config(config: CodecConfig) -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            scanned: 0,
            discarding: false,
            config,
        }
    }

    /// Append received bytes and iterate the messages they complete.
    ///
    /// Decoding is lazy. Messages not pulled from the iterator stay buffered
    /// and are yielded by the next `feed` call. A chunk that fails to parse
    /// yields one `Err` and decoding continues with the next chunk.
    pub fn feed(&mut self, bytes: &[u8]) -> Decoded<'_> {
        self.buf.extend_from_slice(bytes);
        Decoded { codec: self }
    }

    /// Bytes currently held waiting for a terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.scanned = 0;
        self.discarding = false;
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    fn next_chunk(&mut self) -> Option<Result<Inbound>> {
        loop {
            let Some(pos) = find(&self.buf[self.scanned..], TERMINATOR).map(|p| p + self.scanned)
            else {
                self.scanned = self.buf.len().saturating_sub(TERMINATOR.len() - 1);
                return self.check_overflow();
            };

            let chunk = self.buf.split_to(pos);
            self.buf.advance(TERMINATOR.len());
            self.scanned = 0;

            if self.discarding {
                self.discarding = false;
                continue;
            }
            return Some(Inbound::parse(&chunk));
        }
    }

    fn check_overflow(&mut self) -> Option<Result<Inbound>> {
        let size = self.buf.len();
        if size <= self.config.max_message_size {
            return None;
        }
        // Keep a possible terminator prefix so resync works across reads.
        let keep = TERMINATOR.len() - 1;
        self.buf.advance(size - keep);
        self.scanned = 0;
        if std::mem::replace(&mut self.discarding, true) {
            return None;
        }
        warn!(size, max = self.config.max_message_size, "discarding oversized message");
        Some(Err(FrameError::MessageTooLarge {
            size,
            max: self.config.max_message_size,
        }))
    }
}

/// Lazy iterator returned by [`FrameCodec::feed`].
pub struct Decoded<'a> {
    codec: &'a mut FrameCodec,
}

impl Iterator for Decoded<'_> {
    type Item = Result<Inbound>;

    fn next(&mut self) -> Option<Self::Item> {
        self.codec.next_chunk()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
