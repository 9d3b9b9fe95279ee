//! Length-prefixed wire framing.
//!
//! Every message on the transport is one frame:
//!
//! ```text
//! +-----------+------------------+----+------------------+
//! | u32 (BE)  | channel id       | \n | payload          |
//! | length N  | (ASCII decimals) |    | (N - id - 1 B)   |
//! +-----------+------------------+----+------------------+
//! ```
//!
//! The length prefix covers the channel id, the separating newline and the
//! payload. Channel id `0` carries control messages; any other decimal id
//! carries data for that channel. There is no escaping; the length prefix is
//! authoritative.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

/// The channel id reserved for control messages.
pub const CONTROL_CHANNEL: &str = "0";

/// Upper bound on a single frame body. A declared length beyond this is
/// treated as a framing error rather than an allocation request.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// One decoded frame: a channel id and its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Decimal channel id, `"0"` for control.
    pub channel: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(channel: impl Into<String>, payload: Bytes) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    pub fn control(payload: Bytes) -> Self {
        Self::new(CONTROL_CHANNEL, payload)
    }

    pub fn is_control(&self) -> bool {
        self.channel == CONTROL_CHANNEL
    }

    /// Build the length-prefix-plus-channel header for this frame.
    ///
    /// The header and the payload are deliberately separate buffers so the
    /// write path can hand both to a vectored write without copying the
    /// payload.
    pub fn header(&self) -> Bytes {
        let mut header = BytesMut::with_capacity(4 + self.channel.len() + 1);
        let length = self.channel.len() + 1 + self.payload.len();
        header.put_u32(length as u32);
        header.put_slice(self.channel.as_bytes());
        header.put_u8(b'\n');
        header.freeze()
    }

    /// Encode the whole frame into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let header = self.header();
        let mut buf = BytesMut::with_capacity(header.len() + self.payload.len());
        buf.put_slice(&header);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Validate a channel id: non-empty ASCII decimal digits fitting `u32`,
/// no sign, as they appear on the wire.
pub fn valid_channel_id(id: &str) -> bool {
    !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) && id.parse::<u32>().is_ok()
}

/// Incremental frame parser over a rolling input buffer.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Try to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Consumed bytes are
    /// removed from `buf`; on error the buffer is left untouched (the
    /// transport is about to die anyway).
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if length > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                length,
                limit: self.max_frame_size,
            });
        }
        if buf.len() < 4 + length {
            return Ok(None);
        }

        let body = &buf[4..4 + length];
        let newline = body
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(WireError::MissingChannelPrefix)?;
        let id = std::str::from_utf8(&body[..newline]).map_err(|_| WireError::BadChannelPrefix)?;
        if !valid_channel_id(id) {
            return Err(WireError::BadChannelPrefix);
        }
        let channel = id.to_string();

        buf.advance(4 + newline + 1);
        let payload = buf.split_to(length - newline - 1).freeze();

        Ok(Some(Frame { channel, payload }))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}
