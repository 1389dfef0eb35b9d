//! The benchmark wire protocol and its incremental parser.
//!
//! One request frame on the wire is an 8-byte little-endian header
//! (`length: u32` then `reply_size: u32`) followed by exactly `length`
//! bytes of opaque payload. The receiver answers each completed frame with
//! `reply_size` bytes of arbitrary content.
//!
//! The parser is fed raw recv slices in whatever chunking the transport
//! produced. It owes the caller two numbers per call: how many frames
//! completed and how many reply bytes those frames are owed. Truncation by
//! peer close is the caller's business (a zero-length read), not the
//! parser's.

use std::ops::AddAssign;

/// Wire header size: `length` plus `reply_size`, both little-endian u32.
pub const HEADER_LEN: usize = 8;

/// Accumulated result of one or more `consume` calls.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Consumed {
    /// Reply bytes owed for frames completed so far.
    pub owed_reply_bytes: usize,
    /// Number of frames completed so far.
    pub frames: u32,
}

impl AddAssign for Consumed {
    fn add_assign(&mut self, rhs: Consumed) {
        self.owed_reply_bytes += rhs.owed_reply_bytes;
        self.frames += rhs.frames;
    }
}

/// Incremental frame decoder, one per connection.
///
/// State survives across `consume` calls so a header (or payload) split
/// over several reads is reassembled; it resets itself after each
/// completed frame and keeps going on the residual bytes of the same call.
#[derive(Debug, Default)]
pub struct FrameParser {
    /// Scratch for a header that straddles read boundaries.
    header: [u8; HEADER_LEN],
    /// How many of the 8 header bytes have arrived.
    header_have: usize,
    /// Payload bytes seen for the current frame.
    payload_have: usize,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed `data` to the decoder, returning the frames completed by it.
    ///
    /// Zero-length payloads complete as soon as their header does, and any
    /// number of frames packed into one buffer all complete in this call.
    pub fn consume(&mut self, mut data: &[u8]) -> Consumed {
        let mut out = Consumed::default();
        loop {
            if self.header_have < HEADER_LEN {
                if data.is_empty() {
                    break;
                }
                if self.header_have == 0 && data.len() >= HEADER_LEN {
                    // Common case: whole header available, read in place.
                    self.header.copy_from_slice(&data[..HEADER_LEN]);
                    self.header_have = HEADER_LEN;
                    data = &data[HEADER_LEN..];
                } else {
                    let take = (HEADER_LEN - self.header_have).min(data.len());
                    self.header[self.header_have..self.header_have + take]
                        .copy_from_slice(&data[..take]);
                    self.header_have += take;
                    data = &data[take..];
                    if self.header_have < HEADER_LEN {
                        break;
                    }
                }
            }

            let length = self.frame_length();
            let take = (length - self.payload_have).min(data.len());
            self.payload_have += take;
            data = &data[take..];
            if self.payload_have < length {
                break;
            }

            out.owed_reply_bytes += self.reply_size();
            out.frames += 1;
            self.header_have = 0;
            self.payload_have = 0;
        }
        out
    }

    fn frame_length(&self) -> usize {
        u32::from_le_bytes([self.header[0], self.header[1], self.header[2], self.header[3]])
            as usize
    }

    fn reply_size(&self) -> usize {
        u32::from_le_bytes([self.header[4], self.header[5], self.header[6], self.header[7]])
            as usize
    }
}

/// Encode a frame header for `length` payload bytes and `reply_size` owed
/// reply bytes. Used by tests and benches to build request streams.
pub fn encode_header(length: u32, reply_size: u32) -> [u8; HEADER_LEN] {
    let mut h = [0u8; HEADER_LEN];
    h[..4].copy_from_slice(&length.to_le_bytes());
    h[4..].copy_from_slice(&reply_size.to_le_bytes());
    h
}
