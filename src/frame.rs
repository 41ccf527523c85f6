//! Byte-stuffed, CRC-protected framing for the slave bus.
//!
//! Commands and replies share one format: an unescaped [`START_BYTE`],
//! then the logical payload with any literal 0xFE/0xFF preceded by an
//! [`ESCAPE_BYTE`], then the CRC-16 of the unescaped payload, LSB first,
//! escaped by the same rule. Reply lengths are fixed per command and
//! negotiated version, so no length prefix is carried on the wire.
//!
//! Decoding is a small incremental state machine that can be fed
//! arbitrary chunks; it hunts for a start marker, which doubles as the
//! resync point after line noise.

use crate::constants::{ESCAPE_BYTE, START_BYTE};
use crate::error::{BmsError, Result};
use crc::{Crc, CRC_16_IBM_SDLC};

/// CRC-16 used by all slave firmware revisions.
pub const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

fn push_escaped(out: &mut Vec<u8>, byte: u8) {
    if byte == START_BYTE || byte == ESCAPE_BYTE {
        out.push(ESCAPE_BYTE);
    }
    out.push(byte);
}

/// Encode a command frame for one cell.
///
/// The logical payload is `[addrLo, addrHi, command]`; the CRC is
/// accumulated over those unescaped bytes as they are emitted.
pub fn encode_command(address: u16, command: u8) -> Vec<u8> {
    let logical = [(address & 0xff) as u8, (address >> 8) as u8, command];
    let mut out = Vec::with_capacity(2 * logical.len() + 5);
    out.push(START_BYTE);
    let mut digest = CRC16.digest();
    for &b in &logical {
        digest.update(&[b]);
        push_escaped(&mut out, b);
    }
    let crc = digest.finalize();
    push_escaped(&mut out, (crc & 0xff) as u8);
    push_escaped(&mut out, (crc >> 8) as u8);
    out
}

/// Incremental decoder for one reply frame of known logical length.
///
/// `want` counts logical bytes including the two trailing CRC bytes.
#[derive(Debug)]
pub struct FrameDecoder {
    want: usize,
    out: Vec<u8>,
    escaped: bool,
    synced: bool,
}

impl FrameDecoder {
    pub fn new(want: usize) -> Self {
        FrameDecoder {
            want,
            out: Vec::with_capacity(want),
            escaped: false,
            synced: false,
        }
    }

    /// Feed one byte. Returns true once the frame is complete.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.is_complete() {
            return true;
        }
        if !self.synced {
            if byte == START_BYTE {
                self.synced = true;
            }
            return false;
        }
        if self.escaped {
            self.escaped = false;
            self.out.push(byte);
        } else if byte == ESCAPE_BYTE {
            self.escaped = true;
        } else if byte == START_BYTE {
            // an unescaped marker mid-frame means we lost bytes; resync here
            self.out.clear();
            self.escaped = false;
        } else {
            self.out.push(byte);
        }
        self.is_complete()
    }

    /// Feed a chunk, returning how many bytes were consumed.
    pub fn push_all(&mut self, bytes: &[u8]) -> usize {
        for (i, &b) in bytes.iter().enumerate() {
            if self.push(b) {
                return i + 1;
            }
        }
        bytes.len()
    }

    pub fn is_complete(&self) -> bool {
        self.out.len() >= self.want
    }

    /// Validate the CRC and return the logical payload without it.
    pub fn finish(mut self) -> Result<Vec<u8>> {
        if !self.is_complete() {
            return Err(BmsError::Framing("frame incomplete"));
        }
        let crc_lo = self.out[self.want - 2];
        let crc_hi = self.out[self.want - 1];
        let actual = u16::from_le_bytes([crc_lo, crc_hi]);
        let expected = CRC16.checksum(&self.out[..self.want - 2]);
        if expected != actual {
            return Err(BmsError::Integrity { expected, actual });
        }
        self.out.truncate(self.want - 2);
        Ok(self.out)
    }
}

/// Decode one complete frame from a byte slice.
///
/// Used where the whole reply has already been collected; the polling
/// path feeds the decoder incrementally instead.
pub fn decode_frame(bytes: &[u8], want: usize) -> Result<Vec<u8>> {
    let mut decoder = FrameDecoder::new(want);
    decoder.push_all(bytes);
    decoder.finish()
}

/// Cell address echoed at the front of every reply payload.
pub fn reply_address(payload: &[u8]) -> u16 {
    u16::from_le_bytes([payload[0], payload[1]])
}

/// Build a reply frame the way slave firmware does. Test fixture shared
/// by the poll and negotiation tests.
#[cfg(test)]
pub(crate) fn encode_reply(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * payload.len() + 5);
    out.push(START_BYTE);
    for &b in payload {
        push_escaped(&mut out, b);
    }
    let crc = CRC16.checksum(payload);
    push_escaped(&mut out, (crc & 0xff) as u8);
    push_escaped(&mut out, (crc >> 8) as u8);
    out
}
