//! Protocol dialects and version negotiation.
//!
//! Slave firmware has gone through incompatible revisions; the reply
//! shapes differ per dialect, so each cell is probed once with the
//! newest dialect's version query and the answer pins the codec used
//! for it from then on. An unresponsive cell must not stall the bus
//! forever: after the attempt budget it is marked [`VersionState::Unknown`]
//! and carries no further traffic until renegotiation is explicitly
//! requested.

use std::time::Instant;

use chrono::{TimeZone, Utc};
use log::{debug, info, warn};

use crate::constants::{CMD_VERSION, NEGOTIATE_ATTEMPTS};
use crate::error::{BmsError, Result};
use crate::link::{SlaveLink, Transport};
use crate::registry::{Cell, CellCapabilities};

/// Logical length of a version reply, CRC included.
pub const VERSION_REPLY_LEN: usize = 17;

/// Logical length of a full status reply, CRC included.
pub const FULL_STATUS_LEN: usize = 20;

/// Known slave protocol dialects, newest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    V1,
    V2,
}

impl ProtocolVersion {
    /// Dialect used to probe cells whose version is not yet known.
    pub const NEWEST: ProtocolVersion = ProtocolVersion::V2;

    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ProtocolVersion::V1),
            2 => Some(ProtocolVersion::V2),
            _ => None,
        }
    }

    /// Logical length of a summary reply under this dialect. V2 added
    /// the temperature field.
    pub fn summary_len(self) -> usize {
        match self {
            ProtocolVersion::V1 => 11,
            ProtocolVersion::V2 => 13,
        }
    }

    pub fn full_len(self) -> usize {
        FULL_STATUS_LEN
    }
}

/// Per-cell negotiation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionState {
    /// Never negotiated; the next poll will negotiate inline
    Pending,
    Known(ProtocolVersion),
    /// Negotiation exhausted its attempts; the cell is off the bus
    /// until renegotiation is explicitly requested
    Unknown,
}

/// Decoded version-query reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReply {
    pub address: u16,
    pub sequence: u8,
    pub version: u8,
    pub capabilities: CellCapabilities,
    pub revision: u16,
    pub is_clean: bool,
    /// Firmware build timestamp, seconds since the epoch
    pub programmed_at: u32,
}

pub fn parse_version_reply(payload: &[u8]) -> Result<VersionReply> {
    if payload.len() != VERSION_REPLY_LEN - 2 {
        return Err(BmsError::Framing("version reply length"));
    }
    Ok(VersionReply {
        address: u16::from_le_bytes([payload[0], payload[1]]),
        sequence: payload[2],
        version: payload[3],
        capabilities: CellCapabilities::from_flags(payload[4]),
        revision: u16::from_le_bytes([payload[5], payload[6]]),
        is_clean: payload[7] != 0,
        programmed_at: u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]),
    })
}

/// Probe a cell with the newest dialect and record what it answers.
///
/// Bounded to [`NEGOTIATE_ATTEMPTS`]; exhausting them sets the unknown
/// sentinel so a single dead node cannot stall the whole cycle.
pub fn negotiate<T: Transport>(link: &mut SlaveLink<T>, cell: &mut Cell) -> Result<()> {
    for attempt in 0..NEGOTIATE_ATTEMPTS {
        if attempt > 0 {
            link.flush_pending()?;
        }
        let started = Instant::now();
        link.send_command(cell.id, CMD_VERSION)?;
        let payload = match link.read_frame(VERSION_REPLY_LEN) {
            Ok(p) => p,
            Err(e) => {
                debug!("cell {}: version probe attempt {} failed: {}", cell.id, attempt + 1, e);
                continue;
            }
        };
        let reply = match parse_version_reply(&payload) {
            Ok(r) => r,
            Err(e) => {
                debug!("cell {}: bad version reply: {}", cell.id, e);
                continue;
            }
        };
        if reply.address != cell.id {
            debug!(
                "cell {}: version reply from wrong node {}",
                cell.id, reply.address
            );
            continue;
        }
        let version = match ProtocolVersion::from_wire(reply.version) {
            Some(v) => v,
            None => {
                warn!("cell {}: unsupported dialect {}", cell.id, reply.version);
                continue;
            }
        };
        cell.version = VersionState::Known(version);
        cell.capabilities = reply.capabilities;
        cell.revision = reply.revision;
        cell.is_clean = reply.is_clean;
        cell.programmed_at = Utc.timestamp_opt(reply.programmed_at as i64, 0).single();
        cell.sequence = reply.sequence;
        cell.latency = started.elapsed();
        info!(
            "cell {}: negotiated {:?}, rev {}{}, caps {:02x}",
            cell.id,
            version,
            cell.revision,
            if cell.is_clean { "" } else { " (dirty)" },
            cell.capabilities.to_flags()
        );
        return Ok(());
    }
    cell.version = VersionState::Unknown;
    warn!(
        "cell {}: no version after {} attempts, excluding from bus traffic",
        cell.id, NEGOTIATE_ATTEMPTS
    );
    Err(BmsError::VersionUnknown { cell: cell.id })
}

/// The only path out of [`VersionState::Unknown`].
pub fn renegotiate<T: Transport>(link: &mut SlaveLink<T>, cell: &mut Cell) -> Result<()> {
    cell.version = VersionState::Pending;
    negotiate(link, cell)
}

/// Assemble a version reply payload (without CRC). Test fixture.
#[cfg(test)]
pub(crate) fn version_payload(
    address: u16,
    sequence: u8,
    version: u8,
    flags: u8,
    revision: u16,
    clean: bool,
    programmed_at: u32,
) -> Vec<u8> {
    let mut p = Vec::with_capacity(VERSION_REPLY_LEN - 2);
    p.extend_from_slice(&address.to_le_bytes());
    p.push(sequence);
    p.push(version);
    p.push(flags);
    p.extend_from_slice(&revision.to_le_bytes());
    p.push(clean as u8);
    p.extend_from_slice(&programmed_at.to_le_bytes());
    p.extend_from_slice(&[0, 0, 0]);
    p
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_reply;
    use crate::link::MockTransport;

    #[test]
    fn negotiation_populates_cell_state() {
        let mut mock = MockTransport::new();
        mock.expect_reply(encode_reply(&version_payload(
            12, 7, 2, 0x0b, 513, true, 1_600_000_000,
        )));
        let mut link = SlaveLink::without_pacing(mock);
        let mut cell = Cell::new(0, 0, 12);
        negotiate(&mut link, &mut cell).unwrap();
        assert_eq!(cell.version, VersionState::Known(ProtocolVersion::V2));
        assert!(cell.capabilities.has_kelvin_sense);
        assert!(cell.capabilities.is_resistor_shunt);
        assert!(!cell.capabilities.is_hard_switched_shunt);
        assert!(cell.capabilities.has_temperature_sensor);
        assert_eq!(cell.revision, 513);
        assert!(cell.is_clean);
        assert_eq!(cell.sequence, 7);
        assert!(cell.programmed_at.is_some());
    }

    #[test]
    fn three_silent_attempts_set_the_unknown_sentinel() {
        let mut link = SlaveLink::without_pacing(MockTransport::new());
        let mut cell = Cell::new(0, 0, 9);
        match negotiate(&mut link, &mut cell) {
            Err(BmsError::VersionUnknown { cell: 9 }) => {}
            other => panic!("expected VersionUnknown, got {other:?}"),
        }
        assert_eq!(cell.version, VersionState::Unknown);
        // exactly three probes went out
        let frame_len = crate::frame::encode_command(9, CMD_VERSION).len();
        assert_eq!(link.transport().bytes_written(), 3 * frame_len);
    }

    #[test]
    fn reply_from_wrong_node_burns_the_attempt() {
        let mut mock = MockTransport::new();
        for _ in 0..NEGOTIATE_ATTEMPTS {
            mock.expect_reply(encode_reply(&version_payload(8, 0, 2, 0, 1, true, 0)));
        }
        let mut link = SlaveLink::without_pacing(mock);
        let mut cell = Cell::new(0, 0, 9);
        assert!(negotiate(&mut link, &mut cell).is_err());
        assert_eq!(cell.version, VersionState::Unknown);
    }

    #[test]
    fn renegotiate_is_the_only_way_back() {
        let mut cell = Cell::new(0, 0, 5);
        cell.version = VersionState::Unknown;
        let mut mock = MockTransport::new();
        mock.expect_reply(encode_reply(&version_payload(5, 1, 1, 0x01, 44, false, 0)));
        let mut link = SlaveLink::without_pacing(mock);
        renegotiate(&mut link, &mut cell).unwrap();
        assert_eq!(cell.version, VersionState::Known(ProtocolVersion::V1));
        assert!(!cell.is_clean);
    }
}
