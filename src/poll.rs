//! Cell polling: summary and full status reads with bounded retry.
//!
//! A poll is one command frame out, one reply frame back. Everything
//! that can go wrong on the party line (garbage, CRC damage, cross-talk
//! from another node, silence) is retried in place after a flush; a
//! completely silent bus additionally gets its supply rail power-cycled
//! between attempts. Failures are counted against the cell, never fatal
//! to the cycle.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::constants::{CMD_FULL_STATUS, CMD_SUMMARY, POLL_ATTEMPTS, RAIL_SETTLE_MS};
use crate::error::{BmsError, Result};
use crate::link::{SlaveLink, Transport};
use crate::registry::Cell;
use crate::version::{self, ProtocolVersion, VersionState};

/// Switched supply rail feeding the whole slave chain. Power-cycling it
/// is the last-resort resync when the bus goes completely silent.
pub trait BusRail: Send {
    fn set_power(&mut self, on: bool) -> Result<()>;

    /// Wait for the rail and the slaves behind it to settle after a
    /// power transition.
    fn settle(&mut self) {
        thread::sleep(Duration::from_millis(RAIL_SETTLE_MS));
    }
}

/// Rail that is hardwired on; for benches without the relay board.
pub struct NoopRail;

impl BusRail for NoopRail {
    fn set_power(&mut self, _on: bool) -> Result<()> {
        Ok(())
    }
}

/// Full status reply: complete telemetry including shunt hardware state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullStatus {
    pub address: u16,
    pub sequence: u8,
    pub voltage: u16,
    pub shunt_voltage: u16,
    pub shunt_current: u16,
    pub commanded_current: u16,
    pub temperature: u16,
    pub gain_pot: i8,
    pub shunt_pot: i8,
    pub has_rx: bool,
    pub automatic: bool,
}

/// Summary reply: the cheap per-cycle read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub address: u16,
    pub sequence: u8,
    pub voltage: u16,
    pub shunt_current: u16,
    pub commanded_current: u16,
    /// Only carried by the V2 dialect
    pub temperature: Option<u16>,
}

pub fn parse_full(payload: &[u8]) -> Result<FullStatus> {
    if payload.len() != version::FULL_STATUS_LEN - 2 {
        return Err(BmsError::Framing("full status length"));
    }
    Ok(FullStatus {
        address: u16::from_le_bytes([payload[0], payload[1]]),
        sequence: payload[2],
        voltage: u16::from_le_bytes([payload[3], payload[4]]),
        shunt_voltage: u16::from_le_bytes([payload[5], payload[6]]),
        shunt_current: u16::from_le_bytes([payload[7], payload[8]]),
        commanded_current: u16::from_le_bytes([payload[9], payload[10]]),
        temperature: u16::from_le_bytes([payload[11], payload[12]]),
        gain_pot: payload[13] as i8,
        shunt_pot: payload[14] as i8,
        has_rx: payload[15] & 0x01 != 0,
        automatic: payload[15] & 0x02 != 0,
    })
}

pub fn parse_summary(payload: &[u8], version: ProtocolVersion) -> Result<Summary> {
    if payload.len() != version.summary_len() - 2 {
        return Err(BmsError::Framing("summary length"));
    }
    Ok(Summary {
        address: u16::from_le_bytes([payload[0], payload[1]]),
        sequence: payload[2],
        voltage: u16::from_le_bytes([payload[3], payload[4]]),
        shunt_current: u16::from_le_bytes([payload[5], payload[6]]),
        commanded_current: u16::from_le_bytes([payload[7], payload[8]]),
        temperature: match version {
            ProtocolVersion::V1 => None,
            ProtocolVersion::V2 => Some(u16::from_le_bytes([payload[9], payload[10]])),
        },
    })
}

/// Read a cell's full status, negotiating its dialect first if needed.
pub fn poll_full<T: Transport, R: BusRail>(
    link: &mut SlaveLink<T>,
    rail: &mut R,
    cell: &mut Cell,
) -> Result<()> {
    let version = require_version(link, cell)?;
    exchange(link, rail, cell, CMD_FULL_STATUS, version.full_len(), |cell, payload, rtt| {
        let status = parse_full(payload)?;
        if status.address != cell.id {
            return Err(BmsError::AddressMismatch {
                expected: cell.id,
                actual: status.address,
            });
        }
        accept_voltage(cell, status.voltage, status.shunt_current);
        cell.shunt_current = status.shunt_current;
        cell.commanded_current = status.commanded_current;
        cell.temperature = status.temperature;
        note_sequence(cell, status.sequence);
        cell.latency = rtt;
        cell.is_data_current = true;
        Ok(())
    })
}

/// Read a cell's summary, negotiating its dialect first if needed.
pub fn poll_summary<T: Transport, R: BusRail>(
    link: &mut SlaveLink<T>,
    rail: &mut R,
    cell: &mut Cell,
) -> Result<()> {
    let version = require_version(link, cell)?;
    exchange(link, rail, cell, CMD_SUMMARY, version.summary_len(), |cell, payload, rtt| {
        let summary = parse_summary(payload, version)?;
        if summary.address != cell.id {
            return Err(BmsError::AddressMismatch {
                expected: cell.id,
                actual: summary.address,
            });
        }
        accept_voltage(cell, summary.voltage, summary.shunt_current);
        cell.shunt_current = summary.shunt_current;
        cell.commanded_current = summary.commanded_current;
        if let Some(t) = summary.temperature {
            cell.temperature = t;
        }
        note_sequence(cell, summary.sequence);
        cell.latency = rtt;
        cell.is_data_current = true;
        Ok(())
    })
}

/// One command/reply exchange with flush-and-retry, bounded to
/// [`POLL_ATTEMPTS`]. Exhaustion counts against the cell and marks its
/// data stale.
fn exchange<T, R, F>(
    link: &mut SlaveLink<T>,
    rail: &mut R,
    cell: &mut Cell,
    command: u8,
    reply_len: usize,
    mut accept: F,
) -> Result<()>
where
    T: Transport,
    R: BusRail,
    F: FnMut(&mut Cell, &[u8], Duration) -> Result<()>,
{
    let mut last_err = BmsError::Timeout { wanted: reply_len, got: 0 };
    for attempt in 0..POLL_ATTEMPTS {
        let started = Instant::now();
        link.send_command(cell.id, command)?;
        let outcome = link
            .read_frame(reply_len)
            .and_then(|payload| accept(cell, &payload, started.elapsed()));
        match outcome {
            Ok(()) => return Ok(()),
            Err(e @ (BmsError::SerialPort(_) | BmsError::Io(_))) => return Err(e),
            Err(e) => {
                debug!("cell {}: attempt {} failed: {}", cell.id, attempt + 1, e);
                let silent = matches!(e, BmsError::Timeout { got: 0, .. });
                last_err = e;
                if attempt + 1 < POLL_ATTEMPTS {
                    link.flush_pending()?;
                    if silent {
                        power_cycle_rail(rail)?;
                    }
                }
            }
        }
    }
    cell.error_count = cell.error_count.saturating_add(1);
    cell.is_data_current = false;
    warn!(
        "cell {}: giving up after {} attempts ({}), error count {}",
        cell.id, POLL_ATTEMPTS, last_err, cell.error_count
    );
    Err(last_err)
}

fn require_version<T: Transport>(
    link: &mut SlaveLink<T>,
    cell: &mut Cell,
) -> Result<ProtocolVersion> {
    match cell.version {
        VersionState::Known(v) => Ok(v),
        VersionState::Unknown => Err(BmsError::VersionUnknown { cell: cell.id }),
        VersionState::Pending => {
            version::negotiate(link, cell)?;
            match cell.version {
                VersionState::Known(v) => Ok(v),
                _ => Err(BmsError::VersionUnknown { cell: cell.id }),
            }
        }
    }
}

/// Take the voltage reading unless the cell is shunting through a
/// non-kelvin connection, where the reading is corrupted by the shunt
/// current itself.
fn accept_voltage(cell: &mut Cell, voltage: u16, shunt_current: u16) {
    if shunt_current > 0 && !cell.capabilities.has_kelvin_sense {
        return;
    }
    cell.voltage = voltage;
}

fn note_sequence(cell: &mut Cell, sequence: u8) {
    // the counter must only ever move forward, mod 256; equal or
    // backwards means a duplicated or replayed frame slipped through
    if cell.is_data_current && sequence.wrapping_sub(cell.sequence) == 0 {
        debug!("cell {}: sequence number did not advance ({})", cell.id, sequence);
    }
    cell.sequence = sequence;
}

fn power_cycle_rail<R: BusRail>(rail: &mut R) -> Result<()> {
    warn!("silent bus, power-cycling the slave rail");
    rail.set_power(false)?;
    rail.settle();
    rail.set_power(true)?;
    rail.settle();
    Ok(())
}

/// Assemble a full status payload (without CRC). Test fixture.
#[cfg(test)]
pub(crate) fn full_payload(address: u16, sequence: u8, voltage: u16, shunt: u16, commanded: u16, temperature: u16) -> Vec<u8> {
    let mut p = Vec::with_capacity(version::FULL_STATUS_LEN - 2);
    p.extend_from_slice(&address.to_le_bytes());
    p.push(sequence);
    p.extend_from_slice(&voltage.to_le_bytes());
    p.extend_from_slice(&0u16.to_le_bytes()); // shunt voltage
    p.extend_from_slice(&shunt.to_le_bytes());
    p.extend_from_slice(&commanded.to_le_bytes());
    p.extend_from_slice(&temperature.to_le_bytes());
    p.push(0); // gain pot
    p.push(0); // shunt pot
    p.push(0x03); // hasRx | automatic
    p.extend_from_slice(&[0, 0]);
    p
}

/// Assemble a summary payload (without CRC). Test fixture.
#[cfg(test)]
pub(crate) fn summary_payload(
    version: ProtocolVersion,
    address: u16,
    sequence: u8,
    voltage: u16,
    shunt: u16,
    commanded: u16,
) -> Vec<u8> {
    let mut p = Vec::with_capacity(version.summary_len() - 2);
    p.extend_from_slice(&address.to_le_bytes());
    p.push(sequence);
    p.extend_from_slice(&voltage.to_le_bytes());
    p.extend_from_slice(&shunt.to_le_bytes());
    p.extend_from_slice(&commanded.to_le_bytes());
    if version == ProtocolVersion::V2 {
        p.extend_from_slice(&2500u16.to_le_bytes());
    }
    p
}

#[cfg(test)]
pub(crate) struct MockRail {
    pub cycles: usize,
    pub on: bool,
}

#[cfg(test)]
impl MockRail {
    pub fn new() -> Self {
        MockRail { cycles: 0, on: true }
    }
}

#[cfg(test)]
impl BusRail for MockRail {
    fn set_power(&mut self, on: bool) -> Result<()> {
        if !on {
            self.cycles += 1;
        }
        self.on = on;
        Ok(())
    }

    fn settle(&mut self) {}
}
