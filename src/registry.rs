//! In-memory model of the pack: batteries, their ordered cells, and
//! per-cell protocol and runtime state.
//!
//! Topology is fixed at startup from configuration and mutated in place
//! every cycle; nothing is destroyed until the process exits. Cell
//! order within a battery is physically meaningful (adjacency decides
//! which neighbours a shunt warms) and must never be reordered.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::version::VersionState;

/// Hardware capabilities reported by a cell during negotiation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CellCapabilities {
    /// Separate sense wiring; voltage stays accurate while shunting
    pub has_kelvin_sense: bool,
    /// Resistor shunt rather than a transistor one
    pub is_resistor_shunt: bool,
    /// Shunt is switched hard on/off instead of linearly
    pub is_hard_switched_shunt: bool,
    pub has_temperature_sensor: bool,
}

impl CellCapabilities {
    pub fn from_flags(flags: u8) -> Self {
        CellCapabilities {
            has_kelvin_sense: flags & 0x01 != 0,
            is_resistor_shunt: flags & 0x02 != 0,
            is_hard_switched_shunt: flags & 0x04 != 0,
            has_temperature_sensor: flags & 0x08 != 0,
        }
    }

    pub fn to_flags(self) -> u8 {
        (self.has_kelvin_sense as u8)
            | (self.is_resistor_shunt as u8) << 1
            | (self.is_hard_switched_shunt as u8) << 2
            | (self.has_temperature_sensor as u8) << 3
    }
}

/// One cell monitor board. Owned exclusively by its battery.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Index of the owning battery within the pack
    pub battery_index: u8,
    /// Position within the battery; fixed
    pub index: u16,
    /// Bus address
    pub id: u16,
    /// Last read cell voltage in mV
    pub voltage: u16,
    /// Last read shunt current in mA
    pub shunt_current: u16,
    /// Last read temperature in centi-degrees C
    pub temperature: u16,
    /// Commanded current the cell reports it is holding, in mA
    pub commanded_current: u16,
    /// Target we want the cell to hold, in mA
    pub target_current: u16,
    /// Running count of exchanges that exhausted their retries
    pub error_count: u16,
    /// Negotiated protocol dialect
    pub version: VersionState,
    pub capabilities: CellCapabilities,
    /// Firmware revision
    pub revision: u16,
    /// Firmware was built from an unmodified tree
    pub is_clean: bool,
    /// Firmware build timestamp
    pub programmed_at: Option<DateTime<Utc>>,
    /// Round-trip time of the last successful exchange
    pub latency: Duration,
    /// Sequence number carried by the last reply; wraps mod 256
    pub sequence: u8,
    /// False while the last poll failed and the fields above are stale
    pub is_data_current: bool,
}

impl Cell {
    pub fn new(battery_index: u8, index: u16, id: u16) -> Self {
        Cell {
            battery_index,
            index,
            id,
            voltage: 0,
            shunt_current: 0,
            temperature: 0,
            commanded_current: 0,
            target_current: 0,
            error_count: 0,
            version: VersionState::Pending,
            capabilities: CellCapabilities::default(),
            revision: 0,
            is_clean: false,
            programmed_at: None,
            latency: Duration::ZERO,
            sequence: 0,
            is_data_current: false,
        }
    }

    pub fn is_shunting(&self) -> bool {
        self.shunt_current > 0
    }

    /// Transistor shunt without kelvin sense wiring; its voltage
    /// reading is unreliable while the shunt conducts.
    pub fn has_unreliable_shunting_voltage(&self) -> bool {
        !self.capabilities.is_resistor_shunt && !self.capabilities.has_kelvin_sense
    }
}

/// An ordered series of cells.
#[derive(Debug, Clone)]
pub struct Battery {
    pub index: u8,
    pub name: String,
    pub cells: Vec<Cell>,
}

impl Battery {
    /// Minimum voltage across cells with current data, if any.
    pub fn min_voltage(&self) -> Option<u16> {
        self.cells
            .iter()
            .filter(|c| c.is_data_current)
            .map(|c| c.voltage)
            .min()
    }

    pub fn max_voltage(&self) -> Option<u16> {
        self.cells
            .iter()
            .filter(|c| c.is_data_current)
            .map(|c| c.voltage)
            .max()
    }

    /// Highest temperature seen across the battery this cycle; used to
    /// derate shunt current.
    pub fn worst_temperature(&self) -> u16 {
        self.cells
            .iter()
            .filter(|c| c.is_data_current && c.capabilities.has_temperature_sensor)
            .map(|c| c.temperature)
            .max()
            .unwrap_or(0)
    }

    /// True once every cell produced data this cycle.
    pub fn is_complete(&self) -> bool {
        self.cells.iter().all(|c| c.is_data_current)
    }
}

/// Operating mode of the vehicle; balancing only runs while charging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Charging,
    Driving,
}

/// Global monitor state: every battery plus the adaptive loop state.
#[derive(Debug)]
pub struct Pack {
    pub batteries: Vec<Battery>,
    /// Current delay between poll cycles
    pub poll_delay: Duration,
    pub mode: Mode,
    /// Shunt readings are paused (voltage phase in progress)
    pub shunt_paused: bool,
    /// Rolling cycle counter; tags telemetry and staggers periodic work
    pub cycle: u32,
}

impl Pack {
    pub fn from_config(config: &Config) -> Self {
        let batteries = config
            .batteries
            .iter()
            .enumerate()
            .map(|(bi, b)| Battery {
                index: bi as u8,
                name: b.name.clone(),
                cells: b
                    .cells
                    .iter()
                    .enumerate()
                    .map(|(ci, &id)| Cell::new(bi as u8, ci as u16, id))
                    .collect(),
            })
            .collect();
        Pack {
            batteries,
            poll_delay: Duration::from_millis(config.poll_delay_ms),
            mode: Mode::Charging,
            shunt_paused: false,
            cycle: 0,
        }
    }

    pub fn cell_count(&self) -> usize {
        self.batteries.iter().map(|b| b.cells.len()).sum()
    }

    pub fn cells(&self) -> impl Iterator<Item = &Cell> {
        self.batteries.iter().flat_map(|b| b.cells.iter())
    }

    pub fn cells_mut(&mut self) -> impl Iterator<Item = &mut Cell> {
        self.batteries.iter_mut().flat_map(|b| b.cells.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_flags_round_trip() {
        for flags in 0..16u8 {
            assert_eq!(CellCapabilities::from_flags(flags).to_flags(), flags);
        }
    }

    #[test]
    fn capabilities_serialize_for_telemetry_sinks() {
        let caps = CellCapabilities::from_flags(0x0b);
        let json = serde_json::to_string(&caps).unwrap();
        assert!(json.contains("\"has_kelvin_sense\":true"));
        assert!(json.contains("\"is_hard_switched_shunt\":false"));
    }

    #[test]
    fn battery_extrema_skip_stale_cells() {
        let mut battery = Battery {
            index: 0,
            name: "test".into(),
            cells: (0..3).map(|i| Cell::new(0, i, i + 10)).collect(),
        };
        assert_eq!(battery.min_voltage(), None);
        for (i, cell) in battery.cells.iter_mut().enumerate() {
            cell.voltage = 3300 + 100 * i as u16;
            cell.is_data_current = true;
        }
        battery.cells[2].is_data_current = false;
        assert_eq!(battery.min_voltage(), Some(3300));
        assert_eq!(battery.max_voltage(), Some(3400));
        assert!(!battery.is_complete());
    }

    #[test]
    fn worst_temperature_needs_a_sensor() {
        let mut battery = Battery {
            index: 0,
            name: "test".into(),
            cells: (0..2).map(|i| Cell::new(0, i, i)).collect(),
        };
        battery.cells[0].temperature = 9000;
        battery.cells[0].is_data_current = true;
        // no temperature sensor: reading is garbage, must be ignored
        assert_eq!(battery.worst_temperature(), 0);
        battery.cells[1].capabilities.has_temperature_sensor = true;
        battery.cells[1].temperature = 4100;
        battery.cells[1].is_data_current = true;
        assert_eq!(battery.worst_temperature(), 4100);
    }
}
