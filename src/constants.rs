//! Protocol constants for slave-bus communication.
//!
//! This module defines the wire bytes, timing parameters and safety
//! thresholds used by the pack controller. Voltages are millivolts,
//! currents milliamps, temperatures hundredths of a degree Celsius
//! unless noted otherwise.

/// Frame start marker, never emitted escaped
pub const START_BYTE: u8 = 0xFE;

/// Escape byte; the byte following it is taken literally
pub const ESCAPE_BYTE: u8 = 0xFF;

/// Reset command
pub const CMD_RESET: u8 = b'r';

/// Full status query
pub const CMD_FULL_STATUS: u8 = b'/';

/// Summary status query
pub const CMD_SUMMARY: u8 = b's';

/// Version query
pub const CMD_VERSION: u8 = b'?';

/// Base of the set-shunt-level commands; level is added to this
pub const CMD_SHUNT_BASE: u8 = 0x30;

/// Granularity of the shunt current ladder in mA
pub const SHUNT_STEP_MA: u16 = 50;

/// Smallest non-zero shunt current the slaves respond to
pub const SHUNT_MIN_MA: u16 = 150;

/// Largest shunt current a slave can sink
pub const SHUNT_MAX_MA: u16 = 450;

/// Baud rate of the shared slave bus
pub const BAUD_RATE: u32 = 9600;

/// One read timeout slice
pub const READ_SLICE_MS: u64 = 200;

/// Number of timeout slices per read budget (about a 1 s ceiling)
pub const READ_SLICES: usize = 5;

/// Pause between transmitted bytes; slaves drop back-to-back bytes
pub const WRITE_PACING_MS: u64 = 2;

/// Attempts per poll before a cell is counted as failed
pub const POLL_ATTEMPTS: usize = 2;

/// Attempts before version negotiation gives up on a cell
pub const NEGOTIATE_ATTEMPTS: usize = 3;

/// Polls waiting for a commanded shunt current to be reported back
pub const ACTUATION_ATTEMPTS: usize = 20;

/// Settle time after power-cycling the bus rail
pub const RAIL_SETTLE_MS: u64 = 1000;

/// Settle time after waking power-saved slaves
pub const WAKE_SETTLE_MS: u64 = 500;

/// Sleep intervals at or above this may let slaves power-save
pub const WAKE_THRESHOLD_MS: u64 = 3000;

/// Settle time after changing any shunt state, before re-reading
pub const SHUNT_SETTLE_MS: u64 = 300;

/// Resistor shunts are switched off only every this many cycles
pub const RESISTOR_SHUNT_PERIOD: u32 = 5;

/// Charger may re-enable below this maximum cell voltage
pub const CHARGER_RESUME_MV: u16 = 3450;

/// Charger turns off above this maximum cell voltage
pub const CHARGER_OFF_MV: u16 = 3650;

/// Charge terminates once the minimum cell voltage passes this
pub const END_OF_CHARGE_MV: u16 = 3500;

/// Current above this (amps, negative while charging) counts as tapered
pub const END_OF_CHARGE_AMPS: f64 = -4.0;

/// Current above this while the relay is on counts as a collapse
pub const COLLAPSE_AMPS: f64 = -3.0;

/// How long a current collapse must persist before turning off
pub const COLLAPSE_SECS: u64 = 10;

/// Relay settle time before current collapse is evaluated at all
pub const RELAY_SETTLE_SECS: u64 = 30;

/// No fully-valid dataset for this long forces the charger off
pub const STALE_DATA_SECS: u64 = 150;

/// Cooldown before a non-latched shutdown may re-arm
pub const REARM_COOLDOWN_SECS: u64 = 30 * 60;

/// Off periods longer than this ask the orchestrator to poll slower
pub const SLOW_POLL_AFTER_OFF_SECS: u64 = 2 * 60;

/// Master-board temperature limit
pub const BOOT_OVER_TEMP: u16 = 7500;

/// Shunt resistor temperature limit
pub const SHUNT_OVER_TEMP: u16 = 8500;

/// Pack discharge above this (amps) means the vehicle is being driven
pub const DRIVING_AMPS: f64 = 5.0;

/// Poll delay while driving
pub const DRIVING_POLL_MS: u64 = 1000;

/// Grace period after discharge stops before the delay relaxes back
pub const DRIVING_GRACE_SECS: u64 = 60;

/// SOC snapshots older than this are an upstream error
pub const SOC_STALE_SECS: u64 = 5;
