//! Error types for slave-bus and charger-control operations.

use thiserror::Error;

/// Result type alias for pack monitor operations.
pub type Result<T> = std::result::Result<T, BmsError>;

/// Error types for the battery pack controller.
#[derive(Error, Debug)]
pub enum BmsError {
    /// Serial port communication error
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No start marker found, or the frame ended inside an escape sequence
    #[error("Framing error: {0}")]
    Framing(&'static str),

    /// CRC of a decoded frame did not match
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Integrity {
        /// CRC computed over the decoded payload
        expected: u16,
        /// CRC carried in the frame
        actual: u16,
    },

    /// A reply arrived from a node other than the one addressed
    #[error("Reply from wrong cell: sent to {expected}, answered by {actual}")]
    AddressMismatch {
        /// Cell id the command was sent to
        expected: u16,
        /// Cell id carried in the reply
        actual: u16,
    },

    /// Not enough bytes arrived within the read budget
    #[error("Timeout: wanted {wanted} bytes, got {got}")]
    Timeout {
        /// Bytes required to complete the frame
        wanted: usize,
        /// Bytes actually collected
        got: usize,
    },

    /// Cell has never successfully negotiated a protocol version
    #[error("Cell {cell} protocol version unknown")]
    VersionUnknown {
        /// Cell id
        cell: u16,
    },

    /// Commanded shunt current was not reached after bounded retries
    #[error("Cell {cell} did not reach {target_ma} mA (stuck at {actual_ma} mA)")]
    Actuation {
        /// Cell id
        cell: u16,
        /// Commanded shunt current in mA
        target_ma: u16,
        /// Last reported shunt current in mA
        actual_ma: u16,
    },

    /// State-of-charge subsystem is stale or erroring
    #[error("State of charge subsystem error")]
    UpstreamSubsystem,

    /// A monitored temperature is over its limit
    #[error("Thermal limit exceeded: {0}")]
    ThermalLimit(&'static str),

    /// Fewer valid cell readings than cells this cycle
    #[error("Incomplete cell data: {valid} of {expected} cells")]
    DataCompleteness {
        /// Cells with current data
        valid: usize,
        /// Cells configured
        expected: usize,
    },

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),
}
