use thiserror::Error;

use crate::address::DeviceAddress;

/// Faults raised by the bus, the sensors and the outbound collaborators.
///
/// None of these cross a poll cycle boundary: the scheduler turns each one
/// into a skip-and-continue decision.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Electrical or timing failure on the line. Aborts the current cycle.
    #[error("one-wire bus fault: {0}")]
    BusFault(&'static str),

    /// A payload read from this device failed its CRC check.
    #[error("crc mismatch reading {0}")]
    CrcMismatch(DeviceAddress),

    /// The addressed device stopped responding mid-transaction.
    #[error("device {0} did not respond")]
    DeviceTimeout(DeviceAddress),

    /// Network join or outbound push failed.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The device reported its power-on default instead of a conversion result.
    #[error("reading from {0} is the power-on default value")]
    StaleReading(DeviceAddress),
}

pub type Result<T> = std::result::Result<T, Error>;
