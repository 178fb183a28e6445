use tracing::{debug, info};

use crate::{
    address::{crc8, DeviceAddress},
    error::{Error, Result},
    onewire::{OneWireBus, OneWireLine},
};

pub const CMD_CONVERT_T: u8 = 0x44;
pub const CMD_READ_SCRATCHPAD: u8 = 0xBE;

/// Temperature register after power-up on the 1/16 °C parts (85.0 °C).
pub const POWER_ON_RAW: i16 = 0x0550;
/// Same for the DS18S20 at 1/2 °C.
const POWER_ON_RAW_S20: i16 = 0x00AA;

/// One-wire temperature sensor families this firmware knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFamily {
    Ds18s20,
    Ds1822,
    Ds18b20,
    Ds1825,
}

impl DeviceFamily {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x10 => Some(Self::Ds18s20),
            0x22 => Some(Self::Ds1822),
            0x28 => Some(Self::Ds18b20),
            0x3B => Some(Self::Ds1825),
            _ => None,
        }
    }

    pub fn of(address: &DeviceAddress) -> Option<Self> {
        Self::from_code(address.family_code())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ds18s20 => "DS18S20",
            Self::Ds1822 => "DS1822",
            Self::Ds18b20 => "DS18B20",
            Self::Ds1825 => "DS1825",
        }
    }

    pub fn decode(self, scratchpad: &Scratchpad) -> Temperature {
        let raw = scratchpad.raw_temperature();
        match self {
            Self::Ds18s20 => {
                let count_remain = f32::from(scratchpad.0[6]);
                let count_per_c = f32::from(scratchpad.0[7]);
                let whole = f32::from(raw >> 1);
                let celsius = if count_per_c > 0.0 {
                    whole - 0.25 + (count_per_c - count_remain) / count_per_c
                } else {
                    f32::from(raw) / 2.0
                };
                Temperature {
                    celsius,
                    power_on_default: raw == POWER_ON_RAW_S20,
                }
            }
            Self::Ds1822 | Self::Ds18b20 | Self::Ds1825 => {
                let masked = raw & scratchpad.resolution().undefined_bits_mask();
                Temperature {
                    celsius: f32::from(masked) / 16.0,
                    power_on_default: raw == POWER_ON_RAW,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Bits9,
    Bits10,
    Bits11,
    Bits12,
}

impl Resolution {
    /// Decodes the R1/R0 bits of the configuration register.
    pub fn from_config(config: u8) -> Self {
        match (config >> 5) & 0b11 {
            0b00 => Self::Bits9,
            0b01 => Self::Bits10,
            0b10 => Self::Bits11,
            _ => Self::Bits12,
        }
    }

    // Low bits are undefined below 12-bit resolution.
    fn undefined_bits_mask(self) -> i16 {
        match self {
            Self::Bits9 => !0b111,
            Self::Bits10 => !0b11,
            Self::Bits11 => !0b1,
            Self::Bits12 => !0,
        }
    }
}

/// The nine scratchpad bytes as read off the wire, CRC already verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scratchpad(pub [u8; 9]);

impl Scratchpad {
    pub fn raw_temperature(&self) -> i16 {
        i16::from_le_bytes([self.0[0], self.0[1]])
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::from_config(self.0[4])
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Temperature {
    pub celsius: f32,
    /// The register still holds the power-up value: no conversion has
    /// completed since the device was powered.
    pub power_on_default: bool,
}

/// The temperature sensors on one bus.
pub struct SensorSet<L> {
    bus: OneWireBus<L>,
    known: Vec<DeviceAddress>,
}

impl<L: OneWireLine> SensorSet<L> {
    pub fn new(bus: OneWireBus<L>) -> Self {
        Self {
            bus,
            known: Vec::new(),
        }
    }

    pub fn known(&self) -> &[DeviceAddress] {
        &self.known
    }

    pub fn bus_mut(&mut self) -> &mut OneWireBus<L> {
        &mut self.bus
    }

    /// Replaces the known set with the temperature sensors currently wired.
    pub fn rescan(&mut self) -> Result<&[DeviceAddress]> {
        let found = self.bus.search()?;
        let total = found.len();
        self.known = found
            .into_iter()
            .filter(|address| match DeviceFamily::of(address) {
                Some(family) => {
                    debug!("found {} at {address}", family.as_str());
                    true
                }
                None => {
                    debug!(
                        "ignoring one-wire device {address} (family 0x{:02x})",
                        address.family_code()
                    );
                    false
                }
            })
            .collect();
        info!(
            "one-wire scan: {} temperature sensor(s) of {} device(s)",
            self.known.len(),
            total
        );
        Ok(&self.known)
    }

    /// Starts a conversion on every device at once and returns without
    /// waiting for it. `Ok(false)` when nothing answered the reset.
    pub fn convert_all(&mut self) -> Result<bool> {
        if !self.bus.skip_rom()? {
            return Ok(false);
        }
        self.bus.write_byte(CMD_CONVERT_T)?;
        Ok(true)
    }

    pub fn read_scratchpad(&mut self, address: &DeviceAddress) -> Result<Scratchpad> {
        if !self.bus.select(address)? {
            return Err(Error::DeviceTimeout(*address));
        }
        self.bus.write_byte(CMD_READ_SCRATCHPAD)?;

        let mut bytes = [0_u8; 9];
        self.bus.read_bytes(&mut bytes)?;

        if bytes.iter().all(|byte| *byte == 0xFF) {
            return Err(Error::DeviceTimeout(*address));
        }
        if crc8(&bytes[..8]) != bytes[8] {
            return Err(Error::CrcMismatch(*address));
        }
        Ok(Scratchpad(bytes))
    }

    pub fn read_temperature(&mut self, address: &DeviceAddress) -> Result<Temperature> {
        let family = DeviceFamily::of(address).ok_or(Error::DeviceTimeout(*address))?;
        let scratchpad = self.read_scratchpad(address)?;
        Ok(family.decode(&scratchpad))
    }
}
