use core::{fmt, str::FromStr};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Dallas/Maxim CRC-8 (x^8 + x^5 + x^4 + 1), LSB first.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0_u8;
    for byte in data {
        let mut byte = *byte;
        for _ in 0..8 {
            let mix = (crc ^ byte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            byte >>= 1;
        }
    }
    crc
}

/// 64-bit ROM code of a one-wire device: family code, 48-bit serial, CRC.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress([u8; 8]);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddressError;

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("device address must be 16 hex characters")
    }
}

impl std::error::Error for ParseAddressError {}

impl DeviceAddress {
    pub const fn new(rom: [u8; 8]) -> Self {
        Self(rom)
    }

    /// Builds an address whose trailing byte is the CRC of the first seven.
    pub fn from_parts(family: u8, serial: [u8; 6]) -> Self {
        let mut rom = [0_u8; 8];
        rom[0] = family;
        rom[1..7].copy_from_slice(&serial);
        rom[7] = crc8(&rom[..7]);
        Self(rom)
    }

    pub fn family_code(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn crc_valid(&self) -> bool {
        crc8(&self.0[..7]) == self.0[7]
    }

    /// Bit `index` (0..64) in transmission order.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (1 << (index % 8)) != 0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddress({self})")
    }
}

impl FromStr for DeviceAddress {
    type Err = ParseAddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        if value.len() != 16 || !value.is_ascii() {
            return Err(ParseAddressError);
        }

        let mut rom = [0_u8; 8];
        for (index, byte) in rom.iter_mut().enumerate() {
            let pair = &value[index * 2..index * 2 + 2];
            *byte = u8::from_str_radix(pair, 16).map_err(|_| ParseAddressError)?;
        }
        Ok(Self(rom))
    }
}

impl Serialize for DeviceAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DeviceAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}
