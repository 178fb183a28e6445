use tracing::{debug, warn};

use crate::{
    address::DeviceAddress,
    error::{Error, Result},
};

pub const CMD_SEARCH_ROM: u8 = 0xF0;
pub const CMD_MATCH_ROM: u8 = 0x55;
pub const CMD_SKIP_ROM: u8 = 0xCC;

// One pass per device plus the final one; a noisy line could otherwise keep
// inventing branches forever.
const MAX_SEARCH_PASSES: usize = 128;

/// Slot-level access to the physical line.
///
/// Implementations own the electrical timing; everything above works in
/// whole bits.
pub trait OneWireLine {
    /// Reset pulse followed by the presence window. `Ok(true)` when at least
    /// one device pulled the line low.
    fn reset(&mut self) -> Result<bool>;

    fn write_bit(&mut self, bit: bool) -> Result<()>;

    fn read_bit(&mut self) -> Result<bool>;
}

pub struct OneWireBus<L> {
    line: L,
}

impl<L: OneWireLine> OneWireBus<L> {
    pub fn new(line: L) -> Self {
        Self { line }
    }

    pub fn line_mut(&mut self) -> &mut L {
        &mut self.line
    }

    pub fn reset(&mut self) -> Result<bool> {
        self.line.reset()
    }

    pub fn write_byte(&mut self, byte: u8) -> Result<()> {
        for bit in 0..8 {
            self.line.write_bit(byte & (1 << bit) != 0)?;
        }
        Ok(())
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let mut byte = 0_u8;
        for bit in 0..8 {
            if self.line.read_bit()? {
                byte |= 1 << bit;
            }
        }
        Ok(byte)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for byte in bytes {
            self.write_byte(*byte)?;
        }
        Ok(())
    }

    pub fn read_bytes(&mut self, buffer: &mut [u8]) -> Result<()> {
        for byte in buffer.iter_mut() {
            *byte = self.read_byte()?;
        }
        Ok(())
    }

    /// Reset and address a single device. Returns whether anything answered
    /// the reset.
    pub fn select(&mut self, address: &DeviceAddress) -> Result<bool> {
        if !self.reset()? {
            return Ok(false);
        }
        self.write_byte(CMD_MATCH_ROM)?;
        self.write_bytes(address.as_bytes())?;
        Ok(true)
    }

    /// Reset and address every device at once.
    pub fn skip_rom(&mut self) -> Result<bool> {
        if !self.reset()? {
            return Ok(false);
        }
        self.write_byte(CMD_SKIP_ROM)?;
        Ok(true)
    }

    /// Enumerates every device on the line.
    ///
    /// Each pass walks the 64 ROM bits of all still-participating devices in
    /// parallel: a `(0, 0)` answer is a discrepancy, resolved low first and
    /// high on a later pass. Addresses failing their CRC are dropped.
    ///
    /// An empty bus is only reported from the first pass. Losing the devices
    /// after that is a `BusFault`, never a shorter list.
    pub fn search(&mut self) -> Result<Vec<DeviceAddress>> {
        let mut found: Vec<DeviceAddress> = Vec::new();
        let mut rom = [0_u8; 8];
        // 1-based bit position of the last branch taken low; 0 = none left.
        let mut last_discrepancy = 0_usize;

        for pass in 0..MAX_SEARCH_PASSES {
            if !self.reset()? {
                if pass == 0 {
                    return Ok(found);
                }
                return Err(Error::BusFault("presence lost during search"));
            }
            self.write_byte(CMD_SEARCH_ROM)?;

            let mut last_zero = 0_usize;
            for position in 1..=64_usize {
                let id_bit = self.line.read_bit()?;
                let complement = self.line.read_bit()?;
                let byte = (position - 1) / 8;
                let mask = 1_u8 << ((position - 1) % 8);

                let direction = match (id_bit, complement) {
                    (true, true) if pass == 0 && position == 1 => {
                        debug!("presence pulse but no device joined the search");
                        return Ok(found);
                    }
                    (true, true) => {
                        warn!("one-wire search lost all devices at bit {position}");
                        return Err(Error::BusFault("devices dropped out of search"));
                    }
                    (false, true) => false,
                    (true, false) => true,
                    (false, false) => {
                        let direction = if position < last_discrepancy {
                            rom[byte] & mask != 0
                        } else {
                            position == last_discrepancy
                        };
                        if !direction {
                            last_zero = position;
                        }
                        direction
                    }
                };

                if direction {
                    rom[byte] |= mask;
                } else {
                    rom[byte] &= !mask;
                }
                self.line.write_bit(direction)?;
            }

            let address = DeviceAddress::new(rom);
            if !address.crc_valid() {
                debug!("dropping one-wire address {address} with bad crc");
            } else if !found.contains(&address) {
                found.push(address);
            }

            last_discrepancy = last_zero;
            if last_discrepancy == 0 {
                return Ok(found);
            }
        }

        Err(Error::BusFault("search did not converge"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::sim::{SimDevice, SimulatedLine};

    fn address(serial_tail: u8) -> DeviceAddress {
        DeviceAddress::from_parts(0x28, [serial_tail, 0x5A, 0x00, 0x10, 0x3C, 0x01])
    }

    fn bus_with(addresses: &[DeviceAddress]) -> OneWireBus<SimulatedLine> {
        let devices = addresses
            .iter()
            .map(|address| SimDevice::with_rom(*address.as_bytes(), 21.0))
            .collect();
        OneWireBus::new(SimulatedLine::new(devices))
    }

    #[test]
    fn search_finds_every_valid_device_once() {
        let expected = vec![address(0x01), address(0x02), address(0x80), address(0xFF)];
        let mut bus = bus_with(&expected);

        let found = bus.search().unwrap();

        assert_eq!(found.len(), expected.len());
        let found: BTreeSet<_> = found.into_iter().collect();
        let expected: BTreeSet<_> = expected.into_iter().collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn search_excludes_addresses_with_bad_crc() {
        let good = address(0x11);
        let mut bad = *address(0x12).as_bytes();
        bad[7] ^= 0xFF;
        let mut bus = OneWireBus::new(SimulatedLine::new(vec![
            SimDevice::with_rom(*good.as_bytes(), 20.0),
            SimDevice::with_rom(bad, 20.0),
        ]));

        let found = bus.search().unwrap();

        assert_eq!(found, vec![good]);
    }

    #[test]
    fn search_is_idempotent() {
        let mut bus = bus_with(&[address(0x21), address(0x22), address(0x23)]);

        let first: BTreeSet<_> = bus.search().unwrap().into_iter().collect();
        let second: BTreeSet<_> = bus.search().unwrap().into_iter().collect();

        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn search_on_empty_bus_is_empty() {
        let mut bus = OneWireBus::new(SimulatedLine::new(Vec::new()));
        assert!(bus.search().unwrap().is_empty());
    }

    #[test]
    fn addresses_sharing_long_prefixes_are_separated() {
        let a = DeviceAddress::from_parts(0x28, [0, 0, 0, 0, 0, 0]);
        let b = DeviceAddress::from_parts(0x28, [0, 0, 0, 0, 0, 0x80]);
        let c = DeviceAddress::from_parts(0x22, [0, 0, 0, 0, 0, 0]);
        let mut bus = bus_with(&[a, b, c]);

        let found: BTreeSet<_> = bus.search().unwrap().into_iter().collect();

        assert_eq!(found, BTreeSet::from([a, b, c]));
    }

    #[test]
    fn stuck_line_is_a_bus_fault() {
        let mut bus = bus_with(&[address(0x31)]);
        bus.line_mut().set_stuck(true);

        assert!(matches!(bus.search(), Err(Error::BusFault(_))));
        assert!(matches!(bus.reset(), Err(Error::BusFault(_))));

        bus.line_mut().set_stuck(false);
        assert_eq!(bus.search().unwrap(), vec![address(0x31)]);
    }

    #[test]
    fn missed_presence_mid_search_is_a_bus_fault() {
        let mut bus = bus_with(&[address(0x41), address(0x42)]);
        bus.line_mut().miss_presence_on_reset(2);

        assert_eq!(
            bus.search(),
            Err(Error::BusFault("presence lost during search"))
        );
        assert_eq!(bus.search().unwrap().len(), 2);
    }

    #[test]
    fn devices_vanishing_mid_pass_is_a_bus_fault() {
        let mut bus = bus_with(&[address(0x51), address(0x52)]);
        bus.line_mut().lose_devices_at_search_bit(20);

        assert_eq!(
            bus.search(),
            Err(Error::BusFault("devices dropped out of search"))
        );
        assert_eq!(bus.search().unwrap().len(), 2);
    }

    #[test]
    fn no_device_joining_the_first_bit_is_an_empty_bus() {
        let mut bus = bus_with(&[address(0x61)]);
        bus.line_mut().lose_devices_at_search_bit(0);

        assert!(bus.search().unwrap().is_empty());
    }

    /// Answers every reset and reads every bit as 0, so each search pass sees
    /// a discrepancy at every position.
    struct ChatteringLine;

    impl OneWireLine for ChatteringLine {
        fn reset(&mut self) -> Result<bool> {
            Ok(true)
        }

        fn write_bit(&mut self, _bit: bool) -> Result<()> {
            Ok(())
        }

        fn read_bit(&mut self) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn search_gives_up_when_branches_never_run_out() {
        let mut bus = OneWireBus::new(ChatteringLine);

        assert_eq!(
            bus.search(),
            Err(Error::BusFault("search did not converge"))
        );
    }

    #[test]
    fn select_reports_missing_presence() {
        let mut bus = OneWireBus::new(SimulatedLine::new(Vec::new()));
        assert!(!bus.select(&address(0x01)).unwrap());
        assert!(!bus.skip_rom().unwrap());
    }
}
