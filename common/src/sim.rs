//! Bit-level stand-in for a one-wire line with DS18B20-style devices on it.
//!
//! Used by the host build in place of a GPIO pin and by the tests. Devices
//! answer the real ROM and function commands, so everything above
//! [`OneWireLine`] runs unmodified against it.

use crate::{
    address::{crc8, DeviceAddress},
    error::{Error, Result},
    onewire::{OneWireLine, CMD_MATCH_ROM, CMD_SEARCH_ROM, CMD_SKIP_ROM},
    sensors::{CMD_CONVERT_T, CMD_READ_SCRATCHPAD, POWER_ON_RAW},
};

#[derive(Debug, Clone)]
pub struct SimDevice {
    rom: [u8; 8],
    celsius: f32,
    wobble_c: f32,
    conversions: u32,
    raw: i16,
    config: u8,
    corrupt_scratchpad: bool,
    silent: bool,
    selected: bool,
}

impl SimDevice {
    pub fn ds18b20(serial: [u8; 6], celsius: f32) -> Self {
        Self::with_rom(*DeviceAddress::from_parts(0x28, serial).as_bytes(), celsius)
    }

    /// A device with an arbitrary ROM code, CRC included or not.
    pub fn with_rom(rom: [u8; 8], celsius: f32) -> Self {
        Self {
            rom,
            celsius,
            wobble_c: 0.0,
            conversions: 0,
            raw: POWER_ON_RAW,
            config: 0x7F,
            corrupt_scratchpad: false,
            silent: false,
            selected: false,
        }
    }

    /// Each conversion lands somewhere within `±wobble_c` of the set point.
    pub fn with_wobble(mut self, wobble_c: f32) -> Self {
        self.wobble_c = wobble_c;
        self
    }

    pub fn address(&self) -> DeviceAddress {
        DeviceAddress::new(self.rom)
    }

    pub fn set_celsius(&mut self, celsius: f32) {
        self.celsius = celsius;
    }

    pub fn set_corrupt_scratchpad(&mut self, corrupt: bool) {
        self.corrupt_scratchpad = corrupt;
    }

    /// A silent device still answers reset and search but never drives the
    /// line while its scratchpad is being read.
    pub fn set_silent(&mut self, silent: bool) {
        self.silent = silent;
    }

    fn convert(&mut self) {
        let offset = if self.wobble_c == 0.0 {
            0.0
        } else {
            self.wobble_c * ((self.conversions % 8) as f32 / 4.0 - 1.0)
        };
        self.conversions = self.conversions.wrapping_add(1);
        self.raw = ((self.celsius + offset) * 16.0).round() as i16;
    }

    fn scratchpad(&self) -> [u8; 9] {
        let [lsb, msb] = self.raw.to_le_bytes();
        let mut pad = [lsb, msb, 0x4B, 0x46, self.config, 0xFF, 0x0C, 0x10, 0];
        pad[8] = crc8(&pad[..8]);
        if self.corrupt_scratchpad {
            pad[0] ^= 0x01;
        }
        pad
    }

    fn rom_bit(&self, index: usize) -> bool {
        self.rom[index / 8] & (1 << (index % 8)) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchStep {
    Id,
    Complement,
    Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    RomCommand { value: u8, bits: u8 },
    Search { position: usize, step: SearchStep },
    MatchRom { rom: [u8; 8], bits: usize },
    Function { value: u8, bits: u8 },
    ReadScratchpad { bit: usize },
}

#[derive(Debug, Clone)]
pub struct SimulatedLine {
    devices: Vec<SimDevice>,
    phase: Phase,
    stuck: bool,
    resets: u64,
    conversions: u64,
    // One-shot faults.
    missed_presence_at: Option<u64>,
    search_dropout_at: Option<usize>,
}

impl SimulatedLine {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        Self {
            devices,
            phase: Phase::Idle,
            stuck: false,
            resets: 0,
            conversions: 0,
            missed_presence_at: None,
            search_dropout_at: None,
        }
    }

    /// Holds the line low, as a shorted data wire would.
    pub fn set_stuck(&mut self, stuck: bool) {
        self.stuck = stuck;
    }

    /// The `nth` reset from now (1 = the next one) sees no presence pulse,
    /// as if the pulse were lost to noise.
    pub fn miss_presence_on_reset(&mut self, nth: u64) {
        self.missed_presence_at = Some(self.resets + nth);
    }

    /// The next search pass to reach ROM bit `bit` (0-based) finds every
    /// device gone quiet, so the line floats high for both reads.
    pub fn lose_devices_at_search_bit(&mut self, bit: usize) {
        self.search_dropout_at = Some(bit);
    }

    pub fn attach(&mut self, device: SimDevice) {
        self.devices.push(device);
    }

    pub fn detach(&mut self, address: &DeviceAddress) -> Option<SimDevice> {
        let index = self
            .devices
            .iter()
            .position(|device| device.address() == *address)?;
        Some(self.devices.remove(index))
    }

    pub fn device_mut(&mut self, address: &DeviceAddress) -> Option<&mut SimDevice> {
        self.devices
            .iter_mut()
            .find(|device| device.address() == *address)
    }

    /// Broadcast or addressed CONVERT T commands seen so far.
    pub fn conversions(&self) -> u64 {
        self.conversions
    }

    fn selected(&self) -> impl Iterator<Item = &SimDevice> {
        self.devices.iter().filter(|device| device.selected)
    }

    fn rom_command_phase(command: u8) -> Phase {
        match command {
            CMD_SEARCH_ROM => Phase::Search {
                position: 0,
                step: SearchStep::Id,
            },
            CMD_MATCH_ROM => Phase::MatchRom {
                rom: [0; 8],
                bits: 0,
            },
            CMD_SKIP_ROM => Phase::Function { value: 0, bits: 0 },
            _ => Phase::Idle,
        }
    }

    fn on_function_command(&mut self, command: u8) -> Phase {
        match command {
            CMD_CONVERT_T => {
                self.conversions += 1;
                for device in self.devices.iter_mut().filter(|device| device.selected) {
                    device.convert();
                }
                Phase::Idle
            }
            CMD_READ_SCRATCHPAD => Phase::ReadScratchpad { bit: 0 },
            _ => Phase::Idle,
        }
    }
}

impl OneWireLine for SimulatedLine {
    fn reset(&mut self) -> Result<bool> {
        if self.stuck {
            return Err(Error::BusFault("line held low"));
        }
        self.resets += 1;
        if self.missed_presence_at == Some(self.resets) {
            self.missed_presence_at = None;
            self.phase = Phase::Idle;
            return Ok(false);
        }
        for device in &mut self.devices {
            device.selected = true;
        }
        self.phase = Phase::RomCommand { value: 0, bits: 0 };
        Ok(!self.devices.is_empty())
    }

    fn write_bit(&mut self, bit: bool) -> Result<()> {
        if self.stuck {
            return Err(Error::BusFault("line held low"));
        }

        self.phase = match self.phase {
            Phase::RomCommand { mut value, bits } => {
                value |= u8::from(bit) << bits;
                if bits == 7 {
                    Self::rom_command_phase(value)
                } else {
                    Phase::RomCommand {
                        value,
                        bits: bits + 1,
                    }
                }
            }
            Phase::Search {
                position,
                step: SearchStep::Direction,
            } => {
                for device in &mut self.devices {
                    if device.rom_bit(position) != bit {
                        device.selected = false;
                    }
                }
                if position == 63 {
                    Phase::Idle
                } else {
                    Phase::Search {
                        position: position + 1,
                        step: SearchStep::Id,
                    }
                }
            }
            Phase::MatchRom { mut rom, bits } => {
                if bit {
                    rom[bits / 8] |= 1 << (bits % 8);
                }
                if bits == 63 {
                    for device in &mut self.devices {
                        device.selected = device.rom == rom;
                    }
                    Phase::Function { value: 0, bits: 0 }
                } else {
                    Phase::MatchRom {
                        rom,
                        bits: bits + 1,
                    }
                }
            }
            Phase::Function { mut value, bits } => {
                value |= u8::from(bit) << bits;
                if bits == 7 {
                    self.on_function_command(value)
                } else {
                    Phase::Function {
                        value,
                        bits: bits + 1,
                    }
                }
            }
            // A write where the devices expect to talk ends the transaction.
            Phase::Search { .. } | Phase::ReadScratchpad { .. } | Phase::Idle => Phase::Idle,
        };
        Ok(())
    }

    fn read_bit(&mut self) -> Result<bool> {
        if self.stuck {
            return Err(Error::BusFault("line held low"));
        }

        if let Phase::Search {
            position,
            step: SearchStep::Id,
        } = self.phase
        {
            if self.search_dropout_at == Some(position) {
                self.search_dropout_at = None;
                for device in &mut self.devices {
                    device.selected = false;
                }
            }
        }

        // Wired-AND: any device driving a 0 wins, an undriven line reads 1.
        let (level, next) = match self.phase {
            Phase::Search {
                position,
                step: SearchStep::Id,
            } => (
                self.selected().all(|device| device.rom_bit(position)),
                Phase::Search {
                    position,
                    step: SearchStep::Complement,
                },
            ),
            Phase::Search {
                position,
                step: SearchStep::Complement,
            } => (
                self.selected().all(|device| !device.rom_bit(position)),
                Phase::Search {
                    position,
                    step: SearchStep::Direction,
                },
            ),
            Phase::ReadScratchpad { bit } => {
                let level = self
                    .selected()
                    .filter(|device| !device.silent)
                    .all(|device| device.scratchpad()[bit / 8] & (1 << (bit % 8)) != 0);
                let next = if bit == 71 {
                    Phase::Idle
                } else {
                    Phase::ReadScratchpad { bit: bit + 1 }
                };
                (level, next)
            }
            phase => (true, phase),
        };

        self.phase = next;
        Ok(level)
    }
}
