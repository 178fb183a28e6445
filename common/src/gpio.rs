//! Bit-banged one-wire line on an open-drain GPIO.

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin, OutputPin},
};

use crate::{
    error::{Error, Result},
    onewire::OneWireLine,
};

// Standard speed, in microseconds.
const RESET_LOW_US: u32 = 480;
const PRESENCE_SAMPLE_US: u32 = 70;
const PRESENCE_RECOVERY_US: u32 = 410;
const WRITE_ONE_LOW_US: u32 = 6;
const WRITE_ONE_RELEASE_US: u32 = 64;
const WRITE_ZERO_LOW_US: u32 = 60;
const WRITE_ZERO_RELEASE_US: u32 = 10;
const READ_LOW_US: u32 = 2;
const READ_SAMPLE_US: u32 = 9;
const READ_RECOVERY_US: u32 = 55;

const IDLE_POLL_US: u32 = 10;
const IDLE_TIMEOUT_US: u32 = 250;

/// `OneWireLine` over a pin configured as open-drain with a pull-up, so
/// driving it high releases the line.
pub struct GpioLine<P, D> {
    pin: P,
    delay: D,
}

impl<P, D> GpioLine<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    pub fn new(pin: P, delay: D) -> Self {
        Self { pin, delay }
    }

    pub fn release(self) -> (P, D) {
        (self.pin, self.delay)
    }

    fn drive_low(&mut self) -> Result<()> {
        self.pin
            .set_low()
            .map_err(|_| Error::BusFault("gpio write failed"))
    }

    fn let_go(&mut self) -> Result<()> {
        self.pin
            .set_high()
            .map_err(|_| Error::BusFault("gpio write failed"))
    }

    fn sample(&mut self) -> Result<bool> {
        self.pin
            .is_high()
            .map_err(|_| Error::BusFault("gpio read failed"))
    }

    fn wait_idle(&mut self) -> Result<()> {
        let mut waited = 0;
        while !self.sample()? {
            if waited >= IDLE_TIMEOUT_US {
                return Err(Error::BusFault("line held low"));
            }
            self.delay.delay_us(IDLE_POLL_US);
            waited += IDLE_POLL_US;
        }
        Ok(())
    }
}

impl<P, D> OneWireLine for GpioLine<P, D>
where
    P: InputPin + OutputPin,
    D: DelayNs,
{
    fn reset(&mut self) -> Result<bool> {
        self.let_go()?;
        self.wait_idle()?;

        critical_section::with(|_| {
            self.drive_low()?;
            self.delay.delay_us(RESET_LOW_US);
            self.let_go()?;
            self.delay.delay_us(PRESENCE_SAMPLE_US);
            let present = !self.sample()?;
            self.delay.delay_us(PRESENCE_RECOVERY_US);

            if !self.sample()? {
                return Err(Error::BusFault("line did not release after presence"));
            }
            Ok(present)
        })
    }

    fn write_bit(&mut self, bit: bool) -> Result<()> {
        let (low_us, release_us) = if bit {
            (WRITE_ONE_LOW_US, WRITE_ONE_RELEASE_US)
        } else {
            (WRITE_ZERO_LOW_US, WRITE_ZERO_RELEASE_US)
        };

        critical_section::with(|_| {
            self.drive_low()?;
            self.delay.delay_us(low_us);
            self.let_go()?;
            self.delay.delay_us(release_us);
            Ok(())
        })
    }

    fn read_bit(&mut self) -> Result<bool> {
        critical_section::with(|_| {
            self.drive_low()?;
            self.delay.delay_us(READ_LOW_US);
            self.let_go()?;
            self.delay.delay_us(READ_SAMPLE_US - READ_LOW_US);
            let bit = self.sample()?;
            self.delay.delay_us(READ_RECOVERY_US);
            Ok(bit)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use embedded_hal::digital::{ErrorKind, ErrorType};

    use super::*;

    #[derive(Debug)]
    struct PinFault;

    impl embedded_hal::digital::Error for PinFault {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    /// Replays scripted levels; an exhausted script reads as released.
    #[derive(Default)]
    struct ScriptedPin {
        levels: VecDeque<bool>,
        stuck_low: bool,
        broken: bool,
        driven: Vec<bool>,
    }

    impl ScriptedPin {
        fn with_levels(levels: &[bool]) -> Self {
            Self {
                levels: levels.iter().copied().collect(),
                ..Self::default()
            }
        }
    }

    impl ErrorType for ScriptedPin {
        type Error = PinFault;
    }

    impl InputPin for ScriptedPin {
        fn is_high(&mut self) -> core::result::Result<bool, PinFault> {
            if self.broken {
                return Err(PinFault);
            }
            if self.stuck_low {
                return Ok(false);
            }
            Ok(self.levels.pop_front().unwrap_or(true))
        }

        fn is_low(&mut self) -> core::result::Result<bool, PinFault> {
            self.is_high().map(|high| !high)
        }
    }

    impl OutputPin for ScriptedPin {
        fn set_low(&mut self) -> core::result::Result<(), PinFault> {
            if self.broken {
                return Err(PinFault);
            }
            self.driven.push(false);
            Ok(())
        }

        fn set_high(&mut self) -> core::result::Result<(), PinFault> {
            if self.broken {
                return Err(PinFault);
            }
            self.driven.push(true);
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingDelay {
        total_ns: u64,
    }

    impl DelayNs for CountingDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.total_ns += u64::from(ns);
        }
    }

    fn line(pin: ScriptedPin) -> GpioLine<ScriptedPin, CountingDelay> {
        GpioLine::new(pin, CountingDelay::default())
    }

    #[test]
    fn reset_detects_presence_pulse() {
        // idle check, presence sample, release check
        let mut line = line(ScriptedPin::with_levels(&[true, false, true]));
        assert!(line.reset().unwrap());

        let (pin, delay) = line.release();
        assert_eq!(pin.driven, vec![true, false, true]);
        assert!(delay.total_ns >= 960_000);
    }

    #[test]
    fn reset_without_devices_reports_absence() {
        let mut line = line(ScriptedPin::with_levels(&[true, true, true]));
        assert!(!line.reset().unwrap());
    }

    #[test]
    fn stuck_low_line_is_a_bus_fault() {
        let mut line = line(ScriptedPin {
            stuck_low: true,
            ..ScriptedPin::default()
        });
        assert_eq!(line.reset(), Err(Error::BusFault("line held low")));
    }

    #[test]
    fn line_that_never_releases_after_presence_faults() {
        let mut line = line(ScriptedPin::with_levels(&[true, false, false]));
        assert!(matches!(line.reset(), Err(Error::BusFault(_))));
    }

    #[test]
    fn both_write_slots_fill_a_full_time_slot() {
        let mut one = line(ScriptedPin::default());
        one.write_bit(true).unwrap();
        let mut zero = line(ScriptedPin::default());
        zero.write_bit(false).unwrap();

        let (_, one_delay) = one.release();
        let (_, zero_delay) = zero.release();
        assert_eq!(one_delay.total_ns, 70_000);
        assert_eq!(zero_delay.total_ns, 70_000);
    }

    #[test]
    fn read_slot_samples_the_line() {
        let mut line = line(ScriptedPin::with_levels(&[false, true]));
        assert!(!line.read_bit().unwrap());
        assert!(line.read_bit().unwrap());
    }

    #[test]
    fn pin_errors_map_to_bus_fault() {
        let mut line = line(ScriptedPin {
            broken: true,
            ..ScriptedPin::default()
        });
        assert!(matches!(line.write_bit(true), Err(Error::BusFault(_))));
        assert!(matches!(line.read_bit(), Err(Error::BusFault(_))));
    }
}
