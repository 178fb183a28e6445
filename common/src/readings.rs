use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
};

use crate::{
    address::DeviceAddress,
    error::{Error, Result},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub address: DeviceAddress,
    pub temperature_c: f32,
    /// Monotonic milliseconds at which the value was read off the bus.
    pub observed_at_ms: u64,
    /// The device answered with its power-on default rather than a fresh
    /// conversion.
    pub stale: bool,
}

impl Reading {
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.observed_at_ms)
    }

    /// The temperature, refused when it is a power-on default.
    pub fn checked_celsius(&self) -> Result<f32> {
        if self.stale {
            return Err(Error::StaleReading(self.address));
        }
        Ok(self.temperature_c)
    }
}

/// Immutable point-in-time copy of the table.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    readings: Arc<BTreeMap<DeviceAddress, Reading>>,
}

impl Snapshot {
    pub fn get(&self, address: &DeviceAddress) -> Option<&Reading> {
        self.readings.get(address)
    }

    /// Readings ordered by address.
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        self.readings.values()
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

#[derive(Debug, Default)]
struct Shared {
    current: Mutex<Arc<BTreeMap<DeviceAddress, Reading>>>,
}

impl Shared {
    fn load(&self) -> Arc<BTreeMap<DeviceAddress, Reading>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn modify(&self, change: impl FnOnce(&mut BTreeMap<DeviceAddress, Reading>)) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        // Clones the map only while a snapshot still holds the previous one.
        change(Arc::make_mut(&mut current));
    }
}

/// Latest reading per sensor. Only the poll loop holds this write handle;
/// everyone else gets a [`ReadingsView`].
#[derive(Debug, Default)]
pub struct ReadingsTable {
    shared: Arc<Shared>,
}

impl ReadingsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> ReadingsView {
        ReadingsView {
            shared: self.shared.clone(),
        }
    }

    /// Replaces whatever was stored for `reading.address`.
    pub fn update(&mut self, reading: Reading) {
        self.shared.modify(|readings| {
            readings.insert(reading.address, reading);
        });
    }

    /// Drops every entry whose address is not in `present`.
    pub fn retain(&mut self, present: &[DeviceAddress]) {
        self.shared
            .modify(|readings| readings.retain(|address, _| present.contains(address)));
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            readings: self.shared.load(),
        }
    }
}

/// Read-only handle for the HTTP and push side.
#[derive(Debug, Clone)]
pub struct ReadingsView {
    shared: Arc<Shared>,
}

impl ReadingsView {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            readings: self.shared.load(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
    };

    use super::*;

    fn address(tail: u8) -> DeviceAddress {
        DeviceAddress::from_parts(0x28, [tail, 0, 0, 0, 0, 0])
    }

    fn reading(tail: u8, temperature_c: f32, observed_at_ms: u64) -> Reading {
        Reading {
            address: address(tail),
            temperature_c,
            observed_at_ms,
            stale: false,
        }
    }

    #[test]
    fn stale_reading_is_refused_by_checked_celsius() {
        let fresh = reading(1, 20.0, 100);
        let stale = Reading {
            stale: true,
            ..reading(2, 85.0, 100)
        };

        assert_eq!(fresh.checked_celsius(), Ok(20.0));
        assert_eq!(stale.checked_celsius(), Err(Error::StaleReading(address(2))));
    }

    #[test]
    fn update_replaces_previous_entry() {
        let mut table = ReadingsTable::new();
        table.update(reading(1, 20.0, 100));
        table.update(reading(1, 21.0, 200));

        let snapshot = table.snapshot();

        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(&address(1)), Some(&reading(1, 21.0, 200)));
    }

    #[test]
    fn snapshot_is_not_affected_by_later_updates() {
        let mut table = ReadingsTable::new();
        let view = table.view();
        table.update(reading(1, 20.0, 100));

        let before = view.snapshot();
        table.update(reading(1, 30.0, 200));
        table.update(reading(2, 10.0, 200));

        assert_eq!(before.len(), 1);
        assert_eq!(before.get(&address(1)).unwrap().temperature_c, 20.0);
        assert_eq!(view.snapshot().len(), 2);
    }

    #[test]
    fn retain_removes_vanished_sensors_only() {
        let mut table = ReadingsTable::new();
        table.update(reading(1, 20.0, 100));
        table.update(reading(2, 21.0, 100));

        table.retain(&[address(2)]);

        let snapshot = table.snapshot();
        assert!(snapshot.get(&address(1)).is_none());
        assert!(snapshot.get(&address(2)).is_some());
    }

    #[test]
    fn iterates_in_address_order() {
        let mut table = ReadingsTable::new();
        table.update(reading(3, 1.0, 0));
        table.update(reading(1, 1.0, 0));
        table.update(reading(2, 1.0, 0));

        let order: Vec<_> = table.snapshot().iter().map(|r| r.address).collect();

        assert_eq!(order, vec![address(1), address(2), address(3)]);
    }

    #[test]
    fn concurrent_snapshots_never_observe_torn_readings() {
        let mut table = ReadingsTable::new();
        let view = table.view();
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let done = done.clone();
            thread::spawn(move || {
                let mut checked = 0_u64;
                while !done.load(Ordering::Relaxed) {
                    for reading in view.snapshot().iter() {
                        // Writer keeps temperature == observed_at / 10 and
                        // the address tail == observed_at % 4.
                        assert_eq!(reading.temperature_c, (reading.observed_at_ms / 10) as f32);
                        assert_eq!(
                            u64::from(reading.address.as_bytes()[1]),
                            reading.observed_at_ms % 4
                        );
                        checked += 1;
                    }
                }
                checked
            })
        };

        for tick in 0..20_000_u64 {
            let tail = (tick % 4) as u8;
            table.update(reading(tail, (tick / 10) as f32, tick));
        }
        done.store(true, Ordering::Relaxed);

        reader.join().expect("reader thread panicked");
    }
}
