use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    address::DeviceAddress,
    config::{PollConfig, PowerOnPolicy},
    error::Error,
    onewire::OneWireLine,
    ports::{ClockSync, Pusher},
    readings::{Reading, ReadingsTable, ReadingsView},
    sensors::SensorSet,
};

// Longest stretch the loop sleeps without looking at the shutdown flag.
const SHUTDOWN_POLL_MS: u64 = 100;

pub trait Clock {
    /// Monotonic milliseconds since some fixed point.
    fn now_ms(&self) -> u64;

    fn sleep_ms(&mut self, ms: u64);
}

#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }

    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// A recurring duty. Due immediately after construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    interval_ms: u64,
    next_due_ms: u64,
}

impl Cadence {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            next_due_ms: 0,
        }
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms >= self.next_due_ms
    }

    pub fn next_due_ms(&self) -> u64 {
        self.next_due_ms
    }

    pub fn reschedule(&mut self, now_ms: u64) {
        self.retry_after(now_ms, self.interval_ms);
    }

    pub fn retry_after(&mut self, now_ms: u64, delay_ms: u64) {
        self.next_due_ms = now_ms.saturating_add(delay_ms);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Converting,
    Reading,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub updated: Vec<DeviceAddress>,
    /// Stored with the stale flag set.
    pub flagged: Vec<DeviceAddress>,
    /// Power-on defaults dropped under [`PowerOnPolicy::Suppress`].
    pub suppressed: Vec<DeviceAddress>,
    pub skipped: Vec<(DeviceAddress, Error)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    NotDue,
    /// Nothing answered the reset or no temperature sensor is known.
    NoDevices,
    Completed(CycleReport),
    /// A bus fault ended the cycle early; readings taken before it stand.
    Aborted(Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Duty {
    NotDue,
    Skipped,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    /// Known sensor count when a rescan ran this tick.
    pub rescanned: Option<usize>,
    pub cycle: CycleOutcome,
    pub push: Duty,
    pub resync: Duty,
}

/// Drives the bus: the only writer of the readings table and the only
/// caller into the sensors.
pub struct PollScheduler<L> {
    sensors: SensorSet<L>,
    table: ReadingsTable,
    config: PollConfig,
    pusher: Box<dyn Pusher + Send>,
    clock_sync: Box<dyn ClockSync + Send>,
    phase: PollPhase,
    read: Cadence,
    rescan: Cadence,
    push: Cadence,
    resync: Cadence,
    // Wait before the next resync attempt after a failure; doubles per failure.
    resync_backoff_ms: u64,
}

impl<L: OneWireLine> PollScheduler<L> {
    pub fn new(
        sensors: SensorSet<L>,
        table: ReadingsTable,
        config: PollConfig,
        pusher: Box<dyn Pusher + Send>,
        clock_sync: Box<dyn ClockSync + Send>,
    ) -> Self {
        Self {
            read: Cadence::new(config.read_interval_ms),
            rescan: Cadence::new(config.rescan_interval_ms),
            push: Cadence::new(config.push_interval_ms),
            resync: Cadence::new(config.resync_interval_ms),
            resync_backoff_ms: config.read_interval_ms,
            sensors,
            table,
            config,
            pusher,
            clock_sync,
            phase: PollPhase::Idle,
        }
    }

    pub fn phase(&self) -> PollPhase {
        self.phase
    }

    pub fn view(&self) -> ReadingsView {
        self.table.view()
    }

    pub fn sensors_mut(&mut self) -> &mut SensorSet<L> {
        &mut self.sensors
    }

    /// Runs every duty that is due. Never fails: faults are logged, reported
    /// and retried on the next cadence.
    pub fn tick<C: Clock>(&mut self, clock: &mut C) -> TickReport {
        let mut rescanned = None;

        let now_ms = clock.now_ms();
        let cycle = if self.read.is_due(now_ms) {
            self.read.reschedule(now_ms);
            self.run_cycle(clock, &mut rescanned)
        } else {
            CycleOutcome::NotDue
        };

        let now_ms = clock.now_ms();
        let push = self.run_push(now_ms);
        let resync = self.run_resync(now_ms);

        TickReport {
            rescanned,
            cycle,
            push,
            resync,
        }
    }

    /// Ticks until `shutdown` is set. The flag is only looked at between
    /// ticks, so a transaction in flight always completes.
    pub fn run<C: Clock>(&mut self, clock: &mut C, shutdown: &AtomicBool) {
        info!(
            "poll loop started (read every {}ms, push every {}ms)",
            self.config.read_interval_ms, self.config.push_interval_ms
        );

        while !shutdown.load(Ordering::Relaxed) {
            let report = self.tick(clock);
            debug!("poll tick: {report:?}");

            let mut remaining = self.config.tick_interval_ms;
            while remaining > 0 && !shutdown.load(Ordering::Relaxed) {
                let slice = remaining.min(SHUTDOWN_POLL_MS);
                clock.sleep_ms(slice);
                remaining -= slice;
            }
        }

        info!("poll loop stopped");
    }

    fn run_cycle<C: Clock>(
        &mut self,
        clock: &mut C,
        rescanned: &mut Option<usize>,
    ) -> CycleOutcome {
        let started_ms = clock.now_ms();

        if self.rescan.is_due(started_ms) || self.sensors.known().is_empty() {
            match self.sensors.rescan() {
                Ok(known) => {
                    let known = known.to_vec();
                    self.table.retain(&known);
                    self.rescan.reschedule(started_ms);
                    *rescanned = Some(known.len());
                }
                Err(err) => return self.abort(err),
            }
        }

        if self.sensors.known().is_empty() {
            return CycleOutcome::NoDevices;
        }

        self.phase = PollPhase::Converting;
        match self.sensors.convert_all() {
            Ok(true) => {}
            Ok(false) => {
                debug!("no presence on convert, skipping read");
                self.phase = PollPhase::Idle;
                return CycleOutcome::NoDevices;
            }
            Err(err) => return self.abort(err),
        }
        clock.sleep_ms(self.config.conversion_latency_ms);

        self.phase = PollPhase::Reading;
        let mut report = CycleReport::default();
        let known = self.sensors.known().to_vec();

        for address in known {
            match self.sensors.read_temperature(&address) {
                Ok(temperature) => {
                    let stale = temperature.power_on_default;
                    if stale {
                        match self.config.power_on_policy {
                            PowerOnPolicy::Flag => report.flagged.push(address),
                            PowerOnPolicy::Suppress => {
                                debug!("suppressing power-on value from {address}");
                                report.suppressed.push(address);
                                continue;
                            }
                        }
                    }

                    debug!("{address}: {:.4}°C", temperature.celsius);
                    self.table.update(Reading {
                        address,
                        temperature_c: temperature.celsius,
                        observed_at_ms: clock.now_ms(),
                        stale,
                    });
                    report.updated.push(address);
                }
                Err(err @ (Error::CrcMismatch(_) | Error::DeviceTimeout(_))) => {
                    warn!("skipping sensor this cycle: {err}");
                    report.skipped.push((address, err));
                }
                Err(err) => return self.abort(err),
            }
        }

        self.phase = PollPhase::Idle;
        CycleOutcome::Completed(report)
    }

    fn abort(&mut self, err: Error) -> CycleOutcome {
        warn!("poll cycle aborted: {err}");
        self.phase = PollPhase::Idle;
        CycleOutcome::Aborted(err)
    }

    fn run_push(&mut self, now_ms: u64) -> Duty {
        if !self.push.is_due(now_ms) {
            return Duty::NotDue;
        }
        self.push.reschedule(now_ms);

        let snapshot = self.table.snapshot();
        if snapshot.is_empty() {
            info!("no sensor data to push");
            return Duty::Skipped;
        }

        match self.pusher.push(&snapshot) {
            Ok(()) => Duty::Succeeded,
            Err(err) => {
                warn!("push failed: {err}");
                Duty::Failed
            }
        }
    }

    fn run_resync(&mut self, now_ms: u64) -> Duty {
        if !self.resync.is_due(now_ms) {
            return Duty::NotDue;
        }

        match self.clock_sync.resync() {
            Ok(()) => {
                self.resync.reschedule(now_ms);
                self.resync_backoff_ms = self.config.read_interval_ms;
                Duty::Succeeded
            }
            Err(err) => {
                let delay_ms = self.resync_backoff_ms;
                warn!("clock resync failed, retrying in {delay_ms}ms: {err}");
                self.resync.retry_after(now_ms, delay_ms);
                self.resync_backoff_ms = delay_ms
                    .saturating_mul(2)
                    .min(self.config.resync_interval_ms);
                Duty::Failed
            }
        }
    }
}
