//! Seams between the poll loop and the platform.

use std::net::Ipv4Addr;

use crate::{error::Result, readings::Snapshot};

/// Sends readings to the remote collector.
pub trait Pusher {
    fn push(&mut self, snapshot: &Snapshot) -> Result<()>;
}

/// Brings wall-clock time back in line with a time server.
pub trait ClockSync {
    fn resync(&mut self) -> Result<()>;
}

/// Joins the network the pusher and the HTTP server live on.
pub trait NetworkJoin {
    /// Blocks until an address is assigned or `timeout_secs` runs out.
    fn connect(&mut self, ssid: &str, password: &str, timeout_secs: u32) -> Result<Ipv4Addr>;

    fn is_connected(&self) -> bool;
}

impl<P: Pusher + ?Sized> Pusher for Box<P> {
    fn push(&mut self, snapshot: &Snapshot) -> Result<()> {
        (**self).push(snapshot)
    }
}

impl<C: ClockSync + ?Sized> ClockSync for Box<C> {
    fn resync(&mut self) -> Result<()> {
        (**self).resync()
    }
}
