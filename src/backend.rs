//! The low-level GPIO binding seam.
//!
//! A [`GpioDriver`] is the process-wide capability that knows how to talk to
//! the kernel. It is handed to [`Chip::open_with`](crate::Chip::open_with)
//! and shared by every handle the chip leases, so nothing in this crate
//! reaches for an ambient global binding. [`CdevDriver`](crate::CdevDriver)
//! is the production implementation; tests substitute an in-memory one.
//!
//! All methods are synchronous and return `io::Result`. Dropping a
//! [`ChipPort`] closes the chip, dropping a [`LineRequestPort`] releases the
//! requested line.

use std::{io, path::Path, time::Duration};

use crate::edge::EdgeEvent;
use crate::gpio::{ChipInfo, Level, LineInfo, LineSettings};

pub trait GpioDriver: Send + Sync {
    fn open_chip(&self, path: &Path) -> io::Result<Box<dyn ChipPort>>;
}

pub trait ChipPort: Send + Sync {
    fn info(&self) -> io::Result<ChipInfo>;

    fn line_info(&self, offset: u32) -> io::Result<LineInfo>;

    fn request_line(
        &self,
        offset: u32,
        settings: &LineSettings,
        consumer: &str,
    ) -> io::Result<Box<dyn LineRequestPort>>;
}

pub trait LineRequestPort: Send {
    fn value(&self, offset: u32) -> io::Result<Level>;

    fn set_value(&self, offset: u32, level: Level) -> io::Result<()>;

    /// Waits up to `timeout` for an edge event. `Ok(false)` means timed out.
    /// A zero timeout checks without blocking.
    fn wait_edge_events(&self, timeout: Duration) -> io::Result<bool>;

    /// Appends at most `max` pending events to `buf`, returning the count.
    fn read_edge_events(&self, buf: &mut Vec<EdgeEvent>, max: usize) -> io::Result<usize>;
}
