//! GPIO lines, edge events and PWM for Linux single-board computers.
//!
//! * [`Chip`] opens a GPIO character device and leases [`InputLine`]s and
//!   [`OutputLine`]s. Input lines requested with edge detection can be
//!   consumed by awaiting ([`InputLine::wait_for_edge`]), by callbacks
//!   ([`InputLine::on_edge`]) or as a stream ([`InputLine::edge_events`]).
//! * [`PwmChip`] drives hardware PWM channels through the sysfs export
//!   interface.
//! * [`SoftPwm`] generates a PWM waveform in software on any output line.
//!
//! Background polling runs as tokio tasks, so edge callbacks and software
//! PWM need a running tokio runtime.

pub mod backend;
pub mod board_data;
mod cdev;
pub mod config;
mod edge;
mod error;
mod gpio;
pub mod pwm;
mod resource;
mod soft_pwm;

pub use cdev::CdevDriver;
pub use config::Config;
pub use edge::{CallbackId, EdgeCallback, EdgeEvent, EdgeKind};
pub use error::{AcquisitionError, Error, ResourceId, Result};
pub use gpio::{
    Bias, Chip, ChipInfo, Direction, EdgeDetection, InputConfig, InputLine, Level, LineInfo,
    LineSettings, OutputConfig, OutputLine,
};
pub use pwm::{PermissionStatus, PwmChannel, PwmChip};
pub use soft_pwm::{SoftPwm, Waveform};
