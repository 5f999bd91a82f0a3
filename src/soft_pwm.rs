//! Software PWM on a plain output line.
//!
//! A tokio interval samples the wall clock every tick and derives the
//! wanted level from the position inside the current cycle. Phase is always
//! recomputed from absolute elapsed time against a cycle anchor, so timer
//! jitter never accumulates; the anchor only moves forward in whole periods.

use log::{debug, warn};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{
    runtime::Handle,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};

use crate::config::SoftPwmConfig;
use crate::error::{Error, ResourceId, Result};
use crate::gpio::{Level, OutputLine};
use crate::pwm::{validate, validate_duty_cycle, validate_frequency};
use crate::resource::{lock, ReleaseOnce};

/// Waveform state sampled by the engine. Times are nanoseconds on the
/// engine's own clock.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    duty_cycle: f64,
    frequency: f64,
    anchor_ns: f64,
    level: Option<Level>,
    in_phase: bool,
    skipped_cycles: u64,
}

impl Waveform {
    pub fn new(frequency: f64, duty_cycle: f64, now_ns: u64) -> Result<Self> {
        validate(frequency, duty_cycle)?;
        Ok(Self {
            duty_cycle,
            frequency,
            anchor_ns: now_ns as f64,
            level: None,
            in_phase: false,
            skipped_cycles: 0,
        })
    }

    pub fn duty_cycle(&self) -> f64 {
        self.duty_cycle
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn period_ns(&self) -> f64 {
        1e9 / self.frequency
    }

    pub fn anchor_ns(&self) -> f64 {
        self.anchor_ns
    }

    /// Last level handed out by [`Waveform::sample`].
    pub fn level(&self) -> Option<Level> {
        self.level
    }

    /// Whole cycles that elapsed between two samples without being observed.
    pub fn skipped_cycles(&self) -> u64 {
        self.skipped_cycles
    }

    /// Takes effect from the sample after next; the anchor is kept.
    pub fn set_duty_cycle(&mut self, duty_cycle: f64) -> Result<()> {
        validate_duty_cycle(duty_cycle)?;
        self.duty_cycle = duty_cycle;
        Ok(())
    }

    pub fn set_frequency(&mut self, frequency: f64) -> Result<()> {
        validate_frequency(frequency)?;
        self.frequency = frequency;
        Ok(())
    }

    /// Returns the level to drive at `now_ns`, or `None` if the output
    /// already has it.
    pub fn sample(&mut self, now_ns: u64) -> Option<Level> {
        let target = if self.duty_cycle <= 0.0 {
            self.in_phase = false;
            Level::Low
        } else if self.duty_cycle >= 1.0 {
            self.in_phase = false;
            Level::High
        } else {
            self.phase_level(now_ns as f64)
        };

        if self.level == Some(target) {
            None
        } else {
            self.level = Some(target);
            Some(target)
        }
    }

    fn phase_level(&mut self, now_ns: f64) -> Level {
        let period = self.period_ns();
        let mut elapsed = now_ns - self.anchor_ns;

        if elapsed >= period {
            let cycles = (elapsed / period).floor();
            self.anchor_ns += cycles * period;
            elapsed -= cycles * period;

            if self.in_phase && cycles >= 2.0 {
                let skipped = cycles as u64 - 1;
                self.skipped_cycles += skipped;
                debug!("software PWM skipped {} whole cycles", skipped);
            }
        }
        self.in_phase = true;

        let position = (elapsed / period).clamp(0.0, 1.0);
        Level::from(position < self.duty_cycle)
    }

    /// Forgets the emitted level so the next sample writes unconditionally.
    fn forget_level(&mut self) {
        self.level = None;
    }
}

struct Engine {
    line: OutputLine,
    waveform: Mutex<Waveform>,
    origin: Instant,
    state: ReleaseOnce,
}

impl Engine {
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    /// One sampling step. Returns `false` once the engine should stop.
    fn tick(&self) -> bool {
        let mut waveform = lock(&self.waveform);
        if self.state.is_closed() {
            return false;
        }
        let Some(level) = waveform.sample(self.now_ns()) else {
            return true;
        };
        match self.line.write(level) {
            Ok(_) => true,
            Err(Error::ClosedHandle(_)) => false,
            Err(err) => {
                waveform.forget_level();
                warn!(
                    "software PWM write on GPIO line {} failed: {}",
                    self.line.offset(),
                    err
                );
                true
            }
        }
    }
}

async fn run_ticks(engine: Arc<Engine>, period: Duration) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if !engine.tick() {
            break;
        }
    }
}

/// A PWM waveform generated in software on an output line.
///
/// # Example
///
/// ```no_run
/// use sbc_gpio::{Chip, OutputConfig, SoftPwm};
///
/// # async fn run() -> sbc_gpio::Result<()> {
/// let chip = Chip::open("/dev/gpiochip0")?;
/// let led = chip.request_output(18, OutputConfig::new())?;
/// let pwm = SoftPwm::new(led, 100.0, 0.25)?;
/// pwm.set_duty_cycle(0.75)?;
/// pwm.close()?;
/// # Ok(())
/// # }
/// ```
pub struct SoftPwm {
    engine: Arc<Engine>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl SoftPwm {
    /// Starts the waveform with the default 1 ms tick. Must be called from
    /// within a tokio runtime.
    pub fn new(line: OutputLine, frequency: f64, duty_cycle: f64) -> Result<SoftPwm> {
        SoftPwm::with_config(line, frequency, duty_cycle, &SoftPwmConfig::default())
    }

    pub fn with_config(
        line: OutputLine,
        frequency: f64,
        duty_cycle: f64,
        config: &SoftPwmConfig,
    ) -> Result<SoftPwm> {
        let waveform = Waveform::new(frequency, duty_cycle, 0)?;
        if line.is_closed() {
            return Err(Error::ClosedHandle(ResourceId::Line(line.offset())));
        }
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let engine = Arc::new(Engine {
            line,
            waveform: Mutex::new(waveform),
            origin: Instant::now(),
            state: ReleaseOnce::default(),
        });
        let ticker = runtime.spawn(run_ticks(Arc::clone(&engine), config.tick_interval()));
        debug!(
            "started software PWM on GPIO line {} at {} Hz, duty {}",
            engine.line.offset(),
            frequency,
            duty_cycle
        );

        Ok(SoftPwm {
            engine,
            ticker: Mutex::new(Some(ticker)),
        })
    }

    fn id(&self) -> ResourceId {
        ResourceId::SoftPwm(self.engine.line.offset())
    }

    pub fn offset(&self) -> u32 {
        self.engine.line.offset()
    }

    pub fn duty_cycle(&self) -> f64 {
        lock(&self.engine.waveform).duty_cycle()
    }

    pub fn frequency(&self) -> f64 {
        lock(&self.engine.waveform).frequency()
    }

    pub fn skipped_cycles(&self) -> u64 {
        lock(&self.engine.waveform).skipped_cycles()
    }

    /// Level most recently driven by the engine.
    pub fn level(&self) -> Level {
        self.engine.line.level()
    }

    pub fn set_duty_cycle(&self, duty_cycle: f64) -> Result<&Self> {
        validate_duty_cycle(duty_cycle)?;
        let mut waveform = lock(&self.engine.waveform);
        self.engine.state.ensure_open(self.id())?;
        waveform.set_duty_cycle(duty_cycle)?;
        Ok(self)
    }

    pub fn set_frequency(&self, frequency: f64) -> Result<&Self> {
        validate_frequency(frequency)?;
        let mut waveform = lock(&self.engine.waveform);
        self.engine.state.ensure_open(self.id())?;
        waveform.set_frequency(frequency)?;
        Ok(self)
    }

    pub fn is_closed(&self) -> bool {
        self.engine.state.is_closed()
    }

    /// Stops the cadence, drives the line low and releases it. Idempotent.
    pub fn close(&self) -> Result<()> {
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
        let _waveform = lock(&self.engine.waveform);
        if !self.engine.state.close() {
            return Ok(());
        }

        // The owning chip may already have released the line.
        let forced = if self.engine.line.is_closed() {
            Ok(())
        } else {
            self.engine.line.off().map(|_| ())
        };
        let released = self.engine.line.close();
        debug!("stopped software PWM on GPIO line {}", self.offset());
        forced.and(released)
    }
}

impl Drop for SoftPwm {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
