use log::debug;
use std::{
    fmt, io,
    ops::Not,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crate::backend::{ChipPort, GpioDriver, LineRequestPort};
use crate::cdev::CdevDriver;
use crate::config::Config;
use crate::edge::EdgePipeline;
use crate::error::{AcquisitionError, Error, ResourceId, Result};
use crate::resource::{lock, Lease, LeaseTable, ReleaseOnce};
use crate::pwm;
use crate::soft_pwm::SoftPwm;

/// Logical level of a GPIO line.
///
/// Levels are logical: on an active-low line `High` drives the pin to 0 V.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default, Hash)]
pub enum Level {
    #[default]
    Low,
    High,
}

impl Level {
    pub fn is_high(self) -> bool {
        self == Level::High
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> Self {
        level.is_high()
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => f.write_str("0"),
            Level::High => f.write_str("1"),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Direction {
    #[default]
    Input,
    Output,
}

/// Input bias. `AsIs` leaves whatever the kernel or firmware configured.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Bias {
    #[default]
    AsIs,
    Disabled,
    PullUp,
    PullDown,
}

/// Which transitions an input line reports. Fixed when the line is requested.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum EdgeDetection {
    #[default]
    None,
    Rising,
    Falling,
    Both,
}

/// The full set of attributes a line is requested with.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct LineSettings {
    pub direction: Direction,
    pub active_low: bool,
    pub bias: Bias,
    pub edge: EdgeDetection,
    pub debounce: Option<Duration>,
    /// Initial level for outputs; ignored for inputs.
    pub initial: Level,
}

/// Options for [`Chip::request_input`].
///
/// # Example
///
/// ```rust
/// use sbc_gpio::{Bias, EdgeDetection, InputConfig};
/// use std::time::Duration;
///
/// let config = InputConfig::new()
///     .with_bias(Bias::PullUp)
///     .with_edge_detection(EdgeDetection::Falling)
///     .with_debounce(Duration::from_millis(5));
/// assert_eq!(config.edge, EdgeDetection::Falling);
/// ```
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct InputConfig {
    pub bias: Bias,
    pub edge: EdgeDetection,
    pub debounce: Option<Duration>,
    pub active_low: bool,
}

impl InputConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bias(mut self, bias: Bias) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_edge_detection(mut self, edge: EdgeDetection) -> Self {
        self.edge = edge;
        self
    }

    pub fn with_debounce(mut self, period: Duration) -> Self {
        self.debounce = Some(period);
        self
    }

    pub fn as_active_low(mut self) -> Self {
        self.active_low = true;
        self
    }

    fn settings(&self) -> LineSettings {
        LineSettings {
            direction: Direction::Input,
            active_low: self.active_low,
            bias: self.bias,
            edge: self.edge,
            debounce: self.debounce,
            initial: Level::Low,
        }
    }
}

/// Options for [`Chip::request_output`].
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct OutputConfig {
    pub initial: Level,
    pub active_low: bool,
}

impl OutputConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(mut self, level: Level) -> Self {
        self.initial = level;
        self
    }

    pub fn as_active_low(mut self) -> Self {
        self.active_low = true;
        self
    }

    fn settings(&self) -> LineSettings {
        LineSettings {
            direction: Direction::Output,
            active_low: self.active_low,
            initial: self.initial,
            ..LineSettings::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    pub path: PathBuf,
    pub name: String,
    pub label: String,
    pub num_lines: u32,
}

/// What the kernel reports about a line, leased or not.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LineInfo {
    pub offset: u32,
    pub name: String,
    pub consumer: String,
    pub used: bool,
    pub direction: Direction,
    pub active_low: bool,
    pub bias: Bias,
    pub edge: EdgeDetection,
    pub debounce: Option<Duration>,
}

/// Shared state behind a leased line. Referenced by the public handle and by
/// any background poll or stream working on the line.
pub(crate) struct LineCore {
    offset: u32,
    request: Mutex<Option<Box<dyn LineRequestPort>>>,
    state: ReleaseOnce,
    leases: Arc<LeaseTable<LineCore>>,
    level: AtomicBool,
    pub(crate) edge: EdgeDetection,
    pub(crate) edges: Option<EdgePipeline>,
}

impl LineCore {
    pub(crate) fn offset(&self) -> u32 {
        self.offset
    }

    pub(crate) fn id(&self) -> ResourceId {
        ResourceId::Line(self.offset)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        self.state.ensure_open(self.id())
    }

    /// Runs `op` against the kernel request, failing fast once released.
    pub(crate) fn with_request<R>(
        &self,
        what: &str,
        op: impl FnOnce(&dyn LineRequestPort) -> io::Result<R>,
    ) -> Result<R> {
        let request = lock(&self.request);
        match request.as_deref() {
            Some(request) if !self.state.is_closed() => op(request)
                .map_err(|err| Error::io(format!("GPIO line {} {}", self.offset, what), err)),
            _ => Err(Error::ClosedHandle(self.id())),
        }
    }

    fn write(&self, level: Level) -> Result<()> {
        self.with_request("write", |request| request.set_value(self.offset, level))?;
        self.level.store(level.is_high(), Ordering::Release);
        Ok(())
    }

    fn level(&self) -> Level {
        Level::from(self.level.load(Ordering::Acquire))
    }

    pub(crate) fn close(&self) -> Result<()> {
        if !self.state.close() {
            return Ok(());
        }
        if let Some(edges) = &self.edges {
            edges.shutdown();
        }
        drop(lock(&self.request).take());
        self.leases.remove(self.offset);
        debug!("released GPIO line {}", self.offset);
        Ok(())
    }
}

impl Lease for LineCore {
    fn release(&self) -> Result<()> {
        self.close()
    }
}

struct ChipInner {
    path: PathBuf,
    config: Arc<Config>,
    port: Mutex<Option<Box<dyn ChipPort>>>,
    leases: Arc<LeaseTable<LineCore>>,
    state: ReleaseOnce,
}

/// An open GPIO chip. Owns every line it leases.
///
/// Dropping or closing the chip releases all lines still open; their handles
/// then fail with [`Error::ClosedHandle`].
///
/// # Example
///
/// ```no_run
/// use sbc_gpio::{Chip, Level, OutputConfig};
///
/// let chip = Chip::open("/dev/gpiochip0").unwrap();
/// let led = chip.request_output(17, OutputConfig::new()).unwrap();
/// led.on().unwrap().off().unwrap();
/// chip.close().unwrap();
/// ```
pub struct Chip {
    inner: Arc<ChipInner>,
}

impl Chip {
    /// Opens a chip through the GPIO character device, with configuration
    /// taken from the environment.
    pub fn open(path: impl AsRef<Path>) -> Result<Chip> {
        Chip::open_with(Arc::new(CdevDriver), path, Config::from_env())
    }

    /// Opens a chip through an explicit driver capability.
    pub fn open_with(
        driver: Arc<dyn GpioDriver>,
        path: impl AsRef<Path>,
        config: Config,
    ) -> Result<Chip> {
        let path = path.as_ref().to_path_buf();
        let port = driver
            .open_chip(&path)
            .map_err(|source| AcquisitionError::ChipOpen {
                path: path.clone(),
                source,
            })?;
        debug!("opened GPIO chip {}", path.display());

        Ok(Chip {
            inner: Arc::new(ChipInner {
                path,
                config: Arc::new(config),
                port: Mutex::new(Some(port)),
                leases: LeaseTable::new(ResourceId::Line),
                state: ReleaseOnce::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    fn with_port<R>(&self, op: impl FnOnce(&dyn ChipPort) -> Result<R>) -> Result<R> {
        let port = lock(&self.inner.port);
        match port.as_deref() {
            Some(port) if !self.inner.state.is_closed() => op(port),
            _ => Err(Error::ClosedHandle(ResourceId::Chip)),
        }
    }

    pub fn info(&self) -> Result<ChipInfo> {
        self.with_port(|port| {
            port.info().map_err(|err| {
                Error::io(format!("chip info on {}", self.inner.path.display()), err)
            })
        })
    }

    pub fn line_info(&self, offset: u32) -> Result<LineInfo> {
        self.with_port(|port| {
            port.line_info(offset).map_err(|err| {
                Error::io(
                    format!("line {} info on {}", offset, self.inner.path.display()),
                    err,
                )
            })
        })
    }

    /// Looks a line up by the name the device tree gave it.
    pub fn find_line(&self, name: &str) -> Result<Option<LineInfo>> {
        let num_lines = self.info()?.num_lines;
        for offset in 0..num_lines {
            let info = self.line_info(offset)?;
            if info.name == name {
                return Ok(Some(info));
            }
        }
        Ok(None)
    }

    /// Whether `offset` is currently leased by this chip instance.
    pub fn is_leased(&self, offset: u32) -> bool {
        self.inner.leases.is_leased(offset)
    }

    pub fn request_input(&self, offset: u32, config: InputConfig) -> Result<InputLine> {
        let core = self.request(offset, config.settings())?;
        Ok(InputLine { core })
    }

    pub fn request_output(&self, offset: u32, config: OutputConfig) -> Result<OutputLine> {
        let core = self.request(offset, config.settings())?;
        Ok(OutputLine { core })
    }

    /// Leases `offset` as a low output and runs a software PWM on it.
    /// Must be called from within a tokio runtime.
    pub fn soft_pwm(&self, offset: u32, frequency: f64, duty_cycle: f64) -> Result<SoftPwm> {
        pwm::validate(frequency, duty_cycle)?;
        let line = self.request_output(offset, OutputConfig::new())?;
        SoftPwm::with_config(line, frequency, duty_cycle, &self.inner.config.soft_pwm)
    }

    fn request(&self, offset: u32, settings: LineSettings) -> Result<Arc<LineCore>> {
        self.inner.state.ensure_open(ResourceId::Chip)?;
        let reservation = self.inner.leases.reserve(offset)?;

        let request = self.with_port(|port| {
            port.request_line(offset, &settings, &self.inner.config.consumer)
                .map_err(|source| Error::from(AcquisitionError::Request { offset, source }))
        })?;

        let edges = (settings.direction == Direction::Input
            && settings.edge != EdgeDetection::None)
            .then(|| EdgePipeline::new(&self.inner.config.edge));

        let core = Arc::new(LineCore {
            offset,
            request: Mutex::new(Some(request)),
            state: ReleaseOnce::default(),
            leases: Arc::clone(&self.inner.leases),
            level: AtomicBool::new(settings.initial.is_high()),
            edge: settings.edge,
            edges,
        });
        // Refused if the chip closed while the kernel request was in flight;
        // dropping `core` then hands the line back.
        reservation.commit(&core)?;
        debug!(
            "requested GPIO line {} on {} as {:?}",
            offset,
            self.inner.path.display(),
            settings.direction
        );

        Ok(core)
    }

    /// Releases every line still leased, then the chip itself.
    ///
    /// Per-line failures are logged and do not stop the shutdown.
    pub fn close(&self) -> Result<()> {
        if !self.inner.state.close() {
            return Ok(());
        }
        let failures = self.inner.leases.release_all();
        drop(lock(&self.inner.port).take());
        debug!(
            "closed GPIO chip {} ({} release failures)",
            self.inner.path.display(),
            failures.len()
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }
}

impl Drop for Chip {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A leased input line.
pub struct InputLine {
    pub(crate) core: Arc<LineCore>,
}

impl InputLine {
    pub fn offset(&self) -> u32 {
        self.core.offset()
    }

    pub fn edge_detection(&self) -> EdgeDetection {
        self.core.edge
    }

    pub fn value(&self) -> Result<Level> {
        self.core
            .with_request("read", |request| request.value(self.core.offset()))
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Releases the line. Releasing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }
}

impl Drop for InputLine {
    fn drop(&mut self) {
        let _ = self.core.close();
    }
}

/// A leased output line. Mutators return the handle for chaining.
pub struct OutputLine {
    core: Arc<LineCore>,
}

impl OutputLine {
    pub fn offset(&self) -> u32 {
        self.core.offset()
    }

    pub fn write(&self, level: Level) -> Result<&Self> {
        self.core.write(level)?;
        Ok(self)
    }

    pub fn on(&self) -> Result<&Self> {
        self.write(Level::High)
    }

    pub fn off(&self) -> Result<&Self> {
        self.write(Level::Low)
    }

    pub fn toggle(&self) -> Result<&Self> {
        self.write(!self.core.level())
    }

    /// The last level written, or the initial level.
    pub fn level(&self) -> Level {
        self.core.level()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn close(&self) -> Result<()> {
        self.core.close()
    }
}

impl Drop for OutputLine {
    fn drop(&mut self) {
        let _ = self.core.close();
    }
}
