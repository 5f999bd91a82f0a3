//! Hardware PWM over the sysfs export interface.
//!
//! A channel goes through export, wait for `pwmN/` to appear, wait for udev
//! to make `pwmN/period` writable, program period and duty, enable. Both
//! waits are bounded retry loops with a short synchronous sleep; exhausting
//! them yields [`Error::ExportTimeout`] or [`Error::PermissionDenied`] with a
//! remediation hint rather than a bare I/O error.

use log::{debug, warn};
use nix::unistd::{access, getegid, getgroups, AccessFlags, Group};
use std::{
    fmt,
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    thread,
};

use crate::config::{Config, PwmConfig};
use crate::error::{AcquisitionError, Error, ResourceId, Result};
use crate::resource::{lock, Lease, LeaseTable, ReleaseOnce};

pub(crate) fn validate_frequency(frequency: f64) -> Result<()> {
    if frequency.is_finite() && frequency > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "frequency must be a positive number of hertz, got {}",
            frequency
        )))
    }
}

pub(crate) fn validate_duty_cycle(duty_cycle: f64) -> Result<()> {
    if (0.0..=1.0).contains(&duty_cycle) {
        Ok(())
    } else {
        Err(Error::InvalidParameter(format!(
            "duty cycle must be between 0 and 1, got {}",
            duty_cycle
        )))
    }
}

pub(crate) fn validate(frequency: f64, duty_cycle: f64) -> Result<()> {
    validate_frequency(frequency)?;
    validate_duty_cycle(duty_cycle)
}

/// Period in nanoseconds for `frequency` hertz.
pub fn period_ns(frequency: f64) -> u64 {
    (1e9 / frequency).round() as u64
}

/// Active time in nanoseconds for a period and a duty ratio.
pub fn duty_ns(period_ns: u64, duty_cycle: f64) -> u64 {
    (period_ns as f64 * duty_cycle).round() as u64
}

fn write_attr(path: &Path, value: impl fmt::Display) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).truncate(true).open(path)?;
    file.write_all(value.to_string().as_bytes())
}

fn write_sysfs(path: &Path, value: impl fmt::Display) -> Result<()> {
    write_attr(path, value).map_err(|err| Error::io(format!("writing {}", path.display()), err))
}

fn read_u64(path: &Path) -> io::Result<u64> {
    fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn writable(path: &Path) -> bool {
    access(path, AccessFlags::W_OK).is_ok()
}

fn in_group(name: &str) -> bool {
    let group = match Group::from_name(name) {
        Ok(Some(group)) => group,
        _ => return false,
    };
    getegid() == group.gid
        || getgroups()
            .map(|groups| groups.contains(&group.gid))
            .unwrap_or(false)
}

/// Programs period and duty so that duty never exceeds period between the
/// two writes, which the kernel would reject.
fn write_timing(dir: &Path, current_duty_ns: u64, period: u64, duty: u64) -> Result<()> {
    let period_path = dir.join("period");
    let duty_path = dir.join("duty_cycle");
    if current_duty_ns <= period {
        write_sysfs(&period_path, period)?;
        write_sysfs(&duty_path, duty)
    } else {
        write_sysfs(&duty_path, duty)?;
        write_sysfs(&period_path, period)
    }
}

/// Result of [`PwmChip::check_permissions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionStatus {
    pub can_write: bool,
    pub in_privileged_group: bool,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    period_ns: u64,
    duty_cycle: f64,
    duty_ns: u64,
}

struct ChannelCore {
    channel: u32,
    dir: PathBuf,
    unexport: PathBuf,
    timing: Mutex<Timing>,
    state: ReleaseOnce,
    leases: Arc<LeaseTable<ChannelCore>>,
}

impl ChannelCore {
    fn id(&self) -> ResourceId {
        ResourceId::PwmChannel(self.channel)
    }

    fn set_frequency(&self, frequency: f64) -> Result<()> {
        validate_frequency(frequency)?;
        let mut timing = lock(&self.timing);
        self.state.ensure_open(self.id())?;

        let period = period_ns(frequency);
        let duty = duty_ns(period, timing.duty_cycle);
        if let Err(err) = write_timing(&self.dir, timing.duty_ns, period, duty) {
            self.resync(&mut timing);
            return Err(err);
        }
        timing.period_ns = period;
        timing.duty_ns = duty;
        Ok(())
    }

    /// Reloads the programmed period and duty after a partial write, so the
    /// next change is computed against what the hardware actually holds.
    fn resync(&self, timing: &mut Timing) {
        if let Ok(period) = read_u64(&self.dir.join("period")) {
            timing.period_ns = period;
        }
        if let Ok(duty) = read_u64(&self.dir.join("duty_cycle")) {
            timing.duty_ns = duty;
        }
    }

    fn set_duty_cycle(&self, duty_cycle: f64) -> Result<()> {
        validate_duty_cycle(duty_cycle)?;
        let mut timing = lock(&self.timing);
        self.state.ensure_open(self.id())?;

        let duty = duty_ns(timing.period_ns, duty_cycle);
        write_sysfs(&self.dir.join("duty_cycle"), duty)?;
        timing.duty_cycle = duty_cycle;
        timing.duty_ns = duty;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let _timing = lock(&self.timing);
        if !self.state.close() {
            return Ok(());
        }
        if let Err(err) = write_attr(&self.dir.join("enable"), 0) {
            debug!("disabling PWM channel {} failed: {}", self.channel, err);
        }
        if let Err(err) = write_attr(&self.unexport, self.channel) {
            warn!("unexporting PWM channel {} failed: {}", self.channel, err);
        }
        self.leases.remove(self.channel);
        debug!("released PWM channel {}", self.channel);
        Ok(())
    }
}

impl Lease for ChannelCore {
    fn release(&self) -> Result<()> {
        self.close()
    }
}

struct PwmChipInner {
    path: PathBuf,
    config: PwmConfig,
    leases: Arc<LeaseTable<ChannelCore>>,
    state: ReleaseOnce,
}

/// A PWM controller, e.g. `/sys/class/pwm/pwmchip0`.
///
/// # Example
///
/// ```no_run
/// use sbc_gpio::PwmChip;
///
/// let chip = PwmChip::open_index(0).unwrap();
/// let fan = chip.acquire(0, 25_000.0, 0.4).unwrap();
/// fan.set_duty_cycle(0.8).unwrap().set_frequency(20_000.0).unwrap();
/// fan.close().unwrap();
/// ```
pub struct PwmChip {
    inner: Arc<PwmChipInner>,
}

impl PwmChip {
    pub fn open(path: impl AsRef<Path>) -> Result<PwmChip> {
        PwmChip::open_with(path, Config::from_env().pwm)
    }

    /// Opens `pwmchip{index}` under the configured sysfs root.
    pub fn open_index(index: u32) -> Result<PwmChip> {
        let config = Config::from_env().pwm;
        let path = config.sysfs_root.join(format!("pwmchip{}", index));
        PwmChip::open_with(path, config)
    }

    pub fn open_with(path: impl AsRef<Path>, config: PwmConfig) -> Result<PwmChip> {
        let path = path.as_ref().to_path_buf();
        if !path.is_dir() {
            return Err(AcquisitionError::ChipOpen {
                source: io::Error::new(io::ErrorKind::NotFound, "no such PWM chip directory"),
                path,
            }
            .into());
        }
        debug!("opened PWM chip {}", path.display());

        Ok(PwmChip {
            inner: Arc::new(PwmChipInner {
                path,
                config,
                leases: LeaseTable::new(ResourceId::PwmChannel),
                state: ReleaseOnce::default(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Number of channels the controller provides.
    pub fn npwm(&self) -> Result<u32> {
        let path = self.inner.path.join("npwm");
        read_u64(&path)
            .and_then(|count| {
                u32::try_from(count)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
            })
            .map_err(|err| Error::io(format!("reading {}", path.display()), err))
    }

    pub fn is_leased(&self, channel: u32) -> bool {
        self.inner.leases.is_leased(channel)
    }

    fn channel_dir(&self, channel: u32) -> PathBuf {
        self.inner.path.join(format!("pwm{}", channel))
    }

    /// Exports, configures and enables `channel`.
    ///
    /// A channel that is already exported (by a previous run or another
    /// process) is adopted rather than treated as a failure.
    pub fn acquire(&self, channel: u32, frequency: f64, duty_cycle: f64) -> Result<PwmChannel> {
        validate(frequency, duty_cycle)?;
        self.inner.state.ensure_open(ResourceId::Chip)?;
        let reservation = self.inner.leases.reserve(channel)?;

        let dir = self.channel_dir(channel);
        let newly_exported = self.export(channel, &dir)?;
        if newly_exported {
            self.await_export(channel, &dir)?;
        }

        // The permission wait can be long; a chip closed meanwhile must not
        // end up with an enabled channel.
        let configured = self
            .await_permission(&dir.join("period"))
            .and_then(|()| self.inner.state.ensure_open(ResourceId::Chip))
            .and_then(|()| self.configure(&dir, frequency, duty_cycle));
        let timing = match configured {
            Ok(timing) => timing,
            Err(err) => {
                if newly_exported {
                    self.unexport(channel);
                }
                return Err(err);
            }
        };

        let core = Arc::new(ChannelCore {
            channel,
            unexport: self.inner.path.join("unexport"),
            dir,
            timing: Mutex::new(timing),
            state: ReleaseOnce::default(),
            leases: Arc::clone(&self.inner.leases),
        });
        if let Err(err) = reservation.commit(&core) {
            core.state.close();
            if let Err(disable) = write_attr(&core.dir.join("enable"), 0) {
                debug!("disabling PWM channel {} failed: {}", channel, disable);
            }
            if newly_exported {
                self.unexport(channel);
            }
            return Err(err);
        }
        debug!(
            "acquired PWM channel {} on {}: period {} ns, duty {} ns",
            channel,
            self.inner.path.display(),
            timing.period_ns,
            timing.duty_ns
        );

        Ok(PwmChannel { core })
    }

    /// Returns whether this call performed the export.
    fn export(&self, channel: u32, dir: &Path) -> Result<bool> {
        match write_attr(&self.inner.path.join("export"), channel) {
            Ok(()) => Ok(true),
            Err(err) if dir.is_dir() => {
                debug!("PWM channel {} already exported ({})", channel, err);
                Ok(false)
            }
            Err(source) => Err(AcquisitionError::Export { channel, source }.into()),
        }
    }

    fn await_export(&self, channel: u32, dir: &Path) -> Result<()> {
        let config = &self.inner.config;
        for _ in 0..config.export_attempts {
            if dir.is_dir() {
                return Ok(());
            }
            thread::sleep(config.export_interval());
        }
        if dir.is_dir() {
            return Ok(());
        }

        self.unexport(channel);
        Err(Error::ExportTimeout {
            channel,
            hint: format!(
                "The kernel accepted the export but {} never appeared; check that the PWM \
                 controller is enabled in the device tree and that the channel is below npwm.",
                dir.display()
            ),
        })
    }

    fn await_permission(&self, path: &Path) -> Result<()> {
        let config = &self.inner.config;
        for _ in 0..config.permission_attempts {
            if writable(path) {
                return Ok(());
            }
            thread::sleep(config.permission_interval());
        }
        if writable(path) {
            return Ok(());
        }

        Err(Error::PermissionDenied {
            path: path.to_path_buf(),
            hint: format!(
                "Add your user to the '{group}' group (sudo usermod -aG {group} $USER) and \
                 install a udev rule giving that group write access to {chip}/pwm*, then log \
                 in again.",
                group = config.privileged_group,
                chip = self.inner.path.display()
            ),
        })
    }

    fn configure(&self, dir: &Path, frequency: f64, duty_cycle: f64) -> Result<Timing> {
        let period = period_ns(frequency);
        let duty = duty_ns(period, duty_cycle);
        let current_duty = read_u64(&dir.join("duty_cycle")).unwrap_or(0);

        write_timing(dir, current_duty, period, duty)?;
        write_sysfs(&dir.join("enable"), 1)?;

        Ok(Timing {
            period_ns: period,
            duty_cycle,
            duty_ns: duty,
        })
    }

    fn unexport(&self, channel: u32) {
        if let Err(err) = write_attr(&self.inner.path.join("unexport"), channel) {
            warn!("unexporting PWM channel {} failed: {}", channel, err);
        }
    }

    /// Non-mutating pre-flight check for a PWM chip directory.
    pub fn check_permissions(chip: impl AsRef<Path>, group: &str) -> PermissionStatus {
        let export = chip.as_ref().join("export");
        let can_write = writable(&export);
        let in_privileged_group = in_group(group);

        let message = match (can_write, in_privileged_group) {
            (true, _) => format!("{} is writable", export.display()),
            (false, true) => format!(
                "{} is not writable although you are in the '{}' group; check the udev rule \
                 that sets its group and mode",
                export.display(),
                group
            ),
            (false, false) => format!(
                "{} is not writable; add your user to the '{}' group (sudo usermod -aG {} \
                 $USER), install the PWM udev rule and log in again",
                export.display(),
                group,
                group
            ),
        };

        PermissionStatus {
            can_write,
            in_privileged_group,
            message,
        }
    }

    /// [`PwmChip::check_permissions`] for this chip and its configured group.
    pub fn permissions(&self) -> PermissionStatus {
        PwmChip::check_permissions(&self.inner.path, &self.inner.config.privileged_group)
    }

    /// Releases every channel still leased. Failures are logged and skipped.
    pub fn close(&self) -> Result<()> {
        if !self.inner.state.close() {
            return Ok(());
        }
        let failures = self.inner.leases.release_all();
        debug!(
            "closed PWM chip {} ({} release failures)",
            self.inner.path.display(),
            failures.len()
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }
}

impl Drop for PwmChip {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// An exported, enabled PWM channel. Mutators return the handle for chaining.
pub struct PwmChannel {
    core: Arc<ChannelCore>,
}

impl PwmChannel {
    pub fn channel(&self) -> u32 {
        self.core.channel
    }

    pub fn period_ns(&self) -> u64 {
        lock(&self.core.timing).period_ns
    }

    pub fn duty_ns(&self) -> u64 {
        lock(&self.core.timing).duty_ns
    }

    pub fn duty_cycle(&self) -> f64 {
        lock(&self.core.timing).duty_cycle
    }

    /// Derived from the programmed period.
    pub fn frequency(&self) -> f64 {
        1e9 / self.period_ns() as f64
    }

    /// Changes the frequency, keeping the duty ratio.
    pub fn set_frequency(&self, frequency: f64) -> Result<&Self> {
        self.core.set_frequency(frequency)?;
        Ok(self)
    }

    pub fn set_duty_cycle(&self, duty_cycle: f64) -> Result<&Self> {
        self.core.set_duty_cycle(duty_cycle)?;
        Ok(self)
    }

    pub fn is_closed(&self) -> bool {
        self.core.state.is_closed()
    }

    /// Disables and unexports the channel. Releasing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }
}

impl Drop for PwmChannel {
    fn drop(&mut self) {
        let _ = self.core.close();
    }
}
