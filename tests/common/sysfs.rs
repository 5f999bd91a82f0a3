use sbc_gpio::config::PwmConfig;
use sbc_gpio::PwmChip;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// A `pwmchip0` directory laid out like sysfs. The kernel's reaction to
/// `export` is simulated by creating `pwmN/` up front.
pub struct FakePwmChip {
    _root: TempDir,
    pub path: PathBuf,
}

impl FakePwmChip {
    pub fn new(npwm: u32) -> Self {
        super::init_logging();
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("pwmchip0");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("export"), "").unwrap();
        fs::write(path.join("unexport"), "").unwrap();
        fs::write(path.join("npwm"), format!("{}\n", npwm)).unwrap();
        FakePwmChip { _root: root, path }
    }

    pub fn with_channel(self, channel: u32) -> Self {
        let dir = self.path.join(format!("pwm{}", channel));
        fs::create_dir(&dir).unwrap();
        for attr in ["period", "duty_cycle", "enable"] {
            fs::write(dir.join(attr), "0\n").unwrap();
        }
        self
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path.join(rel))
            .unwrap()
            .trim()
            .to_string()
    }

    pub fn clear(&self, rel: &str) {
        fs::write(self.path.join(rel), "").unwrap();
    }

    pub fn config(&self) -> PwmConfig {
        PwmConfig {
            sysfs_root: self.path.parent().unwrap().to_path_buf(),
            export_attempts: 3,
            export_interval_ms: 1,
            permission_attempts: 3,
            permission_interval_ms: 1,
            ..PwmConfig::default()
        }
    }

    pub fn open(&self) -> PwmChip {
        PwmChip::open_with(&self.path, self.config()).unwrap()
    }
}
