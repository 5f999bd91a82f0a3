//! Discovery of the GPIO and PWM controllers a board exposes.
//!
//! Everything here only reads from `/dev`, sysfs and the device tree; no
//! resource is leased.

use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub static DEV_ROOT: &str = "/dev";
pub static DEVICE_TREE_ROOT: &str = "/proc/device-tree";

/// A PWM controller found under the sysfs root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PwmChipInfo {
    pub path: PathBuf,
    pub index: u32,
    /// Number of channels, 0 if the controller did not report it.
    pub npwm: u32,
}

fn read_file_to_string(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|contents| contents.trim_matches(|c: char| c.is_whitespace() || c == '\0').to_string())
}

fn string_to_uint(s: &str) -> Option<u32> {
    s.parse::<u32>().ok()
}

/// Entries of `dir` named `{prefix}N`, sorted by `N`.
fn numbered_entries(dir: &Path, prefix: &str) -> Result<Vec<(u32, PathBuf)>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let file_name = entry.file_name();
        let Some(index) = file_name
            .to_str()
            .and_then(|name| name.strip_prefix(prefix))
            .and_then(string_to_uint)
        else {
            continue;
        };
        found.push((index, entry.path()));
    }
    found.sort_by_key(|(index, _)| *index);
    Ok(found)
}

/// GPIO character devices (`gpiochipN`) under `dev_root`.
pub fn gpio_chips(dev_root: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    Ok(numbered_entries(dev_root.as_ref(), "gpiochip")?
        .into_iter()
        .map(|(_, path)| path)
        .collect())
}

/// PWM controllers (`pwmchipN`) under `sysfs_root`, e.g. `/sys/class/pwm`.
pub fn pwm_chips(sysfs_root: impl AsRef<Path>) -> Result<Vec<PwmChipInfo>> {
    Ok(numbered_entries(sysfs_root.as_ref(), "pwmchip")?
        .into_iter()
        .map(|(index, path)| {
            let npwm = read_file_to_string(&path.join("npwm"))
                .and_then(|n| string_to_uint(&n))
                .unwrap_or(0);
            PwmChipInfo { path, index, npwm }
        })
        .collect())
}

/// The board's model string from the device tree, if present.
pub fn board_model(device_tree: impl AsRef<Path>) -> Option<String> {
    read_file_to_string(&device_tree.as_ref().join("model")).filter(|model| !model.is_empty())
}

/// The device tree `compatible` list, most specific first.
pub fn compatible(device_tree: impl AsRef<Path>) -> Vec<String> {
    fs::read_to_string(device_tree.as_ref().join("compatible"))
        .map(|contents| {
            contents
                .split('\0')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
