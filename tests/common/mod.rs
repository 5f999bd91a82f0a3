#![allow(dead_code)]

pub mod mock;
pub mod sysfs;

use mock::{MockDriver, MockHardware};
use sbc_gpio::{Chip, Config};
use std::sync::Arc;

pub const LINE_NAMES: &[&str] = &[
    "ID_SDA", "ID_SCL", "GPIO2", "GPIO3", "GPIO4", "GPIO5", "GPIO6", "GPIO7", "GPIO8",
    "GPIO9", "GPIO10", "GPIO11", "GPIO12", "GPIO13", "GPIO14", "GPIO15", "GPIO16", "GPIO17",
];

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn mock_chip() -> (Chip, Arc<MockHardware>) {
    init_logging();
    let hw = MockHardware::new(LINE_NAMES);
    let chip = Chip::open_with(
        Arc::new(MockDriver(Arc::clone(&hw))),
        "/dev/gpiochip0",
        Config::default(),
    )
    .unwrap();
    (chip, hw)
}
