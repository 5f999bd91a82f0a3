use sbc_gpio::{Chip, Level, OutputConfig};

// Needs a board with LEDs on lines 4 and 17 of gpiochip0.
#[test]
#[ignore]
fn test_flash_leds() {
    let chip = Chip::open("/dev/gpiochip0").unwrap();
    let leds = [
        chip.request_output(4, OutputConfig::new().with_initial(Level::Low))
            .unwrap(),
        chip.request_output(17, OutputConfig::new().with_initial(Level::Low))
            .unwrap(),
    ];

    for _ in 0..2 {
        std::thread::sleep(std::time::Duration::from_secs(1));
        for led in &leds {
            led.on().unwrap();
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
        for led in &leds {
            led.off().unwrap();
        }
    }

    chip.close().unwrap();
}
