mod common;

use common::mock::HwCall;
use common::mock_chip;
use sbc_gpio::{Error, Level, OutputConfig, ResourceId, SoftPwm};
use std::time::Duration;
use tokio::time::sleep;

const PIN: u32 = 16;

#[tokio::test(start_paused = true)]
async fn zero_duty_never_drives_high() {
    let (chip, hw) = mock_chip();
    let pwm = chip.soft_pwm(PIN, 100.0, 0.0).unwrap();

    sleep(Duration::from_millis(100)).await;
    pwm.close().unwrap();

    let writes = hw.writes(PIN);
    assert!(!writes.is_empty());
    assert!(writes.iter().all(|level| *level == Level::Low));
}

#[tokio::test(start_paused = true)]
async fn full_duty_never_drives_low_while_running() {
    let (chip, hw) = mock_chip();
    let pwm = chip.soft_pwm(PIN, 100.0, 1.0).unwrap();

    sleep(Duration::from_millis(100)).await;
    let running = hw.writes(PIN);
    assert_eq!(running, [Level::High]);
    assert_eq!(pwm.level(), Level::High);

    pwm.close().unwrap();
    assert_eq!(hw.writes(PIN).last(), Some(&Level::Low));
}

#[tokio::test(start_paused = true)]
async fn half_duty_toggles_once_per_half_period() {
    let (chip, hw) = mock_chip();
    let pwm = chip.soft_pwm(PIN, 100.0, 0.5).unwrap();

    sleep(Duration::from_millis(100)).await;
    let writes = hw.writes(PIN);

    // 10 ms period: one transition every 5 ms, starting high.
    assert_eq!(writes.first(), Some(&Level::High));
    assert!(writes.len() >= 18, "only {} transitions", writes.len());
    assert!(writes.windows(2).all(|pair| pair[0] != pair[1]));
    assert_eq!(pwm.skipped_cycles(), 0);
}

#[tokio::test(start_paused = true)]
async fn duty_change_applies_without_restart() {
    let (chip, hw) = mock_chip();
    let pwm = chip.soft_pwm(PIN, 200.0, 0.0).unwrap();
    sleep(Duration::from_millis(20)).await;

    pwm.set_duty_cycle(1.0).unwrap().set_frequency(50.0).unwrap();
    sleep(Duration::from_millis(20)).await;

    assert_eq!(hw.writes(PIN), [Level::Low, Level::High]);
    assert_eq!(pwm.duty_cycle(), 1.0);
    assert_eq!(pwm.frequency(), 50.0);
}

#[tokio::test(start_paused = true)]
async fn close_forces_low_then_releases() {
    let (chip, hw) = mock_chip();
    let pwm = chip.soft_pwm(PIN, 100.0, 1.0).unwrap();
    sleep(Duration::from_millis(5)).await;

    pwm.close().unwrap();
    assert!(pwm.is_closed());
    assert!(!chip.is_leased(PIN));

    let calls = hw.calls();
    let low_at = calls
        .iter()
        .rposition(|call| {
            *call
                == HwCall::SetValue {
                    offset: PIN,
                    level: Level::Low,
                }
        })
        .unwrap();
    let release_at = calls
        .iter()
        .position(|call| *call == HwCall::Release { offset: PIN })
        .unwrap();
    assert!(low_at < release_at);

    // Nothing runs after close.
    let settled = hw.calls().len();
    sleep(Duration::from_millis(50)).await;
    pwm.close().unwrap();
    drop(pwm);
    assert_eq!(hw.calls().len(), settled);
    assert_eq!(hw.releases(PIN), 1);
}

#[tokio::test(start_paused = true)]
async fn closed_engine_rejects_changes() {
    let (chip, _hw) = mock_chip();
    let pwm = chip.soft_pwm(PIN, 100.0, 0.5).unwrap();
    pwm.close().unwrap();

    assert!(matches!(
        pwm.set_duty_cycle(0.2),
        Err(Error::ClosedHandle(ResourceId::SoftPwm(PIN)))
    ));
    assert!(matches!(
        pwm.set_frequency(10.0),
        Err(Error::ClosedHandle(ResourceId::SoftPwm(PIN)))
    ));
}

#[tokio::test(start_paused = true)]
async fn invalid_parameters_fail_before_any_write() {
    let (chip, hw) = mock_chip();

    assert!(matches!(
        chip.soft_pwm(PIN, 0.0, 0.5),
        Err(Error::InvalidParameter(_))
    ));
    assert!(matches!(
        chip.soft_pwm(PIN, 100.0, 1.5),
        Err(Error::InvalidParameter(_))
    ));
    assert!(!chip.is_leased(PIN));
    assert!(hw.calls().is_empty());

    let line = chip.request_output(PIN, OutputConfig::new()).unwrap();
    assert!(matches!(
        SoftPwm::new(line, f64::INFINITY, 0.5),
        Err(Error::InvalidParameter(_))
    ));
    assert!(hw.writes(PIN).is_empty());

    let pwm = chip.soft_pwm(PIN, 100.0, 0.5).unwrap();
    assert!(matches!(pwm.set_duty_cycle(-0.5), Err(Error::InvalidParameter(_))));
    assert_eq!(pwm.duty_cycle(), 0.5);
}

#[tokio::test(start_paused = true)]
async fn chip_close_stops_the_engine() {
    let (chip, hw) = mock_chip();
    let pwm = chip.soft_pwm(PIN, 100.0, 0.5).unwrap();
    sleep(Duration::from_millis(12)).await;

    chip.close().unwrap();
    let settled = hw.writes(PIN).len();
    sleep(Duration::from_millis(50)).await;
    assert_eq!(hw.writes(PIN).len(), settled);

    // The line is already gone, so there is nothing left to force low.
    pwm.close().unwrap();
    assert_eq!(hw.writes(PIN).len(), settled);
}

#[tokio::test(start_paused = true)]
async fn line_cannot_be_leased_while_pwm_runs() {
    let (chip, _hw) = mock_chip();
    let _pwm = chip.soft_pwm(PIN, 100.0, 0.5).unwrap();
    assert!(matches!(
        chip.request_output(PIN, OutputConfig::new()),
        Err(Error::ResourceInUse(ResourceId::Line(PIN)))
    ));
}

#[test]
fn needs_a_runtime() {
    let (chip, _hw) = mock_chip();
    assert!(matches!(
        chip.soft_pwm(PIN, 100.0, 0.5),
        Err(Error::NoRuntime)
    ));
    assert!(!chip.is_leased(PIN));
}
