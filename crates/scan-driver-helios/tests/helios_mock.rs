//! Helios driver against a scripted laser controller on a mock serial port.

use std::sync::Arc;
use std::time::Duration;

use scan_core::mock_serial::{self, MockDeviceHarness};
use scan_core::{ScanError, VerifyPolicy};
use scan_driver_helios::{HeliosConfig, HeliosDriver, PulseMode, TemperatureSensor};

fn fast_config() -> HeliosConfig {
    HeliosConfig {
        verify: VerifyPolicy::new(Duration::from_millis(20), Duration::from_millis(10)),
        query_timeout_ms: 150,
        query_gap_ms: 1,
        factory_reset_ms: 5,
        shutdown_timeout_ms: 500,
        ..HeliosConfig::default()
    }
}

fn attach() -> (Arc<HeliosDriver>, MockDeviceHarness) {
    let (port, harness) = mock_serial::new();
    let laser = HeliosDriver::from_port(Box::new(port), "mock-helios", fast_config()).unwrap();
    (Arc::new(laser), harness)
}

// =============================================================================
// Set-and-verify
// =============================================================================

#[tokio::test]
async fn set_frequency_reports_fifty_khz() {
    let (laser, mut harness) = attach();

    let setter = Arc::clone(&laser);
    let task = tokio::spawn(async move { setter.set_frequency_hz(50_000.0).await });

    harness.expect_write(b"LDF 20000\r").await;
    harness.expect_and_respond(b"LDF\r", b"20000\r").await;

    assert_eq!(task.await.unwrap().unwrap(), 50_000.0);
    assert_eq!(laser.state().frequency_hz, 50_000.0);
}

#[tokio::test]
async fn frequency_outside_period_range_sends_nothing() {
    let (laser, mut harness) = attach();

    // 200 kHz is a 5000 ns period, below the 8000 ns minimum
    let err = laser.set_frequency_hz(200_000.0).await.unwrap_err();
    assert!(matches!(err, ScanError::OutOfRange { parameter: "LDF", .. }));
    assert!(matches!(
        laser.set_frequency_hz(0.0).await,
        Err(ScanError::InvalidFrequency(_))
    ));
    assert!(matches!(
        laser.set_current_ma(7_500.0).await,
        Err(ScanError::OutOfRange { parameter: "LDS", .. })
    ));

    harness.expect_silence(Duration::from_millis(50)).await;
    assert_eq!(laser.state().frequency_hz, 10_000.0);
}

#[tokio::test]
async fn verification_fails_after_three_attempts() {
    let (laser, mut harness) = attach();

    let setter = Arc::clone(&laser);
    let task = tokio::spawn(async move { setter.set_frequency_hz(50_000.0).await });

    for _ in 0..3 {
        harness.expect_write(b"LDF 20000\r").await;
        harness.expect_and_respond(b"LDF\r", b"10000\r").await;
    }

    match task.await.unwrap().unwrap_err() {
        ScanError::VerificationFailed {
            attempts, observed, ..
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(observed, "10000");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    harness.expect_silence(Duration::from_millis(50)).await;

    // State holds what the laser reported, not what was requested
    assert_eq!(laser.state().frequency_hz, 100_000.0);
}

#[tokio::test]
async fn enable_and_pulse_mode_are_verified() {
    let (laser, mut harness) = attach();

    let setter = Arc::clone(&laser);
    let task = tokio::spawn(async move {
        setter.set_laser_enable(true).await?;
        setter.set_pulse_mode(PulseMode::Gating).await
    });

    harness.expect_write(b"LDO 1\r").await;
    harness.expect_and_respond(b"LDO\r", b"1\r").await;
    harness.expect_write(b"LDG 4\r").await;
    harness.expect_and_respond(b"LDG\r", b"4\r").await;

    task.await.unwrap().unwrap();
    let state = laser.state();
    assert!(state.enabled);
    assert_eq!(state.pulse_mode, PulseMode::Gating);
}

#[tokio::test]
async fn current_is_rounded_and_verified() {
    let (laser, mut harness) = attach();

    let setter = Arc::clone(&laser);
    let task = tokio::spawn(async move { setter.set_current_ma(1_250.4).await });

    harness.expect_write(b"LDS 1250\r").await;
    harness.expect_and_respond(b"LDS\r", b"1250\r").await;

    task.await.unwrap().unwrap();
    assert_eq!(laser.state().current_ma, 1_250.0);
}

// =============================================================================
// Queries
// =============================================================================

#[tokio::test]
async fn reply_split_across_reads() {
    let (laser, mut harness) = attach();

    let querier = Arc::clone(&laser);
    let task = tokio::spawn(async move { querier.query_frequency_hz().await });

    harness.expect_write(b"LDF\r").await;
    harness
        .send_bytewise(b"25000\r", Duration::from_millis(1))
        .await
        .unwrap();

    assert_eq!(task.await.unwrap().unwrap(), 40_000.0);
}

#[tokio::test]
async fn stale_lines_are_discarded_before_a_query() {
    let (laser, mut harness) = attach();

    harness.send_response(b"leftover\r").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let querier = Arc::clone(&laser);
    let task = tokio::spawn(async move { querier.query_power_mw().await });
    harness.expect_and_respond(b"HMP\r", b"812.5\r").await;

    assert_eq!(task.await.unwrap().unwrap(), 812.5);
    assert_eq!(laser.state().power_mw, 812.5);
}

#[tokio::test]
async fn missing_or_blank_reply_is_empty_response() {
    let (laser, mut harness) = attach();

    let querier = Arc::clone(&laser);
    let task = tokio::spawn(async move { querier.query_operation_hours().await });
    harness.expect_write(b"HTR\r").await;
    assert!(matches!(
        task.await.unwrap(),
        Err(ScanError::EmptyResponse { command }) if command == "HTR"
    ));

    let querier = Arc::clone(&laser);
    let task = tokio::spawn(async move { querier.query_operation_hours().await });
    harness.expect_and_respond(b"HTR\r", b"\r").await;
    assert!(matches!(
        task.await.unwrap(),
        Err(ScanError::EmptyResponse { .. })
    ));
}

#[tokio::test]
async fn update_status_reads_register_power_and_temperatures() {
    let (laser, mut harness) = attach();

    let querier = Arc::clone(&laser);
    let task = tokio::spawn(async move { querier.update_status().await });

    harness.expect_and_respond(b"LER\r", b"5\r").await;
    harness.expect_and_respond(b"HMP\r", b"1500\r").await;
    harness.expect_and_respond(b"LTA\r", b"25300\r").await;
    harness.expect_and_respond(b"LMA\r", b"40100\r").await;
    harness.expect_and_respond(b"EOA\r", b"30000\r").await;
    harness.expect_and_respond(b"LTT\r", b"35500\r").await;

    let state = task.await.unwrap().unwrap();
    assert!(state.has_errors());
    assert_eq!(state.status.active_bits(), vec![0, 2]);
    assert_eq!(state.power_mw, 1500.0);
    assert_eq!(state.temperatures.pump_diode_c, 25.3);
    assert_eq!(state.temperatures.resonator_c, 40.1);
    assert_eq!(state.temperatures.q_switch_c, 30.0);
    assert_eq!(state.temperatures.power_stage_c, 35.5);
}

#[tokio::test]
async fn single_temperature_query() {
    let (laser, mut harness) = attach();

    let querier = Arc::clone(&laser);
    let task =
        tokio::spawn(async move { querier.query_temperature(TemperatureSensor::QSwitch).await });
    harness.expect_and_respond(b"EOA\r", b"29950\r").await;

    assert_eq!(task.await.unwrap().unwrap(), 29.95);
}

#[tokio::test]
async fn clear_commands_carry_zero() {
    let (laser, mut harness) = attach();

    laser.clear_status().await.unwrap();
    harness.expect_write(b"LCE 0\r").await;
    laser.clear_errors().await.unwrap();
    harness.expect_write(b"CCE 0\r").await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn initialize_reads_serials_and_tolerates_a_silent_query() {
    let (laser, mut harness) = attach();

    let init = Arc::clone(&laser);
    let task = tokio::spawn(async move { init.initialize().await });

    harness.expect_and_respond(b"CSR\r", b"HC-1042\r").await;
    // HSR goes unanswered and times out
    harness.expect_write(b"HSR\r").await;
    harness.expect_and_respond(b"LDO\r", b"0\r").await;
    harness.expect_and_respond(b"LDF\r", b"16000\r").await;
    harness.expect_and_respond(b"LER\r", b"0\r").await;

    task.await.unwrap().unwrap();
    let state = laser.state();
    assert_eq!(state.controller_serial, "HC-1042");
    assert!(state.head_serial.is_empty());
    assert!(!state.enabled);
    assert_eq!(state.frequency_hz, 62_500.0);
    assert!(!state.has_errors());
}

#[tokio::test]
async fn disconnect_disables_emission_first() {
    let (laser, mut harness) = attach();

    let closer = Arc::clone(&laser);
    let task = tokio::spawn(async move { closer.disconnect().await });

    harness.expect_write(b"LDO 0\r").await;
    harness.expect_and_respond(b"LDO\r", b"0\r").await;

    task.await.unwrap().unwrap();
    assert!(!laser.is_connected());
    laser.disconnect().await.unwrap();
    assert!(matches!(
        laser.query_status().await,
        Err(ScanError::Disconnected { .. })
    ));
}

#[tokio::test]
async fn unplugged_laser_fails_queries() {
    let (laser, harness) = attach();
    drop(harness);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while laser.is_connected() {
        assert!(tokio::time::Instant::now() < deadline, "link never went down");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert!(matches!(
        laser.query_frequency_hz().await,
        Err(ScanError::Disconnected { .. })
    ));
}

#[tokio::test]
async fn factory_reset_refused_while_enabled() {
    let (laser, mut harness) = attach();

    let resetter = Arc::clone(&laser);
    let task = tokio::spawn(async move { resetter.restore_factory_settings().await });
    harness.expect_and_respond(b"LDO\r", b"1\r").await;

    assert!(matches!(
        task.await.unwrap(),
        Err(ScanError::Interlock(_))
    ));
    harness.expect_silence(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn factory_reset_when_disabled() {
    let (laser, mut harness) = attach();

    let resetter = Arc::clone(&laser);
    let task = tokio::spawn(async move { resetter.restore_factory_settings().await });
    harness.expect_and_respond(b"LDO\r", b"0\r").await;
    harness.expect_write(b"HPR\r").await;

    task.await.unwrap().unwrap();
}
