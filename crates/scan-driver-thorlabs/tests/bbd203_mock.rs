//! BBD203 driver against a scripted controller on a mock serial port.
//!
//! Covers the connect handshake, stream framing, the readiness rules, move
//! encoding and completion, set-and-verify, callbacks and link loss.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use scan_core::mock_serial::{self, MockDeviceHarness};
use scan_core::{ScanError, VerifyPolicy, WaitOptions};
use scan_driver_thorlabs::apt::{build_header_only, build_with_data, MessageId, StatusUpdate, VelocityParams};
use scan_driver_thorlabs::{Bbd203Config, Bbd203Driver, StatusBits};

const REQ_HW_INFO: [u8; 6] = [0x05, 0x00, 0x00, 0x00, 0x50, 0x01];
const START_UPDATES: [u8; 6] = [0x11, 0x00, 0x00, 0x00, 0x11, 0x01];
const STOP_UPDATES: [u8; 6] = [0x12, 0x00, 0x00, 0x00, 0x11, 0x01];

// =============================================================================
// Helpers
// =============================================================================

fn fast_config() -> Bbd203Config {
    Bbd203Config {
        verify: VerifyPolicy::new(Duration::from_millis(20), Duration::from_millis(10)),
        handshake_delay_ms: 5,
        move_poll_ms: 2,
        home_poll_ms: 2,
        move_timeout_ms: 2_000,
        home_timeout_ms: 2_000,
        shutdown_timeout_ms: 500,
        ..Bbd203Config::default()
    }
}

async fn connect() -> (Arc<Bbd203Driver>, MockDeviceHarness) {
    let (port, mut harness) = mock_serial::new();
    let driver = Bbd203Driver::from_port(Box::new(port), "mock-bbd203", fast_config())
        .await
        .unwrap();
    harness.expect_write(&REQ_HW_INFO).await;
    harness.expect_write(&START_UPDATES).await;
    (Arc::new(driver), harness)
}

fn status_frame(channel: u8, position: i32, status: StatusBits) -> Vec<u8> {
    let update = StatusUpdate {
        channel: 1,
        position,
        encoder: position,
        status,
    };
    build_with_data(
        MessageId::MotGetStatusUpdate.value(),
        0x20 + channel,
        &update.to_bytes(),
        0x01,
    )
}

fn header_frame(id: MessageId, channel: u8) -> [u8; 6] {
    build_header_only(id.value(), 0x01, 0x00, 0x20 + channel, 0x01)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

async fn make_ready(driver: &Bbd203Driver, harness: &MockDeviceHarness, channel: u8) {
    harness
        .send_response(&status_frame(channel, 0, StatusBits::HOMED | StatusBits::MOTOR_ENABLED))
        .unwrap();
    eventually("channel ready", || driver.is_ready(channel).unwrap()).await;
}

// =============================================================================
// Connection
// =============================================================================

#[tokio::test]
async fn connect_requests_hardware_info_and_stores_reply() {
    let (driver, harness) = connect().await;
    assert!(driver.is_connected());
    assert!(driver.hardware_info().is_none());

    let mut payload = vec![0u8; 84];
    payload[0..4].copy_from_slice(&83_812_345u32.to_le_bytes());
    payload[4..10].copy_from_slice(b"BBD203");
    payload[14] = 1;
    payload[15] = 4;
    payload[16] = 2;
    payload[82..84].copy_from_slice(&3u16.to_le_bytes());
    harness
        .send_response(&build_with_data(0x0006, 0x01, &payload, 0x50))
        .unwrap();

    eventually("hardware info", || driver.hardware_info().is_some()).await;
    let info = driver.hardware_info().unwrap();
    assert_eq!(info.serial_number, 83_812_345);
    assert_eq!(info.model, "BBD203");
    assert_eq!(info.firmware(), "2.4.1");
    assert_eq!(info.channel_count, 3);
}

#[tokio::test]
async fn disconnect_stops_updates_and_is_idempotent() {
    let (driver, mut harness) = connect().await;

    driver.disconnect().await.unwrap();
    harness.expect_write(&STOP_UPDATES).await;
    assert!(!driver.is_connected());

    driver.disconnect().await.unwrap();
    assert!(matches!(
        driver.request_status_update(1).await,
        Err(ScanError::Disconnected { .. })
    ));
}

// =============================================================================
// Framing and state
// =============================================================================

#[tokio::test]
async fn status_split_across_reads_makes_channel_two_ready() {
    let (driver, harness) = connect().await;

    let frame = status_frame(2, 40_000, StatusBits::HOMED | StatusBits::MOTOR_ENABLED);
    harness
        .send_bytewise(&frame, Duration::from_millis(1))
        .await
        .unwrap();

    eventually("channel 2 ready", || driver.is_ready(2).unwrap()).await;
    let ch2 = driver.status_of(2).unwrap();
    assert!(ch2.enabled && ch2.homed && !ch2.homing && !ch2.moving && !ch2.error);
    assert_eq!(ch2.position_mm, 2.0);
    assert!(!driver.is_ready(1).unwrap());
}

#[tokio::test]
async fn reply_for_unknown_channel_is_ignored() {
    let (driver, harness) = connect().await;

    let mut frame = status_frame(1, 0, StatusBits::MOTOR_ENABLED);
    frame[4] = 0x80 | 0x24;
    harness.send_response(&frame).unwrap();
    harness
        .send_response(&status_frame(3, 0, StatusBits::MOTOR_ENABLED))
        .unwrap();

    eventually("channel 3 enabled", || driver.status_of(3).unwrap().enabled).await;
    assert!(driver.channels()[..2].iter().all(|s| !s.enabled));
}

#[tokio::test]
async fn corrupted_length_drops_the_link() {
    let (driver, harness) = connect().await;

    // data flag set with a zero payload length
    harness
        .send_response(&[0x81, 0x04, 0x00, 0x00, 0xA1, 0x01])
        .unwrap();

    eventually("link down", || !driver.is_connected()).await;
    assert!(driver.link_fault().is_some());
    assert!(matches!(
        driver.move_absolute(1, 1.0, false).await,
        Err(ScanError::Disconnected { .. })
    ));
}

#[tokio::test]
async fn unplugged_device_drops_the_link() {
    let (driver, harness) = connect().await;
    drop(harness);

    eventually("link down", || !driver.is_connected()).await;
    assert!(matches!(
        driver.identify(1).await,
        Err(ScanError::Disconnected { .. })
    ));
}

// =============================================================================
// Motion
// =============================================================================

#[tokio::test]
async fn move_absolute_encodes_counts_and_waits_for_completion() {
    let (driver, mut harness) = connect().await;
    make_ready(&driver, &harness, 1).await;

    let mover = Arc::clone(&driver);
    let task = tokio::spawn(async move { mover.move_absolute(1, 10.0, true).await });

    harness
        .expect_write(&[
            0x53, 0x04, 0x06, 0x00, 0xA1, 0x01, 0x01, 0x00, 0x40, 0x0D, 0x03, 0x00,
        ])
        .await;
    assert!(driver.status_of(1).unwrap().moving);

    harness
        .send_response(&header_frame(MessageId::MotMoveCompleted, 1))
        .unwrap();
    task.await.unwrap().unwrap();
    assert!(!driver.status_of(1).unwrap().moving);
}

#[tokio::test]
async fn move_relative_encodes_negative_distance() {
    let (driver, mut harness) = connect().await;
    make_ready(&driver, &harness, 3).await;

    driver.move_relative(3, -0.5, false).await.unwrap();

    let mut expected = vec![0x48, 0x04, 0x06, 0x00, 0xA3, 0x01, 0x01, 0x00];
    expected.extend_from_slice(&(-10_000i32).to_le_bytes());
    harness.expect_write(&expected).await;
}

#[tokio::test]
async fn move_on_unready_channel_is_rejected_without_writing() {
    let (driver, mut harness) = connect().await;

    let err = driver.move_absolute(2, 5.0, false).await.unwrap_err();
    assert!(matches!(err, ScanError::NotReady(2)));
    harness.expect_silence(Duration::from_millis(50)).await;

    assert!(matches!(
        driver.move_absolute(4, 5.0, false).await,
        Err(ScanError::InvalidChannel(4))
    ));
}

#[tokio::test]
async fn non_finite_or_oversized_moves_are_rejected_without_writing() {
    let (driver, mut harness) = connect().await;
    make_ready(&driver, &harness, 1).await;

    for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 1.0e9] {
        assert!(matches!(
            driver.move_absolute(1, bad, false).await,
            Err(ScanError::OutOfRange { parameter: "position", .. })
        ));
        assert!(matches!(
            driver.move_relative(1, bad, false).await,
            Err(ScanError::OutOfRange { .. })
        ));
    }
    assert!(driver.set_position_counter(1, f64::NAN).await.is_err());

    harness.expect_silence(Duration::from_millis(50)).await;
    assert!(!driver.status_of(1).unwrap().moving);
}

#[tokio::test]
async fn idle_status_before_completion_does_not_end_move_wait() {
    let (driver, mut harness) = connect().await;
    make_ready(&driver, &harness, 1).await;

    let mover = Arc::clone(&driver);
    let task = tokio::spawn(async move { mover.move_absolute(1, 10.0, true).await });

    harness
        .expect_write(&[
            0x53, 0x04, 0x06, 0x00, 0xA1, 0x01, 0x01, 0x00, 0x40, 0x0D, 0x03, 0x00,
        ])
        .await;

    // Periodic update sent before the controller started the move
    harness
        .send_response(&status_frame(1, 0, StatusBits::HOMED | StatusBits::MOTOR_ENABLED))
        .unwrap();
    eventually("idle status applied", || !driver.status_of(1).unwrap().moving).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!task.is_finished());

    harness
        .send_response(&header_frame(MessageId::MotMoveCompleted, 1))
        .unwrap();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn wait_for_move_times_out() {
    let (driver, harness) = connect().await;
    make_ready(&driver, &harness, 1).await;
    driver.move_absolute(1, 1.0, false).await.unwrap();

    let options = WaitOptions::new(Duration::from_millis(40)).poll_every(Duration::from_millis(5));
    let err = driver.wait_for_move(1, &options).await.unwrap_err();
    assert!(matches!(err, ScanError::Timeout { .. }));
}

#[tokio::test]
async fn disconnect_cancels_pending_wait() {
    let (driver, harness) = connect().await;
    make_ready(&driver, &harness, 1).await;
    driver.move_absolute(1, 1.0, false).await.unwrap();

    let waiter = Arc::clone(&driver);
    let task = tokio::spawn(async move {
        waiter
            .wait_for_move(1, &WaitOptions::new(Duration::from_secs(10)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    driver.disconnect().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ScanError::Cancelled(_))));
}

#[tokio::test]
async fn stop_zero_stops_every_channel() {
    let (driver, mut harness) = connect().await;

    driver.stop(0, true).await.unwrap();
    for dest in [0x21, 0x22, 0x23] {
        harness
            .expect_write(&[0x65, 0x04, 0x01, 0x01, dest, 0x01])
            .await;
    }

    driver.stop(2, false).await.unwrap();
    harness
        .expect_write(&[0x65, 0x04, 0x01, 0x02, 0x22, 0x01])
        .await;
}

// =============================================================================
// Homing
// =============================================================================

#[tokio::test]
async fn home_channel_waits_for_homed_and_fires_callback() {
    let (driver, mut harness) = connect().await;

    let fired = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::clone(&fired);
    driver
        .on_home_complete(1, move |ch| f.lock().push(ch))
        .unwrap();

    let homer = Arc::clone(&driver);
    let task = tokio::spawn(async move { homer.home_channel(1, true).await });

    harness
        .expect_write(&[0x43, 0x04, 0x01, 0x00, 0x21, 0x01])
        .await;
    let s = driver.status_of(1).unwrap();
    assert!(s.homing && !s.homed);

    harness
        .send_response(&header_frame(MessageId::MotMoveHomed, 1))
        .unwrap();
    task.await.unwrap().unwrap();

    let s = driver.status_of(1).unwrap();
    assert!(s.homed && !s.homing);
    assert_eq!(*fired.lock(), vec![1]);
}

#[tokio::test]
async fn stale_homed_status_does_not_end_home_wait() {
    let (driver, mut harness) = connect().await;
    make_ready(&driver, &harness, 2).await;

    let homer = Arc::clone(&driver);
    let task = tokio::spawn(async move { homer.home_channel(2, true).await });

    harness
        .expect_write(&[0x43, 0x04, 0x01, 0x00, 0x22, 0x01])
        .await;
    harness
        .send_response(&status_frame(2, 0, StatusBits::HOMED | StatusBits::MOTOR_ENABLED))
        .unwrap();
    eventually("stale status applied", || driver.status_of(2).unwrap().homed).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!task.is_finished());

    harness
        .send_response(&header_frame(MessageId::MotMoveHomed, 2))
        .unwrap();
    task.await.unwrap().unwrap();
    assert_eq!(driver.status_of(2).unwrap().homes_finished, 1);
}

#[tokio::test]
async fn home_all_skips_disabled_channels() {
    let (driver, mut harness) = connect().await;
    assert!(driver.home_all_channels(true).await.unwrap().is_empty());

    for ch in [1, 3] {
        harness
            .send_response(&status_frame(ch, 0, StatusBits::MOTOR_ENABLED))
            .unwrap();
    }
    eventually("channels enabled", || {
        driver.status_of(1).unwrap().enabled && driver.status_of(3).unwrap().enabled
    })
    .await;

    let homer = Arc::clone(&driver);
    let task = tokio::spawn(async move { homer.home_all_channels(true).await });

    harness
        .expect_write(&[0x43, 0x04, 0x01, 0x00, 0x21, 0x01])
        .await;
    harness
        .expect_write(&[0x43, 0x04, 0x01, 0x00, 0x23, 0x01])
        .await;
    harness
        .send_response(&header_frame(MessageId::MotMoveHomed, 3))
        .unwrap();
    harness
        .send_response(&header_frame(MessageId::MotMoveHomed, 1))
        .unwrap();

    assert_eq!(task.await.unwrap().unwrap(), vec![1, 3]);
    assert!(!driver.status_of(2).unwrap().homed);
}

// =============================================================================
// Set-and-verify
// =============================================================================

#[tokio::test]
async fn enable_channel_verifies_against_status_update() {
    let (driver, mut harness) = connect().await;

    let enabler = Arc::clone(&driver);
    let task = tokio::spawn(async move { enabler.enable_channel(1, true).await });

    harness
        .expect_write(&[0x10, 0x02, 0x01, 0x01, 0x21, 0x01])
        .await;
    harness
        .expect_and_respond(
            &[0x80, 0x04, 0x01, 0x00, 0x21, 0x01],
            &status_frame(1, 0, StatusBits::MOTOR_ENABLED),
        )
        .await;

    task.await.unwrap().unwrap();
    assert!(driver.status_of(1).unwrap().enabled);
}

#[tokio::test]
async fn enable_channel_gives_up_after_three_attempts() {
    let (driver, mut harness) = connect().await;

    let enabler = Arc::clone(&driver);
    let task = tokio::spawn(async move { enabler.enable_channel(2, true).await });

    for _ in 0..3 {
        harness
            .expect_write(&[0x10, 0x02, 0x01, 0x01, 0x22, 0x01])
            .await;
        harness
            .expect_write(&[0x80, 0x04, 0x01, 0x00, 0x22, 0x01])
            .await;
    }

    let err = task.await.unwrap().unwrap_err();
    match err {
        ScanError::VerificationFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected error: {other:?}"),
    }
    harness.expect_silence(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn set_velocity_params_reads_back_limits() {
    let (driver, mut harness) = connect().await;
    let scaling = driver.scaling();

    let setter = Arc::clone(&driver);
    let task = tokio::spawn(async move { setter.set_velocity_params(1, 100.0, 500.0).await });

    let set_frame = harness.read_written(20).await;
    assert_eq!(&set_frame[..6], &[0x13, 0x04, 0x0E, 0x00, 0xA1, 0x01]);

    let reply = VelocityParams {
        channel: 1,
        min_velocity: 0,
        max_velocity: scaling.velocity_to_apt(100.0),
        acceleration: scaling.accel_to_apt(500.0),
    };
    assert_eq!(&set_frame[6..], reply.to_bytes().as_slice());

    harness
        .expect_and_respond(
            &[0x14, 0x04, 0x01, 0x00, 0x21, 0x01],
            &build_with_data(0x0415, 0xA1, &reply.to_bytes(), 0x01),
        )
        .await;

    let limits = task.await.unwrap().unwrap();
    assert!((limits.max_velocity_mm_s - 100.0).abs() < 0.01);
    assert!((limits.acceleration_mm_s2 - 500.0).abs() < 0.1);
    assert_eq!(driver.velocity_params(1).unwrap(), Some(limits));
}

#[tokio::test]
async fn velocity_out_of_range_is_rejected_without_writing() {
    let (driver, mut harness) = connect().await;

    assert!(matches!(
        driver.set_velocity_params(1, 1_000.0, 100.0).await,
        Err(ScanError::OutOfRange { parameter: "max velocity", .. })
    ));
    assert!(matches!(
        driver.set_velocity_params(1, 10.0, -1.0).await,
        Err(ScanError::OutOfRange { parameter: "acceleration", .. })
    ));
    harness.expect_silence(Duration::from_millis(50)).await;
}

// =============================================================================
// Callbacks
// =============================================================================

#[tokio::test]
async fn move_callbacks_run_in_order_and_survive_a_panic() {
    let (driver, harness) = connect().await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&log);
    driver
        .on_move_complete(1, move |_| first.lock().push("first"))
        .unwrap();
    driver
        .on_move_complete(1, |_| panic!("callback failure"))
        .unwrap();
    let third = Arc::clone(&log);
    let third_id = driver
        .on_move_complete(1, move |_| third.lock().push("third"))
        .unwrap();

    harness
        .send_response(&header_frame(MessageId::MotMoveCompleted, 1))
        .unwrap();
    eventually("callbacks", || log.lock().len() == 2).await;
    assert_eq!(*log.lock(), vec!["first", "third"]);
    assert!(driver.is_connected());

    assert!(driver.unsubscribe(third_id));
    assert!(!driver.unsubscribe(third_id));

    harness
        .send_response(&header_frame(MessageId::MotMoveCompleted, 2))
        .unwrap();
    harness
        .send_response(&header_frame(MessageId::MotMoveCompleted, 1))
        .unwrap();
    eventually("second round", || log.lock().len() == 3).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*log.lock(), vec!["first", "third", "first"]);
}
