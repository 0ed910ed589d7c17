use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use froth_core::detect::OUTLINE;
use froth_core::mocks::RecordingSink;
use froth_core::pipeline::SharedDriver;
use froth_core::{
    AcquisitionError, ActuatorDriver, BuildError, Channel, ChannelPins, ControlCfg, ControlError,
    ControlHandle, ControlLoop, ControlParams, EstopReason, FrameQueue, FrothCfg, FrothError,
    FrothMetrics, LatestSlot, MetricsQueue, Mode, PiController, Pipeline, SafetySupervisor,
    SharedState, SourceCfg, TickOutcome,
};
use froth_hardware::sim::{SimulatedCamera, SimulatedPwm};
use froth_segment::ImageprocSegmentation;
use froth_traits::clock::test_clock::TestClock;
use rstest::{fixture, rstest};

// ── Control loop against a simulated bus ─────────────────────────────────────

struct Rig {
    clock: TestClock,
    probe: SimulatedPwm,
    latest: Arc<LatestSlot<FrothMetrics>>,
    handle: ControlHandle,
    control: ControlLoop<SimulatedPwm>,
}

fn counted(n: u32) -> FrothMetrics {
    FrothMetrics {
        bubble_count: n,
        ..FrothMetrics::empty(1)
    }
}

#[fixture]
fn rig() -> Rig {
    let clock = TestClock::new();
    let bus = SimulatedPwm::new();
    let probe = bus.probe();
    let driver: SharedDriver<SimulatedPwm> = Arc::new(Mutex::new(
        ActuatorDriver::start(bus, ChannelPins::default()).expect("start"),
    ));
    let safety = Arc::new(SafetySupervisor::with_clock(
        Duration::from_secs(5),
        Arc::new(clock.clone()),
    ));
    let d = driver.clone();
    safety.register_stop_callback(move || {
        d.lock().expect("driver").stop_all();
    });
    let shared = Arc::new(SharedState::new(
        ControlParams::from(&ControlCfg::default()),
        safety.state(),
    ));
    let latest = Arc::new(LatestSlot::new());
    let control = ControlLoop::new(
        PiController::new(0.5, 0.05, 120.0),
        driver,
        safety.clone(),
        shared.clone(),
        latest.clone(),
    );
    let handle = ControlHandle::new(
        shared,
        safety,
        latest.clone(),
        FrameQueue::new(1),
        MetricsQueue::new(10),
    );
    Rig {
        clock,
        probe,
        latest,
        handle,
        control,
    }
}

#[rstest]
fn auto_tick_drives_frother_from_bubble_count(mut rig: Rig) {
    rig.latest.store(counted(80));
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 22.0 });
    assert_eq!(rig.probe.duty(12), Some(22.0));
    // auxiliaries at their configured request
    for pin in 13..=15 {
        assert_eq!(rig.probe.duty(pin), Some(50.0));
    }
    let snap = rig.handle.snapshot();
    assert_eq!(snap.control.integral, 40.0);
    assert_eq!(snap.devices.get(Channel::Frother), 22.0);
    assert!(snap.safety.last_control_heartbeat >= snap.safety.last_sense_heartbeat);
}

#[rstest]
fn auto_without_metrics_holds_frother_off(mut rig: Rig) {
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 0.0 });
    assert_eq!(rig.probe.duty(12), Some(0.0));
    assert_eq!(rig.control.pi().integral(), 0.0);
}

#[rstest]
fn manual_mode_uses_manual_duty(mut rig: Rig) {
    rig.latest.store(counted(10));
    rig.handle.set_mode(Mode::Manual);
    rig.handle.set_manual_duty(35.0).expect("in range");
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 35.0 });
    assert_eq!(rig.probe.duty(12), Some(35.0));
    assert_eq!(rig.handle.control_state().mode, Mode::Manual);
}

#[rstest]
fn returning_to_auto_clears_the_integral(mut rig: Rig) {
    rig.latest.store(counted(80));
    rig.control.tick(1.0);
    assert_eq!(rig.control.pi().integral(), 40.0);

    rig.handle.set_mode(Mode::Manual);
    rig.control.tick(1.0);
    assert_eq!(rig.control.pi().integral(), 40.0);

    rig.handle.set_mode(Mode::Auto);
    rig.latest.store(counted(120));
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 0.0 });
    assert_eq!(rig.control.pi().integral(), 0.0);
}

#[rstest]
fn auto_after_emergency_stop_starts_from_a_clean_integral(mut rig: Rig) {
    rig.latest.store(counted(80));
    rig.control.tick(1.0);
    assert_eq!(rig.control.pi().integral(), 40.0);

    rig.handle.emergency_stop();
    assert_eq!(rig.control.tick(1.0), TickOutcome::Stopped);
    rig.handle.set_mode(Mode::Auto);
    rig.handle.reset_estop();

    rig.latest.store(counted(120));
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 0.0 });
    assert_eq!(rig.control.pi().integral(), 0.0);
    assert_eq!(rig.handle.control_state().integral, 0.0);
}

#[rstest]
fn mode_toggle_between_ticks_still_clears_the_integral(mut rig: Rig) {
    rig.latest.store(counted(80));
    rig.control.tick(1.0);
    assert_eq!(rig.control.pi().integral(), 40.0);

    // the loop never sees MANUAL
    rig.handle.set_mode(Mode::Manual);
    rig.handle.set_mode(Mode::Auto);

    rig.latest.store(counted(120));
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 0.0 });
    assert_eq!(rig.control.pi().integral(), 0.0);
}

#[rstest]
fn repeated_auto_requests_keep_the_integral(mut rig: Rig) {
    rig.latest.store(counted(80));
    rig.control.tick(1.0);
    rig.handle.set_mode(Mode::Auto);
    rig.control.tick(1.0);
    // 40 + 40, held at the anti-windup bound
    assert_eq!(rig.control.pi().integral(), 50.0);
}

#[rstest]
fn setpoint_change_applies_next_tick(mut rig: Rig) {
    rig.latest.store(counted(100));
    rig.handle.set_setpoint(100.0).expect("in range");
    rig.handle.set_gains(1.0, 0.0).expect("in range");
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 0.0 });
    rig.handle.set_setpoint(130.0).expect("in range");
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 30.0 });
    assert_eq!(rig.handle.control_state().setpoint, 130.0);
}

#[rstest]
fn emergency_stop_blocks_ticks_until_reset(mut rig: Rig) {
    rig.latest.store(counted(80));
    rig.control.tick(1.0);
    assert!(rig.probe.duty(12).is_some_and(|d| d > 0.0));

    assert!(rig.handle.emergency_stop());
    assert!(!rig.handle.emergency_stop());
    for pin in 12..=15 {
        assert_eq!(rig.probe.duty(pin), Some(0.0), "pin {pin}");
    }
    assert_eq!(rig.control.tick(1.0), TickOutcome::Stopped);
    for pin in 12..=15 {
        assert_eq!(rig.probe.duty(pin), Some(0.0), "pin {pin}");
    }
    let snap = rig.handle.snapshot();
    assert!(snap.safety.estop_active);
    assert_eq!(snap.safety.estop_reason, Some(EstopReason::External));
    assert_eq!(snap.control.mode, Mode::Manual);
    assert!(snap.devices.all_zero());

    // nothing restarts after the reset until the operator asks for it
    rig.handle.reset_estop();
    assert!(!rig.handle.is_estopped());
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 0.0 });
    for pin in 12..=15 {
        assert_eq!(rig.probe.duty(pin), Some(0.0), "pin {pin}");
    }
}

#[rstest]
fn stale_sense_heartbeat_stops_the_tick(mut rig: Rig) {
    rig.latest.store(counted(80));
    rig.control.tick(1.0);
    rig.clock.advance(Duration::from_secs(6));
    assert_eq!(rig.control.tick(1.0), TickOutcome::Stopped);
    assert_eq!(
        rig.handle.safety_state().estop_reason,
        Some(EstopReason::SenseStall)
    );
    assert_eq!(rig.probe.duty(12), Some(0.0));
}

#[rstest]
fn write_failure_does_not_stop_other_channels(mut rig: Rig) {
    rig.probe.fail_pin(13);
    rig.handle.set_mode(Mode::Manual);
    rig.handle.set_manual_duty(20.0).expect("in range");
    assert_eq!(rig.control.tick(1.0), TickOutcome::Applied { frother: 20.0 });
    assert_eq!(rig.probe.duty(14), Some(50.0));
    // the clamped request is still what the state reports
    assert_eq!(rig.handle.device_state().get(Channel::Agitator), 50.0);
}

// ── Control handle validation ────────────────────────────────────────────────

#[rstest]
#[case(-1.0)]
#[case(500.5)]
#[case(f64::NAN)]
fn setpoint_out_of_range_is_rejected(rig: Rig, #[case] sp: f64) {
    let err = rig.handle.set_setpoint(sp).expect_err("rejected");
    assert!(matches!(err, ControlError::OutOfRange { field: "setpoint", .. }));
    assert_eq!(rig.handle.control_state().setpoint, 120.0);
}

#[rstest]
fn gains_are_checked_together(rig: Rig) {
    assert!(rig.handle.set_gains(11.0, 0.1).is_err());
    assert!(rig.handle.set_gains(1.0, 2.0).is_err());
    let st = rig.handle.control_state();
    assert_eq!((st.kp, st.ki), (0.5, 0.05));
    rig.handle.set_gains(10.0, 1.0).expect("bounds inclusive");
    let st = rig.handle.control_state();
    assert_eq!((st.kp, st.ki), (10.0, 1.0));
}

#[rstest]
fn frother_duty_belongs_to_the_controller_in_auto(mut rig: Rig) {
    assert_eq!(
        rig.handle.set_device_duty(Channel::Frother, 10.0),
        Err(ControlError::FrotherInAuto)
    );
    rig.handle.set_mode(Mode::Manual);
    rig.handle
        .set_device_duty(Channel::Frother, 10.0)
        .expect("manual mode");
    assert_eq!(rig.handle.control_state().manual_duty_cycle, 10.0);

    rig.handle
        .set_device_duty(Channel::Agitator, 70.0)
        .expect("in range");
    assert!(rig.handle.set_device_duty(Channel::FeedPump, 120.0).is_err());
    rig.control.tick(1.0);
    assert_eq!(rig.probe.duty(12), Some(10.0));
    assert_eq!(rig.probe.duty(13), Some(70.0));
}

#[rstest]
fn manual_duty_range(rig: Rig) {
    assert!(rig.handle.set_manual_duty(100.0).is_ok());
    assert!(rig.handle.set_manual_duty(100.1).is_err());
    assert!(rig.handle.set_manual_duty(-0.1).is_err());
}

#[rstest]
#[case("auto", Mode::Auto)]
#[case("MANUAL", Mode::Manual)]
#[case("Manual", Mode::Manual)]
fn modes_parse(#[case] s: &str, #[case] mode: Mode) {
    assert_eq!(s.parse::<Mode>().expect("mode"), mode);
    assert_eq!(mode.to_string(), mode.as_str());
}

// ── Threaded pipeline ────────────────────────────────────────────────────────

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(10));
    }
}

fn fast_cfg() -> FrothCfg {
    let mut cfg = FrothCfg::default();
    cfg.source = SourceCfg {
        read_timeout: Duration::from_millis(20),
        max_retries: 2,
        retry_backoff: Duration::from_millis(10),
    };
    cfg.pipeline.sense_rate_hz = 40.0;
    cfg.pipeline.control_rate_hz = 20.0;
    cfg.safety.watchdog_timeout = Duration::from_millis(750);
    cfg
}

fn camera() -> SimulatedCamera {
    SimulatedCamera::new(160, 120, 6)
        .with_seed(11)
        .with_radius_range(8, 12)
}

#[test]
fn pipeline_runs_and_shuts_down_in_order() {
    let cam = camera();
    let faults = cam.faults();
    let bus = SimulatedPwm::new();
    let probe = bus.probe();
    let mut pipeline = Pipeline::builder()
        .with_config(fast_cfg())
        .with_camera(cam)
        .with_bus(bus)
        .with_segmentation(ImageprocSegmentation::new())
        .start()
        .expect("start");
    let handle = pipeline.handle();

    wait_until("metrics", || handle.metrics().is_some());
    let m = handle.metrics().expect("metrics");
    assert!(m.bubble_count > 0 && m.bubble_count <= 6, "count {}", m.bubble_count);
    assert!((0.0..=1.0).contains(&m.froth_stability));

    let frames = handle.frames();
    wait_until("frame", || !frames.is_empty());
    let frame = frames.try_recv().expect("frame");
    assert_eq!(frame.image.dimensions(), (160, 120));

    // AUTO with far fewer bubbles than the setpoint: frother comes on
    wait_until("frother duty", || probe.duty(12).is_some_and(|d| d > 0.0));
    wait_until("snapshot", || handle.snapshot().sense_healthy);

    assert!(pipeline.shutdown().is_empty());
    assert!(probe.claimed_pins().is_empty());
    assert!(probe.is_closed());
    assert_eq!(faults.releases(), 1);
    let snap = handle.snapshot();
    assert!(!snap.sense_healthy);
    assert!(snap.devices.all_zero());
    assert!(!snap.safety.estop_active);

    // idempotent
    assert!(pipeline.shutdown().is_empty());
    assert_eq!(faults.releases(), 1);
}

#[rstest]
#[case::annotated(true)]
#[case::raw(false)]
fn streamed_frames_follow_the_annotation_switch(#[case] annotate: bool) {
    let mut cfg = fast_cfg();
    cfg.pipeline.annotate_frames = annotate;
    let mut pipeline = Pipeline::builder()
        .with_config(cfg)
        .with_camera(camera())
        .with_bus(SimulatedPwm::new())
        .with_segmentation(ImageprocSegmentation::new())
        .start()
        .expect("start");
    let handle = pipeline.handle();
    wait_until("bubbles", || handle.metrics().is_some_and(|m| m.bubble_count > 0));
    let frames = handle.frames();
    // a frame analysed after bubbles were first seen
    let seen = handle.metrics().expect("metrics").seq;
    let frame = loop {
        wait_until("frame", || !frames.is_empty());
        let f = frames.try_recv().expect("frame");
        if f.seq > seen {
            break f;
        }
    };
    pipeline.shutdown();

    let outlined = frame.image.pixels().any(|p| *p == OUTLINE);
    let all_grey = frame.image.pixels().all(|p| p[0] == p[1] && p[1] == p[2]);
    assert_eq!(outlined, annotate);
    assert_eq!(all_grey, !annotate);
}

#[test]
fn operator_emergency_stop_zeroes_every_channel() {
    let bus = SimulatedPwm::new();
    let probe = bus.probe();
    let pipeline = Pipeline::builder()
        .with_config(fast_cfg())
        .with_camera(camera())
        .with_bus(bus)
        .with_segmentation(ImageprocSegmentation::new())
        .start()
        .expect("start");
    let handle = pipeline.handle();
    wait_until("frother duty", || probe.duty(12).is_some_and(|d| d > 0.0));

    assert!(handle.emergency_stop());
    for pin in 12..=15 {
        assert_eq!(probe.duty(pin), Some(0.0), "pin {pin}");
    }
    thread::sleep(Duration::from_millis(200));
    for pin in 12..=15 {
        assert_eq!(probe.duty(pin), Some(0.0), "pin {pin} after stop");
    }
    let snap = handle.snapshot();
    assert!(snap.safety.estop_active);
    assert!(snap.devices.all_zero());

    handle.reset_estop();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(probe.duty(12), Some(0.0));
    handle.set_mode(Mode::Auto);
    wait_until("frother back on", || probe.duty(12).is_some_and(|d| d > 0.0));
}

#[test]
fn camera_loss_trips_the_watchdog() {
    let cam = camera();
    let faults = cam.faults();
    let bus = SimulatedPwm::new();
    let probe = bus.probe();
    let pipeline = Pipeline::builder()
        .with_config(fast_cfg())
        .with_camera(cam)
        .with_bus(bus)
        .with_segmentation(ImageprocSegmentation::new())
        .start()
        .expect("start");
    let handle = pipeline.handle();
    wait_until("metrics", || handle.metrics().is_some());

    faults.set_fail_open(true);
    faults.fail_next_reads(1);
    wait_until("estop", || handle.is_estopped());
    assert_eq!(
        handle.safety_state().estop_reason,
        Some(EstopReason::SenseStall)
    );
    for pin in 12..=15 {
        assert_eq!(probe.duty(pin), Some(0.0), "pin {pin}");
    }
    assert!(!handle.snapshot().sense_healthy);
}

#[test]
fn sink_sees_every_accepted_record_in_order() {
    let sink = RecordingSink::new();
    let seen = sink.clone();
    let mut pipeline = Pipeline::builder()
        .with_config(fast_cfg())
        .with_camera(camera())
        .with_bus(SimulatedPwm::new())
        .with_segmentation(ImageprocSegmentation::new())
        .with_sink(sink)
        .start()
        .expect("start");
    wait_until("sink records", || seen.seen().len() >= 3);
    pipeline.shutdown();
    let seqs = seen.seen();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "{seqs:?}");
}

#[test]
fn failing_sink_does_not_stall_sensing() {
    let sink = RecordingSink::failing();
    let seen = sink.clone();
    let pipeline = Pipeline::builder()
        .with_config(fast_cfg())
        .with_camera(camera())
        .with_bus(SimulatedPwm::new())
        .with_segmentation(ImageprocSegmentation::new())
        .with_sink(sink)
        .start()
        .expect("start");
    let handle = pipeline.handle();
    wait_until("sink attempts", || seen.seen().len() >= 3);
    wait_until("later metrics", || {
        handle.metrics().is_some_and(|m| m.seq > 5)
    });
    assert!(!handle.is_estopped());
}

#[test]
fn bounded_streams_replace_and_drop() {
    let mut cfg = fast_cfg();
    cfg.pipeline.frame_capacity = 1;
    cfg.pipeline.metrics_capacity = 2;
    let pipeline = Pipeline::builder()
        .with_config(cfg)
        .with_camera(camera())
        .with_bus(SimulatedPwm::new())
        .with_segmentation(ImageprocSegmentation::new())
        .start()
        .expect("start");
    let handle = pipeline.handle();
    wait_until("frame replaced", || handle.frames_replaced() > 0);
    wait_until("metrics dropped", || handle.metrics_dropped() > 0);
    assert!(handle.frames().len() <= 1);
    assert_eq!(handle.metrics_stream().len(), 2);
}

// ── Builder errors ───────────────────────────────────────────────────────────

#[test]
fn missing_pieces_are_reported() {
    let err = Pipeline::builder().try_start().err().expect("no camera");
    assert_eq!(err.downcast_ref::<BuildError>(), Some(&BuildError::MissingCamera));

    let err = Pipeline::builder()
        .with_camera(camera())
        .try_start()
        .err()
        .expect("no bus");
    assert_eq!(err.downcast_ref::<BuildError>(), Some(&BuildError::MissingBus));

    let err = Pipeline::builder()
        .with_camera(camera())
        .with_bus(SimulatedPwm::new())
        .try_start()
        .err()
        .expect("no segmentation");
    assert_eq!(
        err.downcast_ref::<BuildError>(),
        Some(&BuildError::MissingSegmentation)
    );
}

#[rstest]
#[case::zero_sense_rate(|c: &mut FrothCfg| c.pipeline.sense_rate_hz = 0.0)]
#[case::nan_control_rate(|c: &mut FrothCfg| c.pipeline.control_rate_hz = f64::NAN)]
#[case::watchdog_too_short(|c: &mut FrothCfg| c.safety.watchdog_timeout = Duration::from_millis(10))]
#[case::empty_history(|c: &mut FrothCfg| c.analyzer.history = 0)]
#[case::threshold_one(|c: &mut FrothCfg| c.detector.distance_threshold = 1.0)]
#[case::even_background_kernel(|c: &mut FrothCfg| c.detector.background_kernel = 2)]
fn invalid_config_is_rejected(#[case] tweak: fn(&mut FrothCfg)) {
    let mut cfg = fast_cfg();
    tweak(&mut cfg);
    let cam = camera();
    let faults = cam.faults();
    let err = Pipeline::builder()
        .with_config(cfg)
        .with_camera(cam)
        .with_bus(SimulatedPwm::new())
        .with_segmentation(ImageprocSegmentation::new())
        .start()
        .err()
        .expect("rejected");
    assert!(matches!(
        err.downcast_ref::<BuildError>(),
        Some(BuildError::InvalidConfig(_))
    ));
    // rejected before touching hardware
    assert_eq!(faults.opens(), 0);
}

#[test]
fn camera_that_never_opens_claims_no_pins() {
    let cam = camera();
    cam.faults().set_fail_open(true);
    let bus = SimulatedPwm::new();
    let probe = bus.probe();
    let err = Pipeline::builder()
        .with_config(fast_cfg())
        .with_camera(cam)
        .with_bus(bus)
        .with_segmentation(ImageprocSegmentation::new())
        .start()
        .err()
        .expect("open fails");
    assert!(matches!(
        err.downcast_ref::<FrothError>(),
        Some(FrothError::Acquisition(AcquisitionError::OpenFailed { attempts: 2, .. }))
    ));
    assert_eq!(probe.claims(), 0);
}

#[test]
fn actuator_failure_releases_the_camera() {
    let cam = camera();
    let faults = cam.faults();
    let bus = SimulatedPwm::new();
    bus.fail_claim(13);
    let err = Pipeline::builder()
        .with_config(fast_cfg())
        .with_camera(cam)
        .with_bus(bus)
        .with_segmentation(ImageprocSegmentation::new())
        .start()
        .err()
        .expect("claim fails");
    assert!(matches!(
        err.downcast_ref::<FrothError>(),
        Some(FrothError::Startup(_))
    ));
    assert_eq!(faults.opens(), 1);
    assert_eq!(faults.releases(), 1);
}
