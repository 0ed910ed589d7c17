use froth_core::PiController;
use froth_core::pi::INTEGRAL_LIMIT;
use proptest::prelude::*;
use rstest::rstest;

#[rstest]
fn bubble_count_below_setpoint_drives_frother_up() {
    // setpoint 120, measured 80, kp 0.5, ki 0.05, dt 1 s
    let mut pi = PiController::new(0.5, 0.05, 120.0);
    let out = pi.update(80.0, 1.0);
    assert_eq!(pi.last_error(), 40.0);
    assert_eq!(pi.integral(), 40.0);
    assert!((out - 22.0).abs() < 1e-12, "got {out}");
}

#[rstest]
#[case(0.0, 100.0)]
#[case(1000.0, 0.0)]
#[case(-1e6, 100.0)]
fn output_saturates(#[case] measured: f64, #[case] expected: f64) {
    let mut pi = PiController::new(2.0, 0.5, 100.0);
    assert_eq!(pi.update(measured, 1.0), expected);
}

#[rstest]
fn reset_then_at_setpoint_is_zero() {
    let mut pi = PiController::new(0.5, 0.05, 120.0);
    for _ in 0..20 {
        pi.update(10.0, 1.0);
    }
    assert!(pi.integral() > 0.0);
    pi.reset();
    assert_eq!(pi.integral(), 0.0);
    assert_eq!(pi.last_error(), 0.0);
    assert_eq!(pi.update(120.0, 0.0), 0.0);
}

#[rstest]
fn params_apply_on_next_update() {
    let mut pi = PiController::new(0.5, 0.0, 100.0);
    assert_eq!(pi.update(90.0, 1.0), 5.0);
    pi.set_params(Some(1.0), None, Some(110.0));
    assert_eq!(pi.kp(), 1.0);
    assert_eq!(pi.setpoint(), 110.0);
    assert_eq!(pi.update(90.0, 1.0), 20.0);
}

#[rstest]
fn custom_integral_limit() {
    let mut pi = PiController::new(0.0, 1.0, 100.0).with_integral_limit(10.0);
    pi.update(0.0, 5.0);
    assert_eq!(pi.integral(), 10.0);
    let mut ignored = PiController::new(0.0, 1.0, 100.0).with_integral_limit(f64::NAN);
    ignored.update(0.0, 5.0);
    assert_eq!(ignored.integral(), INTEGRAL_LIMIT);
}

fn measurement() -> impl Strategy<Value = f64> {
    prop_oneof![
        8 => -1e4f64..1e4,
        1 => Just(f64::NAN),
        1 => Just(f64::INFINITY),
    ]
}

fn step() -> impl Strategy<Value = f64> {
    prop_oneof![
        8 => 0.0f64..10.0,
        1 => Just(-1.0),
        1 => Just(f64::NAN),
    ]
}

proptest! {
    #[test]
    fn output_and_integral_stay_bounded(
        kp in 0.0f64..10.0,
        ki in 0.0f64..1.0,
        setpoint in 0.0f64..500.0,
        steps in proptest::collection::vec((measurement(), step()), 1..200),
    ) {
        let mut pi = PiController::new(kp, ki, setpoint);
        for (m, dt) in steps {
            let out = pi.update(m, dt);
            prop_assert!((0.0..=100.0).contains(&out), "output {out}");
            prop_assert!((-INTEGRAL_LIMIT..=INTEGRAL_LIMIT).contains(&pi.integral()));
        }
    }
}
