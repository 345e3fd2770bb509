use std::sync::Arc;
use std::time::Duration;

use peristaltic_core::config::DeviceConfig;
use peristaltic_core::controller::Controller;
use peristaltic_core::motor::{MAX_STEPS, MAX_STEP_INTERVAL};
use peristaltic_core::protocol::{Access, Frame, Parameter, ProtocolError, COMMAND_TABLE};
use peristaltic_core::pump::{Direction, Pump, PumpError, PumpPhase};
use peristaltic_core::sim::{SimConfig, SimulatedDevice};

fn test_config() -> DeviceConfig {
    let mut config = DeviceConfig::for_port("sim");
    config.transport.inter_byte_timeout_ms = 50;
    config.transport.response_timeout_ms = 1000;
    config
}

async fn connect(sim: SimConfig, config: DeviceConfig) -> (SimulatedDevice, Controller) {
    let (device, link) = SimulatedDevice::spawn(sim).unwrap();
    let mut controller = Controller::new(config);
    controller.connect_with(Box::new(link)).await.unwrap();
    (device, controller)
}

fn pump(controller: &Controller, channel: usize) -> Arc<Pump> {
    controller.pump(channel).unwrap().clone()
}

fn set_id(channel: usize, parameter: Parameter) -> u8 {
    COMMAND_TABLE
        .channel_command(channel, parameter, Access::Set)
        .unwrap()
        .id
}

/// Set commands received by the simulator as (parameter, value)
fn writes(device: &SimulatedDevice) -> Vec<(Parameter, u32)> {
    device
        .received()
        .iter()
        .filter_map(|frame: &Frame| {
            let entry = COMMAND_TABLE.by_id(frame.id)?;
            (entry.access == Access::Set).then(|| (entry.parameter, frame.value(entry.width)))
        })
        .collect()
}

#[tokio::test]
async fn test_connect_mirrors_controller_registers() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 0);
    let state = pump.state();

    assert!(!state.running);
    assert!(!state.enabled);
    assert_eq!(state.step_interval, device.motor(0).step_interval);
    assert_eq!(state.direction, Direction::CounterClockwise);
    assert!(state.variable_microstepping);
    assert_eq!(state.microsteps, 1);
}

#[tokio::test]
async fn test_pump_volume_blocking_completes() {
    let sim = SimConfig {
        time_scale: 100.0,
        ..Default::default()
    };
    let (device, controller) = connect(sim, test_config()).await;
    let pump = pump(&controller, 0);
    device.clear_received();

    pump.pump_volume(60.0, 12.0, Some(Direction::Clockwise), true)
        .await
        .unwrap();

    assert_eq!(
        writes(&device),
        vec![
            (Parameter::Enabled, 1),
            (Parameter::Direction, 1),
            (Parameter::FiniteMode, 1),
            (Parameter::StepInterval, 25_000),
            (Parameter::Steps, 200),
            (Parameter::Running, 1),
        ]
    );
    assert!(!pump.is_running());
    assert_eq!(pump.rpm(), 12.0);
    assert_eq!(pump.remaining_volume_ul().await.unwrap(), 0.0);
    assert_eq!(pump.target_volume_ul().await.unwrap(), 60.0);

    let motor = device.motor(0);
    assert_eq!(motor.steps, 0);
    assert_eq!(motor.target_steps, 200);
}

#[tokio::test]
async fn test_out_of_range_requests_write_nothing() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 0);
    device.clear_received();

    assert!(matches!(
        pump.pump_volume(60.0, 12_000.0, None, false).await,
        Err(PumpError::RpmOutOfRange { .. })
    ));
    assert!(matches!(
        pump.pump_volume(-1.0, 12.0, None, false).await,
        Err(PumpError::VolumeOutOfRange { .. })
    ));
    assert!(matches!(
        pump.pump_volume(0.0, 12.0, None, false).await,
        Err(PumpError::VolumeOutOfRange { .. })
    ));
    assert!(matches!(
        pump.pump_duration(Duration::ZERO, 12.0, None, false).await,
        Err(PumpError::DurationOutOfRange)
    ));
    assert!(matches!(
        pump.pump_continuous(-5.0, None).await,
        Err(PumpError::RpmOutOfRange { .. })
    ));
    assert!(matches!(
        pump.set_rpm(0.0).await,
        Err(PumpError::RpmOutOfRange { .. })
    ));
    assert!(matches!(
        pump.set_rpm(100.0).await,
        Err(PumpError::RpmOutOfRange { .. })
    ));
    // more revolutions than the step counter can hold
    assert!(matches!(
        pump.pump_volume_rpm(pump.max_volume_ul() * 2.0, 12.0, None, false).await,
        Err(PumpError::RevolutionsOutOfRange { .. })
    ));

    assert!(device.received().is_empty());
}

fn assert_close(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= expected.abs() * 1e-12,
        "{} != {}",
        actual,
        expected
    );
}

#[tokio::test]
async fn test_limits_with_variable_microstepping() {
    let mut config = test_config();
    let mut pump_config = config.pump(0);
    pump_config.max_rpm = 1e6;
    pump_config.min_microstep_exp = 1;
    pump_config.max_microstep_exp = 4;
    config.set_pump(0, pump_config);
    let (_device, controller) = connect(SimConfig::default(), config).await;

    // fastest and largest at 2^1 microsteps, slowest and smallest at 2^4
    let pump0 = pump(&controller, 0);
    assert_close(pump0.max_rpm(), 60e6 / (24.0 * 400.0));
    assert_close(pump0.min_rpm(), 60e6 / (MAX_STEP_INTERVAL as f64 * 3200.0));
    assert_close(pump0.max_volume_ul(), MAX_STEPS as f64 / 400.0 * 60.0);
    assert_close(pump0.min_volume_ul(), 60.0 / 3200.0);
    assert_close(pump0.max_flow_rate_ul_per_sec(), pump0.max_rpm());
    assert_close(pump0.min_flow_rate_ul_per_sec(), pump0.min_rpm());

    // the configured speed limit wins over the hardware one
    let pump1 = pump(&controller, 1);
    assert_eq!(pump1.max_rpm(), 100.0);
    assert_close(pump1.max_flow_rate_ul_per_sec(), 100.0);
    assert_close(pump1.min_volume_ul(), 60.0 / 51_200.0);
}

#[tokio::test]
async fn test_limits_with_fixed_microsteps() {
    let sim = SimConfig {
        var_microstep_support: [false; 4],
        ..Default::default()
    };
    let mut config = test_config();
    let mut pump_config = config.pump(0);
    pump_config.microsteps = 8;
    pump_config.max_rpm = 1e6;
    pump_config.ul_per_rev = 120.0;
    config.set_pump(0, pump_config);
    let (_device, controller) = connect(sim, config).await;
    let pump = pump(&controller, 0);

    assert_close(pump.max_rpm(), 60e6 / (24.0 * 1600.0));
    assert_close(pump.min_rpm(), 60e6 / (MAX_STEP_INTERVAL as f64 * 1600.0));
    assert_close(pump.max_volume_ul(), MAX_STEPS as f64 / 1600.0 * 120.0);
    assert_close(pump.min_volume_ul(), 120.0 / 1600.0);
    assert_close(pump.max_flow_rate_ul_per_sec(), pump.max_rpm() * 2.0);
    assert_close(pump.min_flow_rate_ul_per_sec(), pump.min_rpm() * 2.0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 0);

    // stopping a stopped pump does not touch the wire
    device.clear_received();
    assert_eq!(pump.pump_stop().await.unwrap(), 0.0);
    assert!(device.received().is_empty());

    pump.pump_continuous(12.0, None).await.unwrap();
    assert!(device.motor(0).running);

    pump.pump_stop().await.unwrap();
    pump.pump_stop().await.unwrap();
    let stops = writes(&device)
        .into_iter()
        .filter(|w| *w == (Parameter::Running, 0))
        .count();
    assert_eq!(stops, 1);
    assert!(!device.motor(0).running);
}

#[tokio::test]
async fn test_continuous_run_reports_no_volume() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 1);

    pump.pump_continuous(24.0, Some(Direction::CounterClockwise))
        .await
        .unwrap();

    let motor = device.motor(1);
    assert!(motor.running);
    assert!(!motor.finite_mode);
    assert_eq!(motor.step_interval, 12_500);
    assert_eq!(pump.remaining_volume_ul().await.unwrap(), 0.0);
    assert_eq!(pump.target_volume_ul().await.unwrap(), 0.0);
    assert_eq!(pump.remaining_time().await.unwrap(), None);

    let status = pump.status().await.unwrap();
    assert_eq!(status.phase, PumpPhase::RunningContinuous);
    assert_eq!(status.flow_rate_ul_per_sec, 24.0);

    // a second start is refused while running
    assert!(matches!(
        pump.pump_volume(10.0, 1.0, None, false).await,
        Err(PumpError::AlreadyRunning(1))
    ));

    pump.pump_stop().await.unwrap();
    assert_eq!(pump.status().await.unwrap().phase, PumpPhase::Idle);
}

#[tokio::test]
async fn test_set_rpm_while_running_continuous() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 0);

    pump.pump_continuous_rpm(12.0, None).await.unwrap();
    pump.set_rpm(24.0).await.unwrap();

    let motor = device.motor(0);
    assert!(motor.running);
    assert_eq!(motor.step_interval, 12_500);
    assert_eq!(pump.rpm(), 24.0);
}

#[tokio::test]
async fn test_set_rpm_keeps_revolutions_across_exponent_change() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 0);

    // one revolution so slow that no step is taken during the test
    pump.pump_volume_rpm(60.0, 1e-4, None, false).await.unwrap();
    let motor = device.motor(0);
    assert_eq!(motor.microstep_exponent, 0);
    assert_eq!(motor.steps, 200);
    assert_eq!(motor.step_interval, 3_000_000_000);

    // half the speed no longer fits the interval register at full step
    pump.set_rpm(5e-5).await.unwrap();

    let motor = device.motor(0);
    assert!(motor.running);
    assert_eq!(motor.microstep_exponent, 1);
    assert_eq!(motor.step_interval, 3_000_000_000);
    assert_eq!(motor.steps, 400);
    assert_eq!(motor.target_steps, 400);
    assert_eq!(pump.state().microsteps, 2);
    assert_eq!(pump.remaining_volume_ul().await.unwrap(), 60.0);

    pump.pump_stop().await.unwrap();
}

#[tokio::test]
async fn test_direction_inversion_applies_on_the_wire() {
    let mut config = test_config();
    let mut pump_config = config.pump(0);
    pump_config.direction_inverse = true;
    config.set_pump(0, pump_config);
    let (device, controller) = connect(SimConfig::default(), config).await;
    let pump = pump(&controller, 0);

    // wire value 0 reads back as clockwise on an inverted channel
    assert_eq!(pump.state().direction, Direction::Clockwise);

    pump.pump_continuous(12.0, Some(Direction::CounterClockwise))
        .await
        .unwrap();
    assert!(device.motor(0).direction);
    assert_eq!(pump.state().direction, Direction::CounterClockwise);

    pump.pump_stop().await.unwrap();
    pump.pump_continuous(12.0, Some(Direction::Clockwise))
        .await
        .unwrap();
    assert!(!device.motor(0).direction);
    pump.pump_stop().await.unwrap();
}

#[tokio::test]
async fn test_default_direction_from_calibration() {
    let mut config = test_config();
    let mut pump_config = config.pump(2);
    pump_config.direction_default = Direction::CounterClockwise;
    config.set_pump(2, pump_config);
    let (device, controller) = connect(SimConfig::default(), config).await;
    let pump = pump(&controller, 2);

    pump.pump_continuous(12.0, None).await.unwrap();
    assert!(!device.motor(2).direction);
    assert_eq!(pump.state().direction, Direction::CounterClockwise);
    pump.pump_stop().await.unwrap();
}

#[tokio::test]
async fn test_rejected_exponent_aborts_start() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 0);
    let exponent_id = set_id(0, Parameter::MicrostepExponent);
    device.reject_command(exponent_id);

    let result = pump.pump_volume_rpm(60.0, 5e-5, None, false).await;
    match result {
        Err(PumpError::Protocol(ProtocolError::CommandRejected { command })) => {
            assert_eq!(command, exponent_id)
        }
        other => panic!("expected a rejected command, got {:?}", other),
    }
    assert!(!device.motor(0).running);
    assert!(!pump.is_running());
    assert_eq!(pump.state().microstep_exponent, 0);
}

#[tokio::test]
async fn test_fixed_microstepping_without_controller_support() {
    let sim = SimConfig {
        var_microstep_support: [false; 4],
        ..Default::default()
    };
    let mut config = test_config();
    let mut pump_config = config.pump(0);
    pump_config.microsteps = 4;
    config.set_pump(0, pump_config);
    let (device, controller) = connect(sim, config).await;
    let pump = pump(&controller, 0);

    assert!(!pump.state().variable_microstepping);
    assert_eq!(pump.steps_per_rev(), 800.0);

    // below the slowest speed the longest interval allows at 800 steps/rev
    assert!(matches!(
        pump.pump_continuous_rpm(1e-5, None).await,
        Err(PumpError::RpmOutOfRange { .. })
    ));

    device.clear_received();
    pump.pump_continuous_rpm(12.0, None).await.unwrap();
    assert!(writes(&device)
        .iter()
        .all(|(parameter, _)| *parameter != Parameter::MicrostepExponent));
    assert_eq!(device.motor(0).step_interval, 6_250);
    pump.pump_stop().await.unwrap();
}

#[tokio::test]
async fn test_config_can_disable_variable_microstepping() {
    let mut config = test_config();
    let mut pump_config = config.pump(0);
    pump_config.variable_microstepping = false;
    config.set_pump(0, pump_config);
    let (_device, controller) = connect(SimConfig::default(), config).await;

    let pump = pump(&controller, 0);
    assert!(!pump.state().variable_microstepping);
    assert_eq!(pump.steps_per_rev(), 200.0);
}

#[tokio::test]
async fn test_stop_releases_blocking_run() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 0);

    // 0.6 uL/s takes 100 s for 60 uL
    let (run, remaining) = tokio::join!(pump.pump_volume(60.0, 0.6, None, true), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        pump.pump_stop().await
    });

    run.unwrap();
    let remaining = remaining.unwrap();
    assert!(remaining > 59.0 && remaining <= 60.0);
    assert!(!device.motor(0).running);

    let status = pump.status().await.unwrap();
    assert_eq!(status.phase, PumpPhase::PausedFinite);
    assert!(pump.remaining_time().await.unwrap().unwrap() > Duration::from_secs(90));

    // resuming picks up the rest of the run
    let resumed = pump.pump_resume(false).await.unwrap();
    assert_eq!(resumed, remaining);
    assert!(device.motor(0).running);
    pump.pump_stop().await.unwrap();
}

#[tokio::test]
async fn test_blocking_resume_of_continuous_run_returns() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 2);

    pump.pump_continuous(12.0, None).await.unwrap();
    pump.pump_stop().await.unwrap();
    assert!(!device.motor(2).running);

    let resumed = tokio::time::timeout(Duration::from_millis(500), pump.pump_resume(true))
        .await
        .expect("resume of a continuous run must not wait for completion")
        .unwrap();
    assert_eq!(resumed, 0.0);
    assert!(device.motor(2).running);
    pump.pump_stop().await.unwrap();
}

#[tokio::test]
async fn test_finished_signal_ends_wait() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 3);

    pump.pump_duration(Duration::from_secs(100), 0.6, None, false)
        .await
        .unwrap();
    assert!(pump.is_running());
    assert_eq!(device.motor(3).target_steps, 200);

    device.finish(3);
    pump.wait_finished().await.unwrap();
    assert!(!pump.is_running());
    assert_eq!(pump.remaining_volume_ul().await.unwrap(), 0.0);
}

#[tokio::test]
async fn test_finish_timeout() {
    let mut config = test_config();
    config.transport.finish_timeout_ms = 100;
    let (_device, controller) = connect(SimConfig::default(), config).await;
    let pump = pump(&controller, 0);

    assert!(matches!(
        pump.pump_volume(60.0, 0.6, None, true).await,
        Err(PumpError::FinishTimeout(0))
    ));
    // the run keeps going until stopped
    assert!(pump.is_running());
    pump.pump_stop().await.unwrap();
}

#[tokio::test]
async fn test_calibration_changes_volume() {
    let (device, controller) = connect(SimConfig::default(), test_config()).await;
    let pump = pump(&controller, 0);

    assert!(matches!(
        pump.set_calibration_ul_per_rev(0.0),
        Err(PumpError::CalibrationOutOfRange(_))
    ));
    pump.set_calibration_ul_per_rev(120.0).unwrap();

    // 60 uL is half a revolution at 120 uL/rev
    pump.pump_volume(60.0, 0.6, None, false).await.unwrap();
    assert_eq!(device.motor(0).steps, 100);
    assert_eq!(pump.remaining_volume_ul().await.unwrap(), 60.0);
    pump.pump_stop().await.unwrap();
}
