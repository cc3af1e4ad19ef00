//! Bring-up across mixed boards: absent sockets, stuck firmware, resets

mod common;

use common::{board, started_group, IMAGE};
use echogroup_core::sim::{SimEvent, SimSensor, SimTransport};
use echogroup_core::{
    ErrorFlags, Firmware, Group, GroupConfig, GroupError, GroupSignals, Mode, ProgrammingStage,
    RangeKind, ResetKind, SensorConfig, SlotMask, Transport,
};

fn four_socket_board() -> SimTransport {
    SimTransport::new(vec![
        SimSensor::ch101(0),
        SimSensor::absent(),
        SimSensor::ch201(1),
        SimSensor::absent(),
    ])
}

#[test]
fn absent_sockets_do_not_stop_bring_up() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 4> = Group::new(four_socket_board(), &signals, GroupConfig::fast());
    group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
    group.init_slot(1, Firmware::gpr(&IMAGE)).unwrap();
    group.init_slot(2, Firmware::gpr_multi_threshold(&IMAGE)).unwrap();
    group.init_slot(3, Firmware::gpr(&IMAGE)).unwrap();

    let report = group.start();

    assert!(!report.is_ok());
    assert_eq!(report.status(), ErrorFlags::DISCOVERY);
    assert_eq!(report.connected(), SlotMask::bit(0) | SlotMask::bit(2));
    assert_eq!(report.failure(1), Some(GroupError::DiscoveryFailure { slot: 1 }));
    assert_eq!(report.failures().count(), 2);

    assert_eq!(group.sensor_count(), 2);
    assert!(group.is_connected(0));
    assert!(!group.is_connected(3));
    assert_eq!(group.part_number(2), Ok(201));
    assert_eq!(group.fw_version(0), Ok("it_fw_1.0"));

    // Absent slots never reach the programming stage
    let programmed = group.transport().count_events(|e| matches!(e, SimEvent::Program(_)));
    assert_eq!(programmed, 2);

    // The connected pair is enough for this application
    assert!(report.ensure_connected(SlotMask::bit(0) | SlotMask::bit(2)).is_ok());
    assert_eq!(
        report.ensure_connected(SlotMask::bit(3)),
        Err(GroupError::DiscoveryFailure { slot: 3 })
    );
}

#[test]
fn calibration_and_address_after_bring_up() {
    let signals = GroupSignals::new();
    let group: Group<_, 4> = {
        let mut g = Group::new(four_socket_board(), &signals, GroupConfig::default());
        g.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
        g.init_slot(2, Firmware::gpr_multi_threshold(&IMAGE)).unwrap();
        assert!(g.start().is_ok());
        g
    };

    let cal = group.calibration(0).unwrap();
    assert_eq!(cal.rtc_pulse_ms, 100);
    assert_eq!(cal.rtc_cal_result, 2950);
    assert_eq!(group.operating_frequency(0), Ok(175_003));
    assert_eq!(group.operating_frequency(2), Ok(85_003));
    assert_eq!(group.rtc_pulse_ms(), 100);

    let info = group.transport().bus_info(2);
    assert_eq!(group.device(2).map(|d| d.address()), Some(info.address));
    assert_eq!(group.transport().sensor(2).map(|s| s.address()), Some(info.address));
    assert_eq!(group.device(2).map(|d| d.bus()), Some(1));
    assert_eq!(group.transport().sensor(0).and_then(|s| s.programmed_with()), Some("it_fw_1.0"));
}

#[test]
fn lock_timeout_is_reported_per_slot() {
    let signals = GroupSignals::new();
    let board = SimTransport::new(vec![SimSensor::ch101(0).never_locks(), SimSensor::ch101(0)]);
    let config = GroupConfig::fast().with_lock_retries(5);
    let mut group: Group<_, 2> = Group::new(board, &signals, config);
    group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
    group.init_slot(1, Firmware::gpr(&IMAGE)).unwrap();

    let report = group.start();

    assert_eq!(report.status(), ErrorFlags::LOCK_TIMEOUT);
    assert_eq!(report.failure(0), Some(GroupError::LockTimeout { slot: 0, attempts: 5 }));
    assert_eq!(group.transport().sensor(0).map(|s| s.ready_polls()), Some(5));
    assert!(!group.is_connected(0));
    assert!(group.is_connected(1));
    assert_eq!(group.transfer_error(0), Some(GroupError::LockTimeout { slot: 0, attempts: 5 }));
}

#[test]
fn slow_lock_within_budget_succeeds() {
    let signals = GroupSignals::new();
    let board = SimTransport::new(vec![SimSensor::ch101(0).locks_after(8)]);
    let mut group: Group<_, 1> = Group::new(board, &signals, GroupConfig::fast());
    group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();

    assert!(group.start().is_ok());
    assert_eq!(group.transport().sensor(0).map(|s| s.ready_polls()), Some(8));
}

#[test]
fn mixed_failures_combine_in_status() {
    let signals = GroupSignals::new();
    let board = SimTransport::new(vec![
        SimSensor::absent(),
        SimSensor::ch101(0).never_locks(),
        SimSensor::ch101(0),
    ]);
    let config = GroupConfig { num_ports: 3, ..GroupConfig::fast() };
    let mut group: Group<_, 3> = Group::new(board, &signals, config);
    for slot in 0..3 {
        group.init_slot(slot, Firmware::gpr(&IMAGE)).unwrap();
    }

    let status = group.start().status();
    assert!(status.contains(ErrorFlags::DISCOVERY));
    assert!(status.contains(ErrorFlags::LOCK_TIMEOUT));
    assert!(!status.contains(ErrorFlags::PROGRAMMING));
    assert_eq!(group.connected_mask(), SlotMask::bit(2));
}

#[test]
fn binding_errors_never_touch_the_bus() {
    static EMPTY: echogroup_core::FirmwareImage = echogroup_core::FirmwareImage::new("none", &[]);
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = Group::new(board(2), &signals, GroupConfig::with_ports(2));

    assert!(matches!(
        group.init_slot(5, Firmware::gpr(&IMAGE)),
        Err(GroupError::InvalidBinding { slot: 5, .. })
    ));
    assert!(matches!(
        group.init_slot(0, Firmware::gpr(&EMPTY)),
        Err(GroupError::InvalidBinding { slot: 0, .. })
    ));
    group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
    assert!(group.init_slot(0, Firmware::gpr_multi_threshold(&IMAGE)).is_err());

    assert!(group.transport().events().is_empty());
    assert_eq!(group.bus_mask().bits(), 1);
}

#[test]
fn reset_restores_configuration() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = started_group(board(2), &signals);
    let config = SensorConfig::bench().with_max_range(400).with_static_range(4);
    group.configure(0, config).unwrap();
    group.transport_mut().clear_events();

    group.reset(0, ResetKind::Hard).unwrap();

    assert_eq!(group.get_config(0), Ok(config));
    assert!(group.active_mask().contains(0));
    assert_eq!(group.transport().sensor(0).and_then(|s| s.mode()), Some(Mode::TriggeredTxRx));
    assert_eq!(group.transport().count_events(|e| *e == SimEvent::Reset(0)), 1);
    assert_eq!(group.transport().count_events(|e| *e == SimEvent::Program(0)), 1);
}

#[test]
fn soft_group_reset_brings_everyone_back() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 3> = started_group(board(3), &signals);
    group.configure(1, SensorConfig::new(Mode::TriggeredRxOnly)).unwrap();

    let report = group.group_reset(ResetKind::Soft);

    assert!(report.is_ok());
    assert_eq!(report.connected().count(), 3);
    assert_eq!(group.get_config(1).map(|c| c.mode), Ok(Mode::TriggeredRxOnly));
    assert_eq!(group.get_config(0).map(|c| c.mode), Ok(Mode::Idle));
    assert_eq!(group.transport().count_events(|e| matches!(e, SimEvent::Reset(_))), 6);
}

#[test]
fn reset_of_vanished_device_disconnects_it() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = started_group(board(2), &signals);
    group.configure(1, SensorConfig::new(Mode::TriggeredRxOnly)).unwrap();

    if let Some(sensor) = group.transport_mut().sensor_mut(1) {
        *sensor = SimSensor::absent();
    }

    assert_eq!(group.reset(1, ResetKind::Hard), Err(GroupError::DiscoveryFailure { slot: 1 }));
    assert!(!group.is_connected(1));
    assert!(!group.active_mask().contains(1));
    assert_eq!(group.range(1, RangeKind::Direct), Err(GroupError::NotConnected { slot: 1 }));
}

#[test]
fn programming_stage_is_recorded() {
    let e = GroupError::ProgrammingFailure { slot: 2, stage: ProgrammingStage::Calibration };
    assert_eq!(e.flag(), ErrorFlags::PROGRAMMING);
    assert_eq!(e.slot(), Some(2));
}
