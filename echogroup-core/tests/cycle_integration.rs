//! Trigger/interrupt cycles over a simulated board

mod common;

use common::{board, started_group, HookCounter};
use echogroup_core::firmware::gpr;
use echogroup_core::sim::{SimEvent, SimSensor, SimTransport};
use echogroup_core::{
    Firmware, FirmwareImage, Group, GroupConfig, GroupError, GroupSignals, InterruptOutcome, IoMode,
    IqSample, Mode, RangeKind, SensorConfig, SlotMask, Thresholds,
};
use proptest::prelude::*;

fn configure_subset<const N: usize>(group: &mut Group<'_, SimTransport, N>, subset: SlotMask) {
    let mut transmitter = true;
    for slot in subset {
        let mode = if transmitter { Mode::TriggeredTxRx } else { Mode::TriggeredRxOnly };
        group.configure(slot, SensorConfig::new(mode)).unwrap();
        transmitter = false;
    }
}

proptest! {
    #[test]
    fn cycle_completes_exactly_once(
        bits in 1u32..64,
        order in Just((0u8..6).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let signals = GroupSignals::new();
        let mut group: Group<_, 6> = started_group(board(6), &signals);
        let subset = SlotMask::from_bits(bits);
        configure_subset(&mut group, subset);

        group.group_trigger().unwrap();
        let outcomes = group.transport_mut().deliver_in_order(&order, &signals);

        prop_assert_eq!(outcomes.len(), subset.count() as usize);
        prop_assert_eq!(
            outcomes.last().copied(),
            Some(InterruptOutcome::CycleComplete { disable_line: true })
        );
        prop_assert!(outcomes[..outcomes.len() - 1].iter().all(|o| *o == InterruptOutcome::Pending));
        prop_assert!(signals.poll_cycle().is_ok());
        prop_assert!(signals.poll_cycle().is_err());

        // Late duplicates after completion change nothing
        for slot in subset {
            prop_assert_eq!(
                group.transport_mut().inject_interrupt(slot, &signals),
                InterruptOutcome::Ignored
            );
        }
        prop_assert_eq!(signals.cycles_completed(), 1);
        prop_assert!(group.transport().interrupts_enabled().is_empty());
    }
}

#[test]
fn empty_active_set_completes_immediately() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = started_group(board(2), &signals);
    group.transport_mut().clear_events();

    group.group_trigger().unwrap();

    assert!(signals.poll_cycle().is_ok());
    assert!(group.transport().events().is_empty());
}

#[test]
fn no_target_keeps_previous_amplitude() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 1> = started_group(board(1), &signals);
    group.configure(0, SensorConfig::bench()).unwrap();

    group.group_trigger().unwrap();
    group.transport_mut().deliver_interrupts(&signals);
    assert!(signals.poll_cycle().is_ok());
    let first = group.read_measurement(0, None).unwrap();
    assert!(first.range.is_target());
    assert_eq!(first.amplitude, 420);

    if let Some(sensor) = group.transport_mut().sensor_mut(0) {
        *sensor = sensor.clone().no_echo();
    }
    group.group_trigger().unwrap();
    group.transport_mut().deliver_interrupts(&signals);
    assert!(signals.poll_cycle().is_ok());

    let second = group.read_measurement(0, None).unwrap();
    assert!(!second.range.is_target());
    assert_eq!(second.amplitude, 420);
    assert_eq!(group.device(0).map(|d| d.measurement().amplitude), Some(420));
}

#[test]
fn pitch_catch_has_one_transmitter() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 3> = started_group(board(3), &signals);

    let transmitter = group
        .configure_pitch_catch(SensorConfig::default().with_max_range(500))
        .unwrap();
    assert_eq!(transmitter, 0);
    assert_eq!(group.get_config(2).map(|c| c.mode), Ok(Mode::TriggeredRxOnly));
    assert_eq!(group.active_mask(), SlotMask::first(3));
    group.transport_mut().clear_events();

    group.group_trigger().unwrap();

    let t = group.transport();
    assert_eq!(t.count_events(|e| matches!(e, SimEvent::Trigger(_))), 1);
    assert_eq!(t.count_events(|e| matches!(e, SimEvent::Transmit(_))), 1);
    assert_eq!(t.count_events(|e| *e == SimEvent::Transmit(0)), 1);
    assert_eq!(t.count_events(|e| matches!(e, SimEvent::Receive(s) if *s != 0)), 2);

    group.transport_mut().deliver_interrupts(&signals);
    assert!(signals.poll_cycle().is_ok());

    // Receivers hear the direct path, the transmitter its own echo
    let direct = group.read_measurement(1, None).unwrap().range;
    let one_way = group.read_measurement(0, None).unwrap().range;
    assert_eq!(one_way.raw(), direct.raw() / 2);
}

#[test]
fn pitch_catch_keeps_thresholds_where_supported() {
    static IMAGE: FirmwareImage = FirmwareImage::new("mixed", &[0x11; 4]);
    let signals = GroupSignals::new();
    let board = SimTransport::new(vec![SimSensor::ch101(0), SimSensor::ch201(0)]);
    let mut group: Group<_, 2> = Group::new(board, &signals, GroupConfig::fast());
    group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
    group.init_slot(1, Firmware::gpr_multi_threshold(&IMAGE)).unwrap();
    assert!(group.start().is_ok());

    let template = SensorConfig::default().with_thresholds(Thresholds::long_range());
    group.configure_pitch_catch(template).unwrap();

    assert_eq!(group.get_config(0).map(|c| c.thresholds), Ok(None));
    assert_eq!(group.get_thresholds(1), Ok(Thresholds::long_range()));
}

#[test]
fn retrigger_before_completion_starts_fresh_cycle() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = started_group(board(2), &signals);
    configure_subset(&mut group, SlotMask::first(2));

    group.group_trigger().unwrap();
    group.transport_mut().deliver_in_order(&[0], &signals);
    assert!(signals.poll_cycle().is_err());

    group.group_trigger().unwrap();
    assert!(signals.ready().is_empty());

    let outcomes = group.transport_mut().deliver_in_order(&[1, 0], &signals);
    assert_eq!(outcomes[0], InterruptOutcome::Pending);
    assert!(matches!(outcomes[1], InterruptOutcome::CycleComplete { .. }));
    assert_eq!(signals.cycles_completed(), 1);
}

#[test]
fn stray_interrupt_is_ignored() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 3> = started_group(board(3), &signals);
    group.configure(0, SensorConfig::bench()).unwrap();

    group.group_trigger().unwrap();
    assert_eq!(group.transport_mut().inject_interrupt(2, &signals), InterruptOutcome::Ignored);
    assert!(signals.poll_cycle().is_err());

    group.transport_mut().deliver_interrupts(&signals);
    assert!(signals.poll_cycle().is_ok());
}

static FREE_RUN_HOOK: HookCounter = HookCounter::new();

fn on_free_run(_slot: u8, outcome: InterruptOutcome) {
    if outcome == (InterruptOutcome::CycleComplete { disable_line: false }) {
        FREE_RUN_HOOK.bump();
    }
}

#[test]
fn free_running_reports_without_trigger() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = started_group(board(2), &signals);
    group.set_interrupt_callback(on_free_run);

    assert!(matches!(
        group.configure(1, SensorConfig::new(Mode::FreeRunning)),
        Err(GroupError::ConfigurationError { slot: 1, .. })
    ));
    group.configure(1, SensorConfig::free_running(100)).unwrap();
    assert_eq!(group.free_running_mask(), SlotMask::bit(1));
    group.transport_mut().clear_events();

    for _ in 0..3 {
        group.transport_mut().tick_free_running();
        group.transport_mut().deliver_interrupts(&signals);
        assert!(signals.poll_cycle().is_ok());
    }

    assert_eq!(FREE_RUN_HOOK.get(), 3);
    assert!(group.transport().interrupts_enabled().contains(1));

    // A group trigger never pulses free-running slots
    group.group_trigger().unwrap();
    assert_eq!(group.transport().count_events(|e| matches!(e, SimEvent::Trigger(_))), 0);
}

#[test]
fn single_slot_trigger() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = started_group(board(2), &signals);
    configure_subset(&mut group, SlotMask::first(2));

    group.trigger(1).unwrap();
    assert_eq!(signals.target(), SlotMask::bit(1));
    let outcomes = group.transport_mut().deliver_interrupts(&signals);
    assert_eq!(outcomes, vec![InterruptOutcome::CycleComplete { disable_line: true }]);

    group.configure(0, SensorConfig::default()).unwrap();
    assert!(matches!(
        group.trigger(0),
        Err(GroupError::ConfigurationError { slot: 0, .. })
    ));
}

#[test]
fn blocking_sample_readout() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 1> = started_group(board(1), &signals);
    group.configure(0, SensorConfig::bench()).unwrap();
    let n = group.num_samples(0).unwrap();
    assert!(n > 0);

    group.group_trigger().unwrap();
    group.transport_mut().deliver_interrupts(&signals);
    assert!(signals.poll_cycle().is_ok());

    let m = group.read_measurement(0, Some(IoMode::Blocking)).unwrap();
    assert_eq!(m.num_samples, n);

    let samples = group.samples(0).unwrap();
    assert_eq!(samples.len(), n as usize);
    assert_eq!(samples[5], IqSample::new(5, -5));
    assert_eq!(samples[37], IqSample::new(37, -37));
}

#[test]
fn range_interpretations() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 1> = started_group(board(1), &signals);
    group.configure(0, SensorConfig::bench()).unwrap();
    group.group_trigger().unwrap();
    group.transport_mut().deliver_interrupts(&signals);

    let round = group.range(0, RangeKind::RoundTrip).unwrap();
    let one_way = group.range(0, RangeKind::OneWay).unwrap();
    assert_eq!(one_way.raw(), round.raw() / 2);
    // tof 1000, 10 ms pulse: 343 × 10 × 1000 / 295
    assert_eq!(round.raw(), 11_627);
}

#[test]
fn setters_update_stored_config() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 1> = started_group(board(1), &signals);
    group.configure(0, SensorConfig::bench()).unwrap();

    group.set_max_range(0, 300).unwrap();
    group.set_static_range(0, 6).unwrap();
    let config = group.get_config(0).unwrap();
    assert_eq!(config.max_range_mm, 300);
    assert_eq!(config.static_range, 6);
    assert_eq!(group.num_samples(0), group.mm_to_samples(0, 300));

    group.set_num_samples(0, 100).unwrap();
    assert_eq!(group.num_samples(0), Ok(100));
    assert_eq!(group.get_config(0).map(|c| c.max_range_mm), group.samples_to_mm(0, 100));
    assert!(group.set_num_samples(0, 151).is_err());

    group.set_mode(0, Mode::Idle).unwrap();
    assert!(group.active_mask().is_empty());
    assert!(group.set_static_range(0, 200).is_err());
}

#[test]
fn failed_configure_write_parks_slot() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = started_group(board(2), &signals);
    configure_subset(&mut group, SlotMask::first(2));
    if let Some(sensor) = group.transport_mut().sensor_mut(0) {
        sensor.set_write_fault(Some(gpr::REGISTERS.st_range));
    }

    let failure = GroupError::TransferError { slot: 0, bus: 0 };
    assert_eq!(group.set_static_range(0, 4), Err(failure));
    assert_eq!(group.get_config(0).map(|c| c.mode), Ok(Mode::Idle));
    assert_eq!(group.transport().sensor(0).and_then(|s| s.mode()), Some(Mode::Idle));
    assert_eq!(group.active_mask(), SlotMask::bit(1));
    assert_eq!(group.device(0).and_then(|d| d.last_error()), Some(failure));
    assert!(group.is_connected(0));

    // The rest of the group still cycles
    group.group_trigger().unwrap();
    let outcomes = group.transport_mut().deliver_interrupts(&signals);
    assert_eq!(outcomes, vec![InterruptOutcome::CycleComplete { disable_line: true }]);
    assert!(signals.poll_cycle().is_ok());

    if let Some(sensor) = group.transport_mut().sensor_mut(0) {
        sensor.set_write_fault(None);
    }
    group.configure(0, SensorConfig::bench()).unwrap();
    assert_eq!(group.active_mask(), SlotMask::first(2));

    group.group_trigger().unwrap();
    group.transport_mut().deliver_interrupts(&signals);
    assert!(signals.poll_cycle().is_ok());
    assert_eq!(signals.cycles_completed(), 2);
}

#[test]
fn mixed_cycle_masks_free_running_line() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 2> = started_group(board(2), &signals);
    group.configure(0, SensorConfig::bench()).unwrap();
    group.configure(1, SensorConfig::free_running(100)).unwrap();
    group.transport_mut().clear_events();

    group.group_trigger().unwrap();
    assert_eq!(group.transport().count_events(|e| *e == SimEvent::Trigger(SlotMask::bit(0))), 1);
    group.transport_mut().tick_free_running();

    let outcomes = group.transport_mut().deliver_interrupts(&signals);
    assert_eq!(
        outcomes,
        vec![InterruptOutcome::Pending, InterruptOutcome::CycleComplete { disable_line: true }]
    );
    assert!(signals.poll_cycle().is_ok());
    assert!(group.transport().interrupts_enabled().is_empty());

    // Free-running slot stays silent until the next group trigger
    group.transport_mut().tick_free_running();
    assert!(group.transport().pending_interrupts().is_empty());
    assert!(signals.poll_cycle().is_err());
    assert_eq!(group.free_running_mask(), SlotMask::bit(1));
}

#[test]
fn free_running_setup_keeps_triggered_cycle() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 3> = started_group(board(3), &signals);
    group.configure(0, SensorConfig::bench()).unwrap();

    group.group_trigger().unwrap();
    group.configure(2, SensorConfig::free_running(50)).unwrap();
    assert_eq!(signals.target(), SlotMask::bit(0));

    let outcomes = group.transport_mut().deliver_interrupts(&signals);
    assert_eq!(outcomes, vec![InterruptOutcome::CycleComplete { disable_line: true }]);
    assert!(signals.poll_cycle().is_ok());
    assert_eq!(group.active_mask(), SlotMask::bit(0) | SlotMask::bit(2));
}

#[test]
fn offset_read_exposes_only_its_window() {
    let signals = GroupSignals::new();
    let mut group: Group<_, 1> = started_group(board(1), &signals);
    group.configure(0, SensorConfig::bench()).unwrap();
    group.group_trigger().unwrap();
    group.transport_mut().deliver_interrupts(&signals);
    assert!(signals.poll_cycle().is_ok());

    group.read_samples(0, 0, 32, IoMode::Blocking).unwrap();
    assert_eq!(group.samples(0).map(|s| s.len()), Ok(32));

    group.read_samples(0, 20, 8, IoMode::Blocking).unwrap();
    let samples = group.samples(0).unwrap();
    assert_eq!(samples.len(), 8);
    assert_eq!(samples[0], IqSample::new(20, -20));
    assert_eq!(group.device(0).map(|d| d.samples_start()), Some(20));
}
