//! Sensor Group Coordinator
//!
//! ## Lifecycle
//!
//! ```text
//!  Group::new ──► init_slot × N ──► start ──► configure ──► cycles...
//!                  (bind once)     (probe,     (masks)
//!                                  program,
//!                                  calibrate)
//! ```
//!
//! ## One Cycle
//!
//! 1. [`Group::group_trigger`] arms [`GroupSignals`] with the active mask,
//!    enables the lines and sends one fan-out pulse to every triggered slot
//! 2. Each device interrupt reaches [`GroupSignals::on_interrupt`]; the last
//!    expected slot raises the cycle flag
//! 3. The main flow sees [`GroupSignals::poll_cycle`] succeed and reads
//!    range, amplitude and samples, blocking or queued
//! 4. Queued reads go out with [`Group::start_nb`], one transfer per bus;
//!    [`GroupSignals::poll_io`] succeeds when every bus has reported and
//!    [`Group::finish_nb`] copies the data into the device buffers
//!
//! Results read before step 3 are whatever the device held last and carry
//! no meaning. Triggering again before a cycle completes starts a new cycle;
//! late interrupts from the old one may complete it early.
//!
//! ## Bring-Up
//!
//! [`Group::start`] walks every bound slot in order and never stops early:
//!
//! ```text
//! probe ─► reset ─► program ─► address ─► start ─► lock-wait ─► RTC cal
//!   │        │         │          │         │          │           │
//!   └────────┴─────────┴──────────┴─────────┴──────────┴───────────┴─► slot failed,
//!                                                                      next slot
//! ```
//!
//! Failures are collected per slot in [`StartReport`]; its status is the OR
//! of their [`ErrorFlags`] bits.

use crate::config::{GroupConfig, IoMode, Mode, RangeKind, ResetKind, SensorConfig, Thresholds};
use crate::constants::{MAX_BUSES, MAX_GROUP_SLOTS, PROG_I2C_ADDR, SIGNATURE};
use crate::device::{Calibration, Device, IqSample, Measurement, Range};
use crate::errors::{ErrorFlags, GroupError, GroupResult, ProgrammingStage};
use crate::firmware::{Firmware, FirmwareOps};
use crate::mask::{BusMask, SlotMask};
use crate::nonblocking::{NbQueues, QueueError};
use crate::signals::{GroupSignals, InterruptCallback, IoCompleteCallback};
use crate::time::{elapsed_ms, TimeSource};
use crate::transport::{ReadRequest, Transport};

/// Outcome of bringing up every bound slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport<const N: usize> {
    status: ErrorFlags,
    connected: SlotMask,
    failures: [Option<GroupError>; N],
}

impl<const N: usize> StartReport<N> {
    fn new() -> Self {
        Self {
            status: ErrorFlags::empty(),
            connected: SlotMask::EMPTY,
            failures: [None; N],
        }
    }

    fn record(&mut self, slot: u8, result: GroupResult<()>) {
        match result {
            Ok(()) => self.connected.insert(slot),
            Err(e) => {
                self.status.record(&e);
                self.failures[slot as usize] = Some(e);
            }
        }
    }

    /// Every bound slot came up
    pub fn is_ok(&self) -> bool {
        self.status.is_empty()
    }

    /// OR of every slot's error bit, zero on success
    pub fn status(&self) -> ErrorFlags {
        self.status
    }

    /// Slots now connected
    pub fn connected(&self) -> SlotMask {
        self.connected
    }

    /// Failure recorded for `slot`
    pub fn failure(&self, slot: u8) -> Option<GroupError> {
        self.failures.get(slot as usize).copied().flatten()
    }

    /// Iterate recorded failures
    pub fn failures(&self) -> impl Iterator<Item = GroupError> + '_ {
        self.failures.iter().flatten().copied()
    }

    /// Require every slot in `required` to be connected
    ///
    /// For boards where some slots are optional: a failed optional slot
    /// makes the status non-zero but need not stop the application.
    pub fn ensure_connected(&self, required: SlotMask) -> GroupResult<()> {
        match (required - self.connected).lowest() {
            None => Ok(()),
            Some(slot) => Err(self.failure(slot).unwrap_or(GroupError::NotConnected { slot })),
        }
    }
}

/// Coordinator for `N` sensor slots on one board
///
/// Owns the transport and every device descriptor. Shares only
/// [`GroupSignals`] with interrupt handlers.
pub struct Group<'s, T: Transport, const N: usize> {
    transport: T,
    signals: &'s GroupSignals,
    config: GroupConfig,
    devices: [Option<Device>; N],
    active: SlotMask,
    free_running: SlotMask,
    queues: NbQueues<N>,
}

impl<'s, T: Transport, const N: usize> Group<'s, T, N> {
    const CAPACITY_OK: () = assert!(N > 0 && N <= MAX_GROUP_SLOTS, "Group size must be 1..=32");

    /// Create an empty group
    pub fn new(transport: T, signals: &'s GroupSignals, config: GroupConfig) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_OK;

        signals.disarm();
        Self {
            transport,
            signals,
            config,
            devices: core::array::from_fn(|_| None),
            active: SlotMask::EMPTY,
            free_running: SlotMask::EMPTY,
            queues: NbQueues::new(),
        }
    }

    // ===== BINDING =====

    /// Bind `firmware` to `slot`
    ///
    /// Exactly once per slot. Fails only on malformed input and never
    /// touches the bus.
    pub fn init_slot(&mut self, slot: u8, firmware: Firmware) -> GroupResult<()> {
        let invalid = |reason| Err(GroupError::InvalidBinding { slot, reason });

        if slot as usize >= N {
            return invalid("slot beyond group capacity");
        }
        if slot >= self.config.num_ports {
            return invalid("slot not wired on this board");
        }
        if self.devices[slot as usize].is_some() {
            return invalid("slot already bound");
        }
        if firmware.image().is_empty() {
            return invalid("empty firmware image");
        }

        let info = self.transport.bus_info(slot);
        if info.bus as usize >= MAX_BUSES {
            return invalid("bus index out of range");
        }

        let mut device = Device::new(slot, firmware);
        device.state.bus = info.bus;
        self.devices[slot as usize] = Some(device);

        log_debug!("slot {}: bound {} on bus {}", slot, firmware.name(), info.bus);
        Ok(())
    }

    // ===== BRING-UP =====

    /// Discover, program and calibrate every bound slot
    ///
    /// Always attempts all slots. Absent or failing slots are left
    /// disconnected and reported; the group stays usable with the rest.
    pub fn start(&mut self) -> StartReport<N> {
        self.bring_up_all(ResetKind::Hard, false)
    }

    /// Reset and bring up every bound slot again, restoring configuration
    pub fn group_reset(&mut self, kind: ResetKind) -> StartReport<N> {
        self.bring_up_all(kind, true)
    }

    /// Reset and bring up one slot again, restoring its configuration
    pub fn reset(&mut self, slot: u8, kind: ResetKind) -> GroupResult<()> {
        if self.bound(slot).is_none() {
            return Err(GroupError::NotConnected { slot });
        }
        self.bring_up(slot, kind, true)
    }

    fn bring_up_all(&mut self, kind: ResetKind, restore: bool) -> StartReport<N> {
        let mut report = StartReport::new();
        self.signals.disarm();

        for slot in 0..N as u8 {
            if self.devices[slot as usize].is_none() {
                continue;
            }
            let result = self.bring_up(slot, kind, restore);
            report.record(slot, result);
        }

        log_info!(
            "group start: {} of {} bound slots connected, status {}",
            report.connected().count(),
            self.devices.iter().flatten().count(),
            report.status().bits()
        );
        report
    }

    fn bring_up(&mut self, slot: u8, kind: ResetKind, restore: bool) -> GroupResult<()> {
        let saved = self.bound(slot).map(|d| (d.state.connected, d.state.config));
        self.drop_from_masks(slot);

        let result = self.bring_up_steps(slot, kind);
        if let Some(device) = self.devices[slot as usize].as_mut() {
            device.state.last_error = result.err();
        }

        match result {
            Ok(calibration) => {
                log_info!(
                    "slot {}: part {} fw {} at {} Hz, rtc cal {} in {} ms",
                    slot,
                    self.devices[slot as usize].as_ref().map_or(0, |d| d.part_number()),
                    self.devices[slot as usize].as_ref().map_or("", |d| d.fw_version()),
                    calibration.op_frequency_hz,
                    calibration.rtc_cal_result,
                    calibration.rtc_pulse_ms
                );
            }
            Err(GroupError::DiscoveryFailure { .. }) => {
                log_debug!("slot {}: no device", slot);
                return result.map(|_| ());
            }
            Err(e) => {
                log_warn!("slot {}: bring-up failed: {}", slot, e);
                return Err(e);
            }
        }

        if let (true, Some((true, config))) = (restore, saved) {
            if config.mode != Mode::Idle || config.max_range_mm != 0 {
                self.configure(slot, config).map_err(|_| GroupError::ProgrammingFailure {
                    slot,
                    stage: ProgrammingStage::Restore,
                })?;
            }
        }
        Ok(())
    }

    fn bring_up_steps(&mut self, slot: u8, kind: ResetKind) -> GroupResult<Calibration> {
        let info = self.transport.bus_info(slot);
        let config = self.config;
        let transport = &mut self.transport;
        let Some(device) = self.devices[slot as usize].as_mut() else {
            return Err(GroupError::NotConnected { slot });
        };
        let firmware = device.firmware;
        let stage = |stage| GroupError::ProgrammingFailure { slot, stage };

        device.state.connected = false;
        device.state.address = PROG_I2C_ADDR;

        match transport.read_signature(slot) {
            Ok(sig) if sig == SIGNATURE => {}
            _ => return Err(GroupError::DiscoveryFailure { slot }),
        }

        match kind {
            ResetKind::Hard => {
                transport.reset(slot, true).map_err(|_| stage(ProgrammingStage::Reset))?;
                transport.delay_ms(config.reset_hold.to_millis());
                transport.reset(slot, false).map_err(|_| stage(ProgrammingStage::Reset))?;
            }
            ResetKind::Soft => {
                transport.soft_reset(slot).map_err(|_| stage(ProgrammingStage::Reset))?;
            }
        }

        transport
            .program(slot, firmware.image())
            .map_err(|_| stage(ProgrammingStage::Program))?;

        transport
            .assign_address(slot, info.address)
            .map_err(|_| stage(ProgrammingStage::Address))?;
        device.state.address = info.address;

        transport.start(slot).map_err(|_| stage(ProgrammingStage::Start))?;

        let mut locked = false;
        for _ in 0..config.lock_retries {
            if firmware.is_locked(transport, slot).map_err(|_| stage(ProgrammingStage::Start))? {
                locked = true;
                break;
            }
            transport.delay_ms(config.lock_poll.to_millis());
        }
        if !locked {
            return Err(GroupError::LockTimeout { slot, attempts: config.lock_retries });
        }

        let pulse_ms = config.rtc_pulse.to_millis();
        firmware
            .arm_calibration(transport, slot)
            .map_err(|_| stage(ProgrammingStage::Calibration))?;
        transport
            .calibration_pulse(slot, pulse_ms)
            .map_err(|_| stage(ProgrammingStage::Calibration))?;
        let calibration = firmware
            .read_calibration(transport, slot, pulse_ms)
            .map_err(|_| stage(ProgrammingStage::Calibration))?;

        device.state.calibration = calibration;
        device.state.config = SensorConfig::default();
        device.state.measurement = Measurement::default();
        device.state.set_sample_window(0, 0);
        device.state.connected = true;
        Ok(calibration)
    }

    /// Mark `slot` disconnected and drop it from every mask
    pub fn disconnect(&mut self, slot: u8) {
        if let Some(device) = self.devices.get_mut(slot as usize).and_then(Option::as_mut) {
            device.state.connected = false;
        }
        self.drop_from_masks(slot);
    }

    fn drop_from_masks(&mut self, slot: u8) {
        if self.active.contains(slot) {
            self.transport.set_interrupts(SlotMask::bit(slot), false);
        }
        self.active.remove(slot);
        self.free_running.remove(slot);
    }

    // ===== CONFIGURATION =====

    /// Apply `config` to `slot`
    ///
    /// Rejects a second triggered transmitter, thresholds on a variant
    /// without them, free-running without an interval and windows beyond
    /// the variant's capacity. Updates the active and free-running masks.
    ///
    /// A register write failing partway leaves the device parked: its
    /// stored mode becomes [`Mode::Idle`], its line is masked and it drops
    /// out of the active set, so the next group trigger does not wait on it.
    ///
    /// Switching a slot to free-running arms the shared signals for the
    /// free-running set only when no triggered cycle is in flight. During a
    /// triggered cycle the slot joins aggregation at the next group trigger.
    pub fn configure(&mut self, slot: u8, config: SensorConfig) -> GroupResult<()> {
        let reject = |reason| Err(GroupError::ConfigurationError { slot, reason });

        let other_transmitter = self
            .devices
            .iter()
            .flatten()
            .any(|d| d.slot() != slot && d.is_connected() && d.config().mode == Mode::TriggeredTxRx);

        let device = connected_mut(&mut self.devices, slot)?;
        let firmware = device.firmware;

        if config.mode == Mode::TriggeredTxRx && other_transmitter {
            return reject("another slot is already the transmitter");
        }
        if config.mode == Mode::FreeRunning && config.sample_interval_ms == 0 {
            return reject("free-running needs a sample interval");
        }
        if config.static_range > firmware.max_samples() {
            return reject("static range beyond capacity");
        }
        if let Some(thresholds) = &config.thresholds {
            if !firmware.supports_thresholds() {
                return reject("firmware has no threshold table");
            }
            if !thresholds.is_well_formed() {
                return reject("threshold start samples out of order");
            }
        }

        let num_samples = firmware.mm_to_samples(config.max_range_mm, &device.state.calibration);
        let transfer = GroupError::TransferError { slot, bus: device.state.bus };

        if write_config(&mut self.transport, &firmware, slot, &config, num_samples).is_err() {
            device.state.config.mode = Mode::Idle;
            device.state.last_error = Some(transfer);
            self.transport.set_interrupts(SlotMask::bit(slot), false);
            self.drop_from_masks(slot);
            log_warn!("slot {}: configuration write failed, parked idle", slot);
            return Err(transfer);
        }

        device.state.config = config;
        device.state.measurement.num_samples = num_samples;

        if config.mode.is_active() {
            self.active.insert(slot);
        } else {
            self.active.remove(slot);
            self.transport.set_interrupts(SlotMask::bit(slot), false);
        }
        if config.mode == Mode::FreeRunning {
            let triggered_in_flight =
                self.signals.is_armed() && !self.signals.target().is_subset_of(self.free_running);
            self.free_running.insert(slot);
            if !triggered_in_flight {
                self.signals.arm(self.free_running, self.free_running);
            }
            self.transport.set_interrupts(SlotMask::bit(slot), true);
        } else {
            self.free_running.remove(slot);
        }

        log_debug!(
            "slot {}: mode {}, {} mm ({} samples), static {}",
            slot,
            config.mode.bits(),
            config.max_range_mm,
            num_samples,
            config.static_range
        );
        Ok(())
    }

    /// First connected slot transmits, every other connected slot listens
    ///
    /// `template` supplies range and intervals. Thresholds are applied only
    /// where the variant supports them. Returns the transmitter's slot.
    pub fn configure_pitch_catch(&mut self, template: SensorConfig) -> GroupResult<u8> {
        let connected = self.connected_mask();
        let Some(transmitter) = connected.lowest() else {
            return Err(GroupError::NotConnected { slot: 0 });
        };

        for slot in connected.without(transmitter).iter().chain(Some(transmitter)) {
            let mode = if slot == transmitter { Mode::TriggeredTxRx } else { Mode::TriggeredRxOnly };
            let mut config = template.with_mode(mode);
            if !self.bound(slot).is_some_and(|d| d.firmware.supports_thresholds()) {
                config.thresholds = None;
            }
            self.configure(slot, config)?;
        }
        Ok(transmitter)
    }

    /// Configuration last applied to `slot`
    pub fn get_config(&self, slot: u8) -> GroupResult<SensorConfig> {
        Ok(*self.connected(slot)?.config())
    }

    /// Change only the mode
    pub fn set_mode(&mut self, slot: u8, mode: Mode) -> GroupResult<()> {
        let config = self.get_config(slot)?.with_mode(mode);
        self.configure(slot, config)
    }

    /// Change only the maximum range
    pub fn set_max_range(&mut self, slot: u8, mm: u16) -> GroupResult<()> {
        let config = self.get_config(slot)?.with_max_range(mm);
        self.configure(slot, config)
    }

    /// Change only the static target rejection range
    pub fn set_static_range(&mut self, slot: u8, samples: u16) -> GroupResult<()> {
        let config = self.get_config(slot)?.with_static_range(samples);
        self.configure(slot, config)
    }

    /// Change only the free-running interval
    pub fn set_sample_interval(&mut self, slot: u8, ms: u16) -> GroupResult<()> {
        let config = self.get_config(slot)?.with_sample_interval(ms);
        self.configure(slot, config)
    }

    /// Replace the threshold table
    pub fn set_thresholds(&mut self, slot: u8, thresholds: Thresholds) -> GroupResult<()> {
        let config = self.get_config(slot)?.with_thresholds(thresholds);
        self.configure(slot, config)
    }

    /// Read the threshold table back from the device
    pub fn get_thresholds(&mut self, slot: u8) -> GroupResult<Thresholds> {
        let device = connected_mut(&mut self.devices, slot)?;
        let bus = device.state.bus;
        device
            .firmware
            .get_thresholds(&mut self.transport, slot)
            .map_err(|_| GroupError::TransferError { slot, bus })?
            .ok_or(GroupError::ConfigurationError { slot, reason: "firmware has no threshold table" })
    }

    /// Set the receive length directly in samples
    pub fn set_num_samples(&mut self, slot: u8, num_samples: u16) -> GroupResult<()> {
        let device = connected_mut(&mut self.devices, slot)?;
        if num_samples > device.max_samples() {
            return Err(GroupError::ConfigurationError { slot, reason: "sample count beyond capacity" });
        }
        let bus = device.state.bus;
        device
            .firmware
            .set_num_samples(&mut self.transport, slot, num_samples)
            .map_err(|_| GroupError::TransferError { slot, bus })?;

        device.state.measurement.num_samples = num_samples;
        device.state.config.max_range_mm = device.samples_to_mm(num_samples);
        Ok(())
    }

    // ===== TRIGGERING =====

    /// Trigger one slot on its own
    ///
    /// The cycle completes when that slot alone reports.
    pub fn trigger(&mut self, slot: u8) -> GroupResult<()> {
        let device = self.connected(slot)?;
        if !device.config().mode.is_triggered() {
            return Err(GroupError::ConfigurationError { slot, reason: "slot is not in a triggered mode" });
        }
        let bus = device.bus();
        let mask = SlotMask::bit(slot);

        self.signals.arm(mask, SlotMask::EMPTY);
        self.transport.set_interrupts(mask, true);
        self.transport
            .trigger(mask)
            .map_err(|_| GroupError::TransferError { slot, bus })
    }

    /// Trigger every active slot with one fan-out pulse
    ///
    /// Re-arms the interrupt lines. Free-running slots are part of the
    /// cycle but are not pulsed. With no active slots the cycle completes
    /// immediately.
    pub fn group_trigger(&mut self) -> GroupResult<()> {
        let target = self.active;
        let pulsed = target - self.free_running;

        self.signals.arm(target, self.free_running);
        if target.is_empty() {
            self.signals.complete_empty_cycle();
            return Ok(());
        }

        self.transport.set_interrupts(target, true);
        if pulsed.is_empty() {
            return Ok(());
        }
        self.transport.trigger(pulsed).map_err(|_| {
            let slot = pulsed.lowest().unwrap_or(0);
            let bus = self.bound(slot).map_or(0, Device::bus);
            GroupError::TransferError { slot, bus }
        })
    }

    /// Register the per-interrupt hook
    pub fn set_interrupt_callback(&self, cb: InterruptCallback) {
        self.signals.set_interrupt_callback(Some(cb));
    }

    /// Register the non-blocking completion hook
    pub fn set_io_complete_callback(&self, cb: IoCompleteCallback) {
        self.signals.set_io_complete_callback(Some(cb));
    }

    // ===== RESULTS =====

    /// Read the last range with the given interpretation
    pub fn range(&mut self, slot: u8, kind: RangeKind) -> GroupResult<Range> {
        let device = connected_mut(&mut self.devices, slot)?;
        let bus = device.state.bus;
        let range = device
            .firmware
            .get_range(&mut self.transport, slot, kind, &device.state.calibration)
            .map_err(|_| GroupError::TransferError { slot, bus })?;
        device.state.measurement.range = range;
        Ok(range)
    }

    /// Echo amplitude of the last cycle
    ///
    /// When the last range read was "no target" the stored amplitude is
    /// returned unchanged and the device is not read.
    pub fn amplitude(&mut self, slot: u8) -> GroupResult<u16> {
        let device = connected_mut(&mut self.devices, slot)?;
        if !device.state.measurement.range.is_target() {
            return Ok(device.state.measurement.amplitude);
        }
        let bus = device.state.bus;
        let amplitude = device
            .firmware
            .get_amplitude(&mut self.transport, slot)
            .map_err(|_| GroupError::TransferError { slot, bus })?;
        device.state.measurement.amplitude = amplitude;
        Ok(amplitude)
    }

    /// Samples in the configured range
    pub fn num_samples(&self, slot: u8) -> GroupResult<u16> {
        Ok(self.connected(slot)?.measurement().num_samples)
    }

    /// Read `count` waveform samples starting at `start`
    ///
    /// Blocking reads land in the device buffer before returning.
    /// Non-blocking reads are queued on the slot's bus for the next
    /// [`start_nb`](Self::start_nb).
    pub fn read_samples(&mut self, slot: u8, start: u16, count: u16, mode: IoMode) -> GroupResult<()> {
        let device = connected_mut(&mut self.devices, slot)?;
        let bus = device.state.bus;
        let end = start as usize + count as usize;
        if end > device.max_samples() as usize {
            return Err(GroupError::ConfigurationError { slot, reason: "sample window beyond capacity" });
        }
        if count == 0 {
            return Ok(());
        }

        match mode {
            IoMode::Blocking => {
                let window = &mut device.state.samples[start as usize..end];
                let result = device.firmware.read_samples(&mut self.transport, slot, start, window);
                if result.is_err() {
                    let e = GroupError::TransferError { slot, bus };
                    device.state.last_error = Some(e);
                    return Err(e);
                }
                device.state.set_sample_window(start, end as u16);
                Ok(())
            }
            IoMode::NonBlocking => {
                let request = ReadRequest {
                    slot,
                    data_addr: device.firmware.registers().data,
                    start_sample: start,
                    num_samples: count,
                };
                self.queues.push(bus, request).map_err(|e| GroupError::ConfigurationError {
                    slot,
                    reason: match e {
                        QueueError::Duplicate => "slot already queued",
                        QueueError::InFlight => "non-blocking round in flight",
                        QueueError::Full => "bus queue full",
                        QueueError::NoSuchBus => "bus index out of range",
                    },
                })
            }
        }
    }

    /// Samples held from the last readout
    ///
    /// Only the window of that readout is returned; it begins at
    /// [`Device::samples_start`].
    pub fn samples(&self, slot: u8) -> GroupResult<&[IqSample]> {
        Ok(self.connected(slot)?.samples())
    }

    /// Read a full result snapshot for `slot`
    ///
    /// Listen-only slots read the direct path, others the one-way distance.
    /// Amplitude is fetched only when a target was found. With `samples`
    /// set, the whole configured window is also read or queued.
    pub fn read_measurement(&mut self, slot: u8, samples: Option<IoMode>) -> GroupResult<Measurement> {
        let mode = self.connected(slot)?.config().mode;
        let kind = if mode == Mode::TriggeredRxOnly { RangeKind::Direct } else { RangeKind::OneWay };

        let range = self.range(slot, kind)?;
        let amplitude = self.amplitude(slot)?;
        let num_samples = self.num_samples(slot)?;
        if let Some(io) = samples {
            self.read_samples(slot, 0, num_samples, io)?;
        }
        Ok(Measurement { range, amplitude, num_samples })
    }

    // ===== NON-BLOCKING READOUT =====

    /// Start every queued read, one transfer per busy bus
    ///
    /// Returns the buses started. A bus that fails to start is reported as
    /// done-with-error so the round still completes; the first such error
    /// is returned after the remaining buses are started.
    pub fn start_nb<C: TimeSource>(&mut self, clock: &C) -> GroupResult<BusMask> {
        if self.queues.in_flight() {
            let slot = self.queues.started().iter().flat_map(|b| self.queues.bus(b)).next().map_or(0, |r| r.slot);
            return Err(GroupError::ConfigurationError { slot, reason: "non-blocking round in flight" });
        }

        let buses = self.queues.busy_buses();
        self.queues.mark_started(buses, clock.now());
        self.signals.begin_io(buses);

        let mut first_error = None;
        for bus in buses {
            let requests = self.queues.bus(bus);
            if self.transport.start_read_nb(bus, requests).is_err() {
                let slot = requests.first().map_or(0, |r| r.slot);
                let e = GroupError::TransferError { slot, bus };
                log_warn!("bus {}: non-blocking start failed", bus);
                self.signals.notify_bus_failed(bus);
                first_error.get_or_insert(e);
            }
        }

        log_debug!("non-blocking round on buses {}, {} reads", buses.bits(), self.queues.len());
        match first_error {
            Some(e) => Err(e),
            None => Ok(buses),
        }
    }

    /// Collect the data of a completed round and clear the queues
    ///
    /// `WouldBlock` while any started bus is outstanding. Reads on failed
    /// buses record a transfer error on their device; the first is returned.
    pub fn finish_nb(&mut self) -> nb::Result<(), GroupError> {
        if !self.queues.in_flight() {
            self.queues.clear();
            return Ok(());
        }
        if !self.signals.io_outstanding().is_empty() {
            return Err(nb::Error::WouldBlock);
        }

        let failed = self.signals.io_failed();
        let mut first_error = None;

        for bus in self.queues.started() {
            for request in self.queues.bus(bus) {
                let slot = request.slot;
                let Some(device) = self.devices[slot as usize].as_mut() else {
                    continue;
                };
                let start = request.start_sample as usize;
                let end = start + request.num_samples as usize;
                let error = GroupError::TransferError { slot, bus };

                let received = if failed.contains(bus) {
                    None
                } else {
                    self.transport
                        .take_nb_samples(slot, &mut device.state.samples[start..end])
                        .ok()
                };

                match received {
                    Some(n) if n == request.num_samples as usize => {
                        device.state.set_sample_window(request.start_sample, end as u16);
                        device.state.last_error = None;
                    }
                    Some(n) => {
                        log_warn!("slot {}: short transfer, {} of {} samples", slot, n, request.num_samples);
                        device.state.set_sample_window(request.start_sample, (start + n) as u16);
                        device.state.last_error = Some(error);
                        first_error.get_or_insert(error);
                    }
                    None => {
                        device.state.last_error = Some(error);
                        first_error.get_or_insert(error);
                    }
                }
            }
        }

        self.queues.clear();
        match first_error {
            Some(e) => Err(nb::Error::Other(e)),
            None => Ok(()),
        }
    }

    /// Force completion of a round that exceeded its bound
    ///
    /// Buses still outstanding after [`GroupConfig::nb_timeout`] are
    /// cancelled and counted as failed, which completes the round and fires
    /// the completion hook once. Returns `IoTimeout` naming those buses.
    pub fn poll_nb_timeout<C: TimeSource>(&mut self, clock: &C) -> GroupResult<()> {
        if !self.queues.in_flight() {
            return Ok(());
        }
        let outstanding = self.signals.io_outstanding();
        if outstanding.is_empty() {
            return Ok(());
        }
        if elapsed_ms(self.queues.started_at(), clock.now()) < u64::from(self.config.nb_timeout.to_millis()) {
            return Ok(());
        }

        for bus in outstanding {
            self.transport.cancel_nb(bus);
            self.signals.notify_bus_failed(bus);
        }
        log_warn!("non-blocking round timed out on buses {}", outstanding.bits());
        Err(GroupError::IoTimeout { bus_mask: outstanding.bits() })
    }

    /// Reads queued for the next round
    pub fn queued_reads(&self) -> usize {
        self.queues.len()
    }

    /// Last transfer or bring-up error recorded for `slot`
    pub fn transfer_error(&self, slot: u8) -> Option<GroupError> {
        self.bound(slot).and_then(Device::last_error)
    }

    // ===== QUERIES =====

    /// Descriptor of a bound slot
    pub fn device(&self, slot: u8) -> Option<&Device> {
        self.bound(slot)
    }

    /// Slot has a connected device
    pub fn is_connected(&self, slot: u8) -> bool {
        self.bound(slot).is_some_and(Device::is_connected)
    }

    /// Every connected slot
    pub fn connected_mask(&self) -> SlotMask {
        self.devices
            .iter()
            .flatten()
            .filter(|d| d.is_connected())
            .fold(SlotMask::EMPTY, |m, d| m.with(d.slot()))
    }

    /// Number of connected devices
    pub fn sensor_count(&self) -> u32 {
        self.connected_mask().count()
    }

    /// Slots taking part in group cycles
    pub fn active_mask(&self) -> SlotMask {
        self.active
    }

    /// Slots in free-running mode
    pub fn free_running_mask(&self) -> SlotMask {
        self.free_running
    }

    /// Buses carrying at least one bound slot
    pub fn bus_mask(&self) -> BusMask {
        self.devices.iter().flatten().fold(BusMask::EMPTY, |m, d| m.with(d.bus()))
    }

    /// Part number of a connected slot
    pub fn part_number(&self, slot: u8) -> GroupResult<u16> {
        Ok(self.connected(slot)?.part_number())
    }

    /// Firmware version of a connected slot
    pub fn fw_version(&self, slot: u8) -> GroupResult<&'static str> {
        Ok(self.connected(slot)?.fw_version())
    }

    /// Calibration of a connected slot
    pub fn calibration(&self, slot: u8) -> GroupResult<Calibration> {
        Ok(*self.connected(slot)?.calibration())
    }

    /// Operating frequency of a connected slot (Hz)
    pub fn operating_frequency(&self, slot: u8) -> GroupResult<u32> {
        Ok(self.connected(slot)?.calibration().op_frequency_hz)
    }

    /// RTC calibration pulse length (ms)
    pub fn rtc_pulse_ms(&self) -> u32 {
        self.config.rtc_pulse.to_millis()
    }

    /// Samples to millimetres for `slot`
    pub fn samples_to_mm(&self, slot: u8, num_samples: u16) -> GroupResult<u16> {
        Ok(self.connected(slot)?.samples_to_mm(num_samples))
    }

    /// Millimetres to samples for `slot`
    pub fn mm_to_samples(&self, slot: u8, mm: u16) -> GroupResult<u16> {
        Ok(self.connected(slot)?.mm_to_samples(mm))
    }

    /// Board timing in use
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Shared interrupt state
    pub fn signals(&self) -> &'s GroupSignals {
        self.signals
    }

    /// Board transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Board transport, mutably
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back
    pub fn release(self) -> T {
        self.transport
    }

    fn bound(&self, slot: u8) -> Option<&Device> {
        self.devices.get(slot as usize).and_then(Option::as_ref)
    }

    fn connected(&self, slot: u8) -> GroupResult<&Device> {
        self.bound(slot)
            .filter(|d| d.is_connected())
            .ok_or(GroupError::NotConnected { slot })
    }
}

/// Push `config` to the device: idle first, mode last
fn write_config<T: Transport>(
    t: &mut T,
    firmware: &Firmware,
    slot: u8,
    config: &SensorConfig,
    num_samples: u16,
) -> Result<(), T::Error> {
    firmware.set_mode(t, slot, Mode::Idle)?;
    firmware.set_num_samples(t, slot, num_samples)?;
    firmware.set_static_range(t, slot, config.static_range)?;
    if let Some(thresholds) = &config.thresholds {
        firmware.set_thresholds(t, slot, thresholds)?;
    }
    if config.mode == Mode::FreeRunning {
        firmware.set_sample_interval(t, slot, config.sample_interval_ms)?;
    }
    if config.mode != Mode::Idle {
        firmware.set_mode(t, slot, config.mode)?;
    }
    Ok(())
}

fn connected_mut<const N: usize>(devices: &mut [Option<Device>; N], slot: u8) -> GroupResult<&mut Device> {
    devices
        .get_mut(slot as usize)
        .and_then(Option::as_mut)
        .filter(|d| d.state.connected)
        .ok_or(GroupError::NotConnected { slot })
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::sim::{SimSensor, SimTransport};

    static IMAGE: crate::FirmwareImage = crate::FirmwareImage::new("unit_fw", &[0x01, 0x02, 0x03]);
    static EMPTY_IMAGE: crate::FirmwareImage = crate::FirmwareImage::new("empty", &[]);

    fn board(sensors: usize) -> SimTransport {
        SimTransport::new((0..sensors).map(|_| SimSensor::ch101(0)).collect())
    }

    #[test]
    fn binding_rejects_malformed_input() {
        let signals = GroupSignals::new();
        let mut group: Group<_, 2> = Group::new(board(2), &signals, GroupConfig::with_ports(2));

        assert!(group.init_slot(0, Firmware::gpr(&IMAGE)).is_ok());
        assert!(matches!(
            group.init_slot(0, Firmware::gpr(&IMAGE)),
            Err(GroupError::InvalidBinding { slot: 0, .. })
        ));
        assert!(matches!(
            group.init_slot(2, Firmware::gpr(&IMAGE)),
            Err(GroupError::InvalidBinding { slot: 2, .. })
        ));
        assert!(matches!(
            group.init_slot(1, Firmware::gpr(&EMPTY_IMAGE)),
            Err(GroupError::InvalidBinding { slot: 1, .. })
        ));
        // Binding never talks to the devices
        assert!(group.transport().events().is_empty());
    }

    #[test]
    fn unwired_port_rejected() {
        let signals = GroupSignals::new();
        let mut group: Group<_, 4> = Group::new(board(4), &signals, GroupConfig::with_ports(2));
        assert!(group.init_slot(3, Firmware::gpr(&IMAGE)).is_err());
    }

    #[test]
    fn unbound_slots_are_skipped() {
        let signals = GroupSignals::new();
        let mut group: Group<_, 4> = Group::new(board(4), &signals, GroupConfig::fast());
        group.init_slot(1, Firmware::gpr(&IMAGE)).unwrap();

        let report = group.start();
        assert!(report.is_ok());
        assert_eq!(report.connected(), SlotMask::bit(1));
        assert_eq!(group.device(1).map(Device::address), Some(group.transport().bus_info(1).address));
    }

    #[test]
    fn second_transmitter_rejected() {
        let signals = GroupSignals::new();
        let mut group: Group<_, 2> = Group::new(board(2), &signals, GroupConfig::fast());
        group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
        group.init_slot(1, Firmware::gpr(&IMAGE)).unwrap();
        assert!(group.start().is_ok());

        group.configure(0, SensorConfig::bench()).unwrap();
        assert!(matches!(
            group.configure(1, SensorConfig::bench()),
            Err(GroupError::ConfigurationError { slot: 1, .. })
        ));
        // Reconfiguring the transmitter itself is fine
        group.configure(0, SensorConfig::bench().with_max_range(500)).unwrap();
    }

    #[test]
    fn thresholds_need_support() {
        let signals = GroupSignals::new();
        let mut group: Group<_, 1> = Group::new(board(1), &signals, GroupConfig::fast());
        group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
        group.start();

        let config = SensorConfig::bench().with_thresholds(Thresholds::long_range());
        assert!(matches!(
            group.configure(0, config),
            Err(GroupError::ConfigurationError { .. })
        ));
        assert!(group.get_thresholds(0).is_err());
    }

    #[test]
    fn operations_on_disconnected_slot() {
        let signals = GroupSignals::new();
        let mut group: Group<_, 2> = Group::new(board(2), &signals, GroupConfig::fast());
        group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
        group.start();
        group.configure(0, SensorConfig::bench()).unwrap();
        assert!(group.active_mask().contains(0));

        group.disconnect(0);
        assert!(!group.is_connected(0));
        assert!(group.active_mask().is_empty());
        assert_eq!(group.range(0, RangeKind::OneWay), Err(GroupError::NotConnected { slot: 0 }));
        assert_eq!(group.num_samples(1), Err(GroupError::NotConnected { slot: 1 }));
    }

    #[test]
    fn sample_window_checked() {
        let signals = GroupSignals::new();
        let mut group: Group<_, 1> = Group::new(board(1), &signals, GroupConfig::fast());
        group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
        group.start();
        group.configure(0, SensorConfig::bench()).unwrap();

        assert!(group.read_samples(0, 140, 20, IoMode::Blocking).is_err());
        assert!(group.read_samples(0, 0, 0, IoMode::Blocking).is_ok());
    }
}
