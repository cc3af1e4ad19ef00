//! Simulated board for host tests and demos
//!
//! [`SimTransport`] models a board with one [`SimSensor`] per slot. Each
//! sensor has a flat register space laid out by its firmware variant's
//! [`RegisterMap`], counts lock polls, answers the RTC calibration pulse and
//! writes a canned echo when triggered.
//!
//! Interrupts are not delivered by themselves. Tests decide when and in
//! which order they reach [`GroupSignals`]:
//!
//! ```rust
//! use echogroup_core::sim::{SimSensor, SimTransport};
//! use echogroup_core::{Firmware, FirmwareImage, Group, GroupConfig, GroupSignals, SensorConfig};
//!
//! static IMAGE: FirmwareImage = FirmwareImage::new("sim_fw", &[0x5A; 8]);
//! let signals = GroupSignals::new();
//!
//! let board = SimTransport::new(vec![SimSensor::ch101(0), SimSensor::ch101(1)]);
//! let mut group: Group<_, 2> = Group::new(board, &signals, GroupConfig::fast());
//! group.init_slot(0, Firmware::gpr(&IMAGE)).unwrap();
//! group.init_slot(1, Firmware::gpr(&IMAGE)).unwrap();
//! assert!(group.start().is_ok());
//!
//! group.configure(0, SensorConfig::bench()).unwrap();
//! group.group_trigger().unwrap();
//! group.transport_mut().deliver_interrupts(&signals);
//! assert!(signals.poll_cycle().is_ok());
//! ```

use std::collections::HashMap;

use thiserror_no_std::Error;

use crate::config::Mode;
use crate::constants::{PROG_I2C_ADDR, READY_FREQ_LOCKED, SIGNATURE, TOF_NO_TARGET};
use crate::device::IqSample;
use crate::firmware::{gpr, gprmt, FirmwareImage, RegisterMap};
use crate::mask::{BusMask, SlotMask};
use crate::signals::{GroupSignals, InterruptOutcome};
use crate::transport::{BusInfo, ReadRequest, Transport};

const MEMORY_SIZE: usize = 4096;
const RTC_HZ: u32 = 29_500;
const TOF_SCALE_FACTOR: u16 = 2048;
const APP_ADDR_BASE: u8 = 0x29;

/// Simulated bus failure
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimError {
    /// No device answered
    #[error("no acknowledge")]
    Nack,
    /// Bus configured to fail
    #[error("bus fault")]
    BusFault,
    /// Register access beyond the device's memory
    #[error("address {0:#06x} out of range")]
    OutOfRange(u16),
}

/// Something the board did, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// Reset line asserted or soft reset issued
    Reset(u8),
    /// Firmware image transferred
    Program(u8),
    /// RTC calibration pulse held
    CalPulse {
        /// Slot pulsed
        slot: u8,
        /// Pulse length
        ms: u32,
    },
    /// Fan-out trigger pulse
    Trigger(SlotMask),
    /// A device transmitted
    Transmit(u8),
    /// A device listened
    Receive(u8),
    /// Non-blocking transfer started
    NbStart(u8),
    /// Non-blocking transfer abandoned
    NbCancel(u8),
}

/// One simulated device
#[derive(Debug, Clone)]
pub struct SimSensor {
    bus: u8,
    present: bool,
    registers: &'static RegisterMap,
    raw_frequency: u16,
    lock_after: Option<u32>,
    echo: (u16, u16),
    samples: Vec<IqSample>,
    mem: Vec<u8>,
    running: bool,
    ready_polls: u32,
    address: u8,
    programmed_with: Option<&'static str>,
    write_fault: Option<u16>,
    transfer_limit: Option<usize>,
}

impl SimSensor {
    fn new(bus: u8, registers: &'static RegisterMap, raw_frequency: u16, max_samples: usize) -> Self {
        Self {
            bus,
            present: true,
            registers,
            raw_frequency,
            lock_after: Some(3),
            echo: (1000, 420),
            samples: (0..max_samples).map(|n| IqSample::new(n as i16, -(n as i16))).collect(),
            mem: vec![0; MEMORY_SIZE],
            running: false,
            ready_polls: 0,
            address: PROG_I2C_ADDR,
            programmed_with: None,
            write_fault: None,
            transfer_limit: None,
        }
    }

    /// Short-range part on `bus`, about 175 kHz
    pub fn ch101(bus: u8) -> Self {
        Self::new(bus, &gpr::REGISTERS, 12153, 150)
    }

    /// Long-range part on `bus`, about 85 kHz
    pub fn ch201(bus: u8) -> Self {
        Self::new(bus, &gprmt::REGISTERS, 5903, 450)
    }

    /// Empty socket
    pub fn absent() -> Self {
        Self { present: false, ..Self::ch101(0) }
    }

    /// Firmware starts but never reports lock
    pub fn never_locks(mut self) -> Self {
        self.lock_after = None;
        self
    }

    /// Report lock on the `polls`-th poll
    pub fn locks_after(mut self, polls: u32) -> Self {
        self.lock_after = Some(polls);
        self
    }

    /// Echo written on every trigger
    pub fn with_echo(mut self, tof: u16, amplitude: u16) -> Self {
        self.echo = (tof, amplitude);
        self
    }

    /// Nothing in range
    pub fn no_echo(self) -> Self {
        self.with_echo(TOF_NO_TARGET, 0)
    }

    /// Waveform written on every trigger
    pub fn with_samples(mut self, samples: Vec<IqSample>) -> Self {
        self.samples = samples;
        self
    }

    /// Writes to `addr` are refused until cleared with `None`
    pub fn set_write_fault(&mut self, addr: Option<u16>) {
        self.write_fault = addr;
    }

    /// Non-blocking transfers deliver at most `samples` samples
    pub fn set_transfer_limit(&mut self, samples: Option<usize>) {
        self.transfer_limit = samples;
    }

    /// Lock polls seen since the last reset
    pub fn ready_polls(&self) -> u32 {
        self.ready_polls
    }

    /// Address the device answers on
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Version of the image last programmed
    pub fn programmed_with(&self) -> Option<&'static str> {
        self.programmed_with
    }

    /// Mode register contents
    pub fn mode(&self) -> Option<Mode> {
        Mode::from_bits(self.mem[self.registers.opmode as usize])
    }

    /// Little-endian u16 register contents
    pub fn register_u16(&self, addr: u16) -> u16 {
        let a = addr as usize;
        u16::from_le_bytes([self.mem[a], self.mem[a + 1]])
    }

    fn put_u16(&mut self, addr: u16, value: u16) {
        let a = addr as usize;
        self.mem[a..a + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn power_cycle(&mut self) {
        self.mem.fill(0);
        self.running = false;
        self.ready_polls = 0;
        self.address = PROG_I2C_ADDR;
    }

    fn span(&self, addr: u16, len: usize) -> Result<core::ops::Range<usize>, SimError> {
        let start = addr as usize;
        let end = start + len;
        if end > self.mem.len() {
            return Err(SimError::OutOfRange(addr));
        }
        Ok(start..end)
    }

    fn measure(&mut self) {
        let (tof, amplitude) = self.echo;
        self.put_u16(self.registers.tof, tof);
        self.put_u16(self.registers.amplitude, amplitude);

        let base = self.registers.data as usize;
        for (n, sample) in self.samples.iter().enumerate() {
            let at = base + n * 4;
            self.mem[at..at + 4].copy_from_slice(&sample.to_le_bytes());
        }
    }
}

/// In-flight non-blocking transfer on one bus
#[derive(Debug, Clone)]
struct NbTransfer {
    requests: Vec<ReadRequest>,
}

/// Simulated board
#[derive(Debug, Default)]
pub struct SimTransport {
    sensors: Vec<SimSensor>,
    events: Vec<SimEvent>,
    interrupts_enabled: SlotMask,
    pending: Vec<u8>,
    failing_buses: BusMask,
    in_flight: HashMap<u8, NbTransfer>,
    staged: HashMap<u8, Vec<IqSample>>,
    elapsed_ms: u64,
}

impl SimTransport {
    /// Board with `sensors[i]` in slot `i`
    pub fn new(sensors: Vec<SimSensor>) -> Self {
        Self { sensors, ..Self::default() }
    }

    /// Everything the board did so far
    pub fn events(&self) -> &[SimEvent] {
        &self.events
    }

    /// Forget recorded events
    pub fn clear_events(&mut self) {
        self.events.clear();
    }

    /// Count events matching `pred`
    pub fn count_events(&self, pred: impl Fn(&SimEvent) -> bool) -> usize {
        self.events.iter().filter(|e| pred(e)).count()
    }

    /// Sensor in `slot`
    pub fn sensor(&self, slot: u8) -> Option<&SimSensor> {
        self.sensors.get(slot as usize)
    }

    /// Sensor in `slot`, mutably
    pub fn sensor_mut(&mut self, slot: u8) -> Option<&mut SimSensor> {
        self.sensors.get_mut(slot as usize)
    }

    /// Interrupt lines currently enabled
    pub fn interrupts_enabled(&self) -> SlotMask {
        self.interrupts_enabled
    }

    /// Interrupts raised and not yet delivered
    pub fn pending_interrupts(&self) -> &[u8] {
        &self.pending
    }

    /// Total time spent in `delay_ms`
    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    /// Make non-blocking starts on `bus` fail
    pub fn set_bus_failing(&mut self, bus: u8, failing: bool) {
        if failing {
            self.failing_buses.insert(bus);
        } else {
            self.failing_buses.remove(bus);
        }
    }

    /// Buses with a non-blocking transfer in flight
    pub fn nb_in_flight(&self) -> BusMask {
        self.in_flight.keys().fold(BusMask::EMPTY, |m, &b| m.with(b))
    }

    fn live(&mut self, slot: u8) -> Result<&mut SimSensor, SimError> {
        self.sensors
            .get_mut(slot as usize)
            .filter(|s| s.present)
            .ok_or(SimError::Nack)
    }

    fn raise(&mut self, slot: u8) {
        if self.interrupts_enabled.contains(slot) && !self.pending.contains(&slot) {
            self.pending.push(slot);
        }
    }

    // ===== INTERRUPT DELIVERY =====

    /// Deliver every pending interrupt in the order raised
    pub fn deliver_interrupts(&mut self, signals: &GroupSignals) -> Vec<InterruptOutcome> {
        let order: Vec<u8> = self.pending.clone();
        self.deliver_in_order(&order, signals)
    }

    /// Deliver pending interrupts of `order`, in that order
    ///
    /// Acts like the board ISR: when a completed cycle asks for the lines to
    /// be masked, the remaining interrupts are dropped.
    pub fn deliver_in_order(&mut self, order: &[u8], signals: &GroupSignals) -> Vec<InterruptOutcome> {
        let mut outcomes = Vec::new();
        for &slot in order {
            let Some(pos) = self.pending.iter().position(|&s| s == slot) else {
                continue;
            };
            self.pending.remove(pos);
            if !self.interrupts_enabled.contains(slot) {
                continue;
            }

            let outcome = signals.on_interrupt(slot);
            outcomes.push(outcome);
            if outcome == (InterruptOutcome::CycleComplete { disable_line: true }) {
                self.interrupts_enabled = SlotMask::EMPTY;
                self.pending.clear();
                break;
            }
        }
        outcomes
    }

    /// Interrupt from `slot` regardless of line state, like a glitch
    pub fn inject_interrupt(&mut self, slot: u8, signals: &GroupSignals) -> InterruptOutcome {
        signals.on_interrupt(slot)
    }

    /// Every free-running sensor takes one measurement
    pub fn tick_free_running(&mut self) {
        let slots: Vec<u8> = (0..self.sensors.len() as u8)
            .filter(|&s| {
                let sensor = &self.sensors[s as usize];
                sensor.present && sensor.running && sensor.mode() == Some(Mode::FreeRunning)
            })
            .collect();
        for slot in slots {
            self.sensors[slot as usize].measure();
            self.raise(slot);
        }
    }

    // ===== NON-BLOCKING TRANSFERS =====

    /// Finish the transfer on `bus` and report it, like a DMA-complete ISR
    ///
    /// Returns whether the round completed. `false` if nothing was in flight.
    pub fn complete_bus(&mut self, bus: u8, signals: &GroupSignals) -> bool {
        let Some(transfer) = self.in_flight.remove(&bus) else {
            return false;
        };
        for request in transfer.requests {
            let Some(sensor) = self.sensors.get(request.slot as usize) else {
                continue;
            };
            let Ok(span) = sensor.span(request.start_addr(), request.byte_len()) else {
                continue;
            };
            let data = sensor.mem[span]
                .chunks_exact(4)
                .map(|b| IqSample::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .take(sensor.transfer_limit.unwrap_or(usize::MAX))
                .collect();
            self.staged.insert(request.slot, data);
        }
        signals.notify_bus_complete(bus)
    }

    /// Fail the transfer on `bus` mid-flight
    pub fn fail_bus(&mut self, bus: u8, signals: &GroupSignals) -> bool {
        if self.in_flight.remove(&bus).is_none() {
            return false;
        }
        signals.notify_bus_failed(bus)
    }
}

impl Transport for SimTransport {
    type Error = SimError;

    fn bus_info(&self, slot: u8) -> BusInfo {
        BusInfo {
            bus: self.sensors.get(slot as usize).map_or(0, |s| s.bus),
            address: APP_ADDR_BASE + slot,
        }
    }

    fn read_signature(&mut self, slot: u8) -> Result<[u8; 2], SimError> {
        self.live(slot).map(|_| SIGNATURE)
    }

    fn reset(&mut self, slot: u8, asserted: bool) -> Result<(), SimError> {
        let sensor = self.live(slot)?;
        if asserted {
            sensor.power_cycle();
            self.events.push(SimEvent::Reset(slot));
        }
        Ok(())
    }

    fn soft_reset(&mut self, slot: u8) -> Result<(), SimError> {
        self.live(slot)?.power_cycle();
        self.events.push(SimEvent::Reset(slot));
        Ok(())
    }

    fn program(&mut self, slot: u8, image: &FirmwareImage) -> Result<(), SimError> {
        let sensor = self.live(slot)?;
        if !image.ram_init.is_empty() {
            let span = sensor.span(image.ram_init_addr, image.ram_init.len())?;
            sensor.mem[span].copy_from_slice(image.ram_init);
        }
        sensor.programmed_with = Some(image.version);
        self.events.push(SimEvent::Program(slot));
        Ok(())
    }

    fn assign_address(&mut self, slot: u8, address: u8) -> Result<(), SimError> {
        self.live(slot)?.address = address;
        Ok(())
    }

    fn start(&mut self, slot: u8) -> Result<(), SimError> {
        let sensor = self.live(slot)?;
        if sensor.programmed_with.is_none() {
            return Err(SimError::Nack);
        }
        sensor.running = true;
        Ok(())
    }

    fn read(&mut self, slot: u8, addr: u16, buf: &mut [u8]) -> Result<(), SimError> {
        let sensor = self.live(slot)?;
        if addr == sensor.registers.ready {
            sensor.ready_polls += 1;
            let locked = sensor.running && sensor.lock_after.is_some_and(|n| sensor.ready_polls >= n);
            sensor.mem[addr as usize] = if locked { READY_FREQ_LOCKED } else { 0 };
        }
        let span = sensor.span(addr, buf.len())?;
        buf.copy_from_slice(&sensor.mem[span]);
        Ok(())
    }

    fn write(&mut self, slot: u8, addr: u16, data: &[u8]) -> Result<(), SimError> {
        let sensor = self.live(slot)?;
        if sensor.write_fault == Some(addr) {
            return Err(SimError::BusFault);
        }
        let span = sensor.span(addr, data.len())?;
        sensor.mem[span].copy_from_slice(data);
        Ok(())
    }

    fn delay_ms(&mut self, ms: u32) {
        self.elapsed_ms += u64::from(ms);
    }

    fn calibration_pulse(&mut self, slot: u8, ms: u32) -> Result<(), SimError> {
        let sensor = self.live(slot)?;
        let regs = sensor.registers;
        let ticks = (RTC_HZ * ms / 1000) as u16;
        let raw_frequency = sensor.raw_frequency;
        sensor.put_u16(regs.cal_result, ticks);
        sensor.put_u16(regs.period, raw_frequency);
        sensor.put_u16(regs.tof_sf, TOF_SCALE_FACTOR);

        self.elapsed_ms += u64::from(ms);
        self.events.push(SimEvent::CalPulse { slot, ms });
        Ok(())
    }

    fn trigger(&mut self, mask: SlotMask) -> Result<(), SimError> {
        self.events.push(SimEvent::Trigger(mask));
        for slot in mask {
            let Some(sensor) = self.sensors.get_mut(slot as usize) else {
                continue;
            };
            if !sensor.present || !sensor.running {
                continue;
            }
            match sensor.mode() {
                Some(Mode::TriggeredTxRx) => {
                    sensor.measure();
                    self.events.push(SimEvent::Transmit(slot));
                    self.events.push(SimEvent::Receive(slot));
                }
                Some(Mode::TriggeredRxOnly) => {
                    sensor.measure();
                    self.events.push(SimEvent::Receive(slot));
                }
                _ => continue,
            }
            self.raise(slot);
        }
        Ok(())
    }

    fn set_interrupts(&mut self, mask: SlotMask, enabled: bool) {
        if enabled {
            self.interrupts_enabled |= mask;
        } else {
            self.interrupts_enabled = self.interrupts_enabled - mask;
        }
    }

    fn start_read_nb(&mut self, bus: u8, requests: &[ReadRequest]) -> Result<(), SimError> {
        if self.failing_buses.contains(bus) {
            return Err(SimError::BusFault);
        }
        self.in_flight.insert(bus, NbTransfer { requests: requests.to_vec() });
        self.events.push(SimEvent::NbStart(bus));
        Ok(())
    }

    fn take_nb_samples(&mut self, slot: u8, out: &mut [IqSample]) -> Result<usize, SimError> {
        let data = self.staged.remove(&slot).ok_or(SimError::Nack)?;
        let n = data.len().min(out.len());
        out[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn cancel_nb(&mut self, bus: u8) {
        if self.in_flight.remove(&bus).is_some() {
            self.events.push(SimEvent::NbCancel(bus));
        }
    }
}
