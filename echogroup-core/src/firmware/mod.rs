//! Firmware Capability Binding
//!
//! ## Overview
//!
//! Every device runs one of a closed set of firmware variants. All variants
//! expose the same operations (set mode, read range, read samples, ...) but
//! differ in register layout, capacity and range scaling. [`FirmwareOps`]
//! is that operation set; [`Firmware`] is the tagged variant bound to a slot.
//!
//! ```text
//!            ┌─────────────────────────┐
//!            │       FirmwareOps       │  default methods driven by
//!            │  set_mode  get_range .. │  the variant's RegisterMap
//!            └────────────┬────────────┘
//!          ┌──────────────┴──────────────┐
//!   ┌──────┴───────┐             ┌───────┴──────────────┐
//!   │ GprFirmware  │             │ GprMultiThreshold    │
//!   │ part 101     │             │ part 201             │
//!   │ 150 samples  │             │ 450 samples, ×2 range│
//!   │ no thresholds│             │ 6-entry thresholds   │
//!   └──────────────┘             └──────────────────────┘
//! ```
//!
//! Binding happens once per slot and never touches the bus. The image bytes
//! are supplied by the application; this crate never ships firmware.
//!
//! ## Range Math
//!
//! The device reports time of flight in its own clock ticks. Converting to
//! millimetres × 32 uses the RTC calibration captured at bring-up:
//!
//! ```text
//!            343 × pulse_ms × tof
//! range = ──────────────────────────── × scale      (÷ 2 for one-way)
//!          (rtc_cal × tof_sf) >> 11
//! ```
//!
//! Sample counts convert through the operating frequency `f`, one sample per
//! eight transducer cycles:
//!
//! ```text
//! mm = n × 343 × 8000 × scale / (2f)
//! ```

use crate::config::{Mode, RangeKind, Thresholds, Threshold};
use crate::constants::capacity::READ_CHUNK_SAMPLES;
use crate::constants::parts::{FREQ_COUNTER_CYCLES, READY_FREQ_LOCKED};
use crate::constants::ranging::TOF_SCALE_SHIFT;
use crate::constants::{NUM_THRESHOLDS, SPEED_OF_SOUND_MPS, TOF_NO_TARGET};
use crate::device::{Calibration, IqSample, Range};
use crate::transport::Transport;

pub mod gpr;
pub mod gprmt;

pub use gpr::GprFirmware;
pub use gprmt::GprMultiThresholdFirmware;

/// Application-supplied firmware image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareImage {
    /// Version string reported for the image
    pub version: &'static str,
    /// Program memory contents
    pub code: &'static [u8],
    /// RAM address of the initialisation block
    pub ram_init_addr: u16,
    /// RAM initialisation block
    pub ram_init: &'static [u8],
}

impl FirmwareImage {
    /// Image without a RAM initialisation block
    pub const fn new(version: &'static str, code: &'static [u8]) -> Self {
        Self { version, code, ram_init_addr: 0, ram_init: &[] }
    }

    /// Attach a RAM initialisation block
    pub const fn with_ram_init(mut self, addr: u16, bytes: &'static [u8]) -> Self {
        self.ram_init_addr = addr;
        self.ram_init = bytes;
        self
    }

    /// No program bytes
    pub const fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

/// Register addresses of a firmware variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterMap {
    /// Operating mode (u8)
    pub opmode: u16,
    /// Free-running interval (u16, ms)
    pub tick_interval: u16,
    /// Raw transducer frequency count (u16)
    pub period: u16,
    /// Calibration trigger (u8)
    pub cal_trig: u16,
    /// Receive length in samples (u16)
    pub max_range: u16,
    /// RTC calibration result (u16)
    pub cal_result: u16,
    /// Static target rejection samples (u16)
    pub st_range: u16,
    /// Ready / lock flags (u8)
    pub ready: u16,
    /// Time-of-flight scale factor (u16)
    pub tof_sf: u16,
    /// Time of flight (u16)
    pub tof: u16,
    /// Echo amplitude (u16)
    pub amplitude: u16,
    /// First IQ sample, four bytes each
    pub data: u16,
    /// Threshold table, `(start, level)` u16 pairs, if supported
    pub thresholds: Option<u16>,
}

fn read_u8<T: Transport>(t: &mut T, slot: u8, addr: u16) -> Result<u8, T::Error> {
    let mut buf = [0u8; 1];
    t.read(slot, addr, &mut buf)?;
    Ok(buf[0])
}

fn read_u16<T: Transport>(t: &mut T, slot: u8, addr: u16) -> Result<u16, T::Error> {
    let mut buf = [0u8; 2];
    t.read(slot, addr, &mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn write_u8<T: Transport>(t: &mut T, slot: u8, addr: u16, value: u8) -> Result<(), T::Error> {
    t.write(slot, addr, &[value])
}

fn write_u16<T: Transport>(t: &mut T, slot: u8, addr: u16, value: u16) -> Result<(), T::Error> {
    t.write(slot, addr, &value.to_le_bytes())
}

/// Convert a raw time of flight to a [`Range`]
///
/// `scale` is the variant's distance-per-tick multiplier. An uncalibrated
/// device (zero denominator) reports no target.
pub fn tof_to_range(tof: u16, cal: &Calibration, scale: u32, kind: RangeKind) -> Range {
    if tof == TOF_NO_TARGET {
        return Range::NO_TARGET;
    }

    let den = (cal.rtc_cal_result as u64 * cal.scale_factor as u64) >> TOF_SCALE_SHIFT;
    if den == 0 {
        return Range::NO_TARGET;
    }

    let num = SPEED_OF_SOUND_MPS as u64 * cal.rtc_pulse_ms as u64 * tof as u64;
    let mut range = (num / den) * scale as u64;
    if kind == RangeKind::OneWay {
        range /= 2;
    }

    // Keep real distances clear of the sentinel.
    Range::from_raw(range.min(u64::from(Range::NO_TARGET.raw() - 1)) as u32)
}

/// Millimetres covered by `num_samples` at `op_frequency_hz`
pub fn samples_to_mm(num_samples: u16, op_frequency_hz: u32, scale: u32) -> u16 {
    if op_frequency_hz == 0 {
        return 0;
    }
    let num = num_samples as u64 * SPEED_OF_SOUND_MPS as u64 * 8 * 1000 * scale as u64;
    let den = op_frequency_hz as u64 * 2;
    (num / den).min(u16::MAX as u64) as u16
}

/// Samples needed to cover `mm` at `op_frequency_hz`, rounded to nearest
pub fn mm_to_samples(mm: u16, op_frequency_hz: u32, scale: u32) -> u16 {
    let den = SPEED_OF_SOUND_MPS as u64 * 8 * 1000 * scale as u64;
    let num = mm as u64 * op_frequency_hz as u64 * 2;
    ((num + den / 2) / den).min(u16::MAX as u64) as u16
}

/// Operating frequency from the RTC calibration and the raw frequency count
pub fn op_frequency_hz(rtc_cal_result: u16, raw_frequency: u16, rtc_pulse_ms: u32) -> u32 {
    if rtc_pulse_ms == 0 {
        return 0;
    }
    let per_count = rtc_cal_result as u64 * 1000 / (16 * FREQ_COUNTER_CYCLES as u64);
    (per_count * raw_frequency as u64 / rtc_pulse_ms as u64) as u32
}

/// Operations every firmware variant provides
///
/// Implementors supply identity and the register map; everything else has a
/// register-driven default. Bus errors are returned raw as `T::Error` and
/// mapped to [`GroupError`](crate::GroupError) by the group.
pub trait FirmwareOps {
    /// Silicon part number
    fn part_number(&self) -> u16;

    /// Receive sample capacity
    fn max_samples(&self) -> u16;

    /// Register layout
    fn registers(&self) -> &'static RegisterMap;

    /// Image programmed at bring-up
    fn image(&self) -> &'static FirmwareImage;

    /// Distance per tick relative to the short-range part
    fn range_scale(&self) -> u32 {
        1
    }

    /// Version of the bound image
    fn version(&self) -> &'static str {
        self.image().version
    }

    /// Variant accepts a threshold table
    fn supports_thresholds(&self) -> bool {
        self.registers().thresholds.is_some()
    }

    /// Write the operating mode
    fn set_mode<T: Transport>(&self, t: &mut T, slot: u8, mode: Mode) -> Result<(), T::Error> {
        write_u8(t, slot, self.registers().opmode, mode.bits())
    }

    /// Write the free-running interval
    fn set_sample_interval<T: Transport>(&self, t: &mut T, slot: u8, ms: u16) -> Result<(), T::Error> {
        write_u16(t, slot, self.registers().tick_interval, ms)
    }

    /// Write the receive length
    fn set_num_samples<T: Transport>(&self, t: &mut T, slot: u8, samples: u16) -> Result<(), T::Error> {
        write_u16(t, slot, self.registers().max_range, samples)
    }

    /// Write the static target rejection range
    fn set_static_range<T: Transport>(&self, t: &mut T, slot: u8, samples: u16) -> Result<(), T::Error> {
        write_u16(t, slot, self.registers().st_range, samples)
    }

    /// Poll the lock flag once
    fn is_locked<T: Transport>(&self, t: &mut T, slot: u8) -> Result<bool, T::Error> {
        Ok(read_u8(t, slot, self.registers().ready)? & READY_FREQ_LOCKED != 0)
    }

    /// Arm RTC calibration in the firmware
    fn arm_calibration<T: Transport>(&self, t: &mut T, slot: u8) -> Result<(), T::Error> {
        write_u8(t, slot, self.registers().cal_trig, 0)
    }

    /// Read back calibration after the RTC pulse
    fn read_calibration<T: Transport>(
        &self,
        t: &mut T,
        slot: u8,
        rtc_pulse_ms: u32,
    ) -> Result<Calibration, T::Error> {
        let regs = self.registers();
        let rtc_cal_result = read_u16(t, slot, regs.cal_result)?;
        let raw_frequency = read_u16(t, slot, regs.period)?;
        let scale_factor = read_u16(t, slot, regs.tof_sf)?;

        Ok(Calibration {
            rtc_cal_result,
            rtc_pulse_ms,
            raw_frequency,
            scale_factor,
            op_frequency_hz: op_frequency_hz(rtc_cal_result, raw_frequency, rtc_pulse_ms),
        })
    }

    /// Read the last time of flight as a range
    fn get_range<T: Transport>(
        &self,
        t: &mut T,
        slot: u8,
        kind: RangeKind,
        cal: &Calibration,
    ) -> Result<Range, T::Error> {
        let tof = read_u16(t, slot, self.registers().tof)?;
        Ok(tof_to_range(tof, cal, self.range_scale(), kind))
    }

    /// Read the last echo amplitude
    fn get_amplitude<T: Transport>(&self, t: &mut T, slot: u8) -> Result<u16, T::Error> {
        read_u16(t, slot, self.registers().amplitude)
    }

    /// Blocking read of `out.len()` samples starting at `start`
    fn read_samples<T: Transport>(
        &self,
        t: &mut T,
        slot: u8,
        start: u16,
        out: &mut [IqSample],
    ) -> Result<(), T::Error> {
        let mut buf = [0u8; READ_CHUNK_SAMPLES * 4];
        let base = self.registers().data + start * 4;

        for (chunk_index, chunk) in out.chunks_mut(READ_CHUNK_SAMPLES).enumerate() {
            let addr = base + (chunk_index * READ_CHUNK_SAMPLES * 4) as u16;
            let bytes = &mut buf[..chunk.len() * 4];
            t.read(slot, addr, bytes)?;
            for (sample, raw) in chunk.iter_mut().zip(bytes.chunks_exact(4)) {
                *sample = IqSample::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            }
        }
        Ok(())
    }

    /// Read the threshold table, `None` when unsupported
    fn get_thresholds<T: Transport>(&self, t: &mut T, slot: u8) -> Result<Option<Thresholds>, T::Error> {
        let Some(base) = self.registers().thresholds else {
            return Ok(None);
        };

        let mut raw = [0u8; NUM_THRESHOLDS * 4];
        t.read(slot, base, &mut raw)?;

        let mut table = [Threshold::default(); NUM_THRESHOLDS];
        for (entry, bytes) in table.iter_mut().zip(raw.chunks_exact(4)) {
            *entry = Threshold::new(
                u16::from_le_bytes([bytes[0], bytes[1]]),
                u16::from_le_bytes([bytes[2], bytes[3]]),
            );
        }
        Ok(Some(Thresholds(table)))
    }

    /// Write the threshold table, `false` when unsupported
    fn set_thresholds<T: Transport>(
        &self,
        t: &mut T,
        slot: u8,
        thresholds: &Thresholds,
    ) -> Result<bool, T::Error> {
        let Some(base) = self.registers().thresholds else {
            return Ok(false);
        };

        let mut raw = [0u8; NUM_THRESHOLDS * 4];
        for (entry, bytes) in thresholds.entries().iter().zip(raw.chunks_exact_mut(4)) {
            bytes[..2].copy_from_slice(&entry.start_sample.to_le_bytes());
            bytes[2..].copy_from_slice(&entry.level.to_le_bytes());
        }
        t.write(slot, base, &raw)?;
        Ok(true)
    }

    /// Samples to millimetres with `cal`
    fn samples_to_mm(&self, num_samples: u16, cal: &Calibration) -> u16 {
        samples_to_mm(num_samples, cal.op_frequency_hz, self.range_scale())
    }

    /// Millimetres to samples with `cal`, capped at capacity
    fn mm_to_samples(&self, mm: u16, cal: &Calibration) -> u16 {
        mm_to_samples(mm, cal.op_frequency_hz, self.range_scale()).min(self.max_samples())
    }
}

/// Firmware variant bound to a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    /// General-purpose rangefinding, short-range part
    Gpr(GprFirmware),
    /// General-purpose rangefinding with thresholds, long-range part
    GprMultiThreshold(GprMultiThresholdFirmware),
}

impl Firmware {
    /// Bind the short-range variant to `image`
    pub const fn gpr(image: &'static FirmwareImage) -> Self {
        Self::Gpr(GprFirmware::new(image))
    }

    /// Bind the long-range multi-threshold variant to `image`
    pub const fn gpr_multi_threshold(image: &'static FirmwareImage) -> Self {
        Self::GprMultiThreshold(GprMultiThresholdFirmware::new(image))
    }

    /// Variant name
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Gpr(_) => "gpr",
            Self::GprMultiThreshold(_) => "gpr-mt",
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $fw:ident => $call:expr) => {
        match $self {
            Firmware::Gpr($fw) => $call,
            Firmware::GprMultiThreshold($fw) => $call,
        }
    };
}

impl FirmwareOps for Firmware {
    fn part_number(&self) -> u16 {
        dispatch!(self, fw => fw.part_number())
    }

    fn max_samples(&self) -> u16 {
        dispatch!(self, fw => fw.max_samples())
    }

    fn registers(&self) -> &'static RegisterMap {
        dispatch!(self, fw => fw.registers())
    }

    fn image(&self) -> &'static FirmwareImage {
        dispatch!(self, fw => fw.image())
    }

    fn range_scale(&self) -> u32 {
        dispatch!(self, fw => fw.range_scale())
    }

    fn version(&self) -> &'static str {
        dispatch!(self, fw => fw.version())
    }

    fn supports_thresholds(&self) -> bool {
        dispatch!(self, fw => fw.supports_thresholds())
    }

    fn set_mode<T: Transport>(&self, t: &mut T, slot: u8, mode: Mode) -> Result<(), T::Error> {
        dispatch!(self, fw => fw.set_mode(t, slot, mode))
    }

    fn set_sample_interval<T: Transport>(&self, t: &mut T, slot: u8, ms: u16) -> Result<(), T::Error> {
        dispatch!(self, fw => fw.set_sample_interval(t, slot, ms))
    }

    fn set_num_samples<T: Transport>(&self, t: &mut T, slot: u8, samples: u16) -> Result<(), T::Error> {
        dispatch!(self, fw => fw.set_num_samples(t, slot, samples))
    }

    fn set_static_range<T: Transport>(&self, t: &mut T, slot: u8, samples: u16) -> Result<(), T::Error> {
        dispatch!(self, fw => fw.set_static_range(t, slot, samples))
    }

    fn is_locked<T: Transport>(&self, t: &mut T, slot: u8) -> Result<bool, T::Error> {
        dispatch!(self, fw => fw.is_locked(t, slot))
    }

    fn arm_calibration<T: Transport>(&self, t: &mut T, slot: u8) -> Result<(), T::Error> {
        dispatch!(self, fw => fw.arm_calibration(t, slot))
    }

    fn read_calibration<T: Transport>(
        &self,
        t: &mut T,
        slot: u8,
        rtc_pulse_ms: u32,
    ) -> Result<Calibration, T::Error> {
        dispatch!(self, fw => fw.read_calibration(t, slot, rtc_pulse_ms))
    }

    fn get_range<T: Transport>(
        &self,
        t: &mut T,
        slot: u8,
        kind: RangeKind,
        cal: &Calibration,
    ) -> Result<Range, T::Error> {
        dispatch!(self, fw => fw.get_range(t, slot, kind, cal))
    }

    fn get_amplitude<T: Transport>(&self, t: &mut T, slot: u8) -> Result<u16, T::Error> {
        dispatch!(self, fw => fw.get_amplitude(t, slot))
    }

    fn read_samples<T: Transport>(
        &self,
        t: &mut T,
        slot: u8,
        start: u16,
        out: &mut [IqSample],
    ) -> Result<(), T::Error> {
        dispatch!(self, fw => fw.read_samples(t, slot, start, out))
    }

    fn get_thresholds<T: Transport>(&self, t: &mut T, slot: u8) -> Result<Option<Thresholds>, T::Error> {
        dispatch!(self, fw => fw.get_thresholds(t, slot))
    }

    fn set_thresholds<T: Transport>(
        &self,
        t: &mut T,
        slot: u8,
        thresholds: &Thresholds,
    ) -> Result<bool, T::Error> {
        dispatch!(self, fw => fw.set_thresholds(t, slot, thresholds))
    }

    fn samples_to_mm(&self, num_samples: u16, cal: &Calibration) -> u16 {
        dispatch!(self, fw => fw.samples_to_mm(num_samples, cal))
    }

    fn mm_to_samples(&self, mm: u16, cal: &Calibration) -> u16 {
        dispatch!(self, fw => fw.mm_to_samples(mm, cal))
    }
}
