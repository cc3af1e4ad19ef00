//! Device descriptor and last-cycle results
//!
//! A [`Device`] is created once per slot when the slot is bound and lives as
//! long as the group. It is split in two: the immutable firmware binding and
//! the mutable [`DeviceState`], so firmware operations can borrow both.

use crate::config::SensorConfig;
use crate::constants::{MAX_IQ_SAMPLES, NO_TARGET, PROG_I2C_ADDR, RANGE_FRAC_BITS};
use crate::errors::GroupError;
use crate::firmware::{Firmware, FirmwareOps};

/// One raw waveform sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IqSample {
    /// Quadrature component
    pub q: i16,
    /// In-phase component
    pub i: i16,
}

impl IqSample {
    /// Build a sample
    pub const fn new(i: i16, q: i16) -> Self {
        Self { q, i }
    }

    /// Decode the wire layout: `q` then `i`, little-endian
    pub const fn from_le_bytes(b: [u8; 4]) -> Self {
        Self {
            q: i16::from_le_bytes([b[0], b[1]]),
            i: i16::from_le_bytes([b[2], b[3]]),
        }
    }

    /// Encode to the wire layout
    pub const fn to_le_bytes(self) -> [u8; 4] {
        let q = self.q.to_le_bytes();
        let i = self.i.to_le_bytes();
        [q[0], q[1], i[0], i[1]]
    }

    /// Magnitude `sqrt(i² + q²)`
    pub fn amplitude(&self) -> u16 {
        let (i, q) = (self.i as f32, self.q as f32);
        libm::sqrtf(i * i + q * q) as u16
    }
}

/// Range in millimetres with 5 fractional bits
///
/// [`Range::NO_TARGET`] is a sentinel, not a distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Range(u32);

impl Range {
    /// No echo detected
    pub const NO_TARGET: Self = Self(NO_TARGET);

    /// Zero distance
    pub const ZERO: Self = Self(0);

    /// Wrap a raw fixed-point value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Build from whole millimetres
    pub const fn from_mm(mm: u32) -> Self {
        Self(mm << RANGE_FRAC_BITS)
    }

    /// Raw value, `0xFFFF_FFFF` for no target
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// An echo was detected
    pub const fn is_target(&self) -> bool {
        self.0 != NO_TARGET
    }

    /// Millimetres as a float
    pub fn mm_f32(&self) -> Option<f32> {
        self.is_target()
            .then(|| self.0 as f32 / (1u32 << RANGE_FRAC_BITS) as f32)
    }

    /// Millimetres in fixed point
    #[cfg(feature = "fixed")]
    pub fn millimetres(&self) -> Option<fixed::types::U27F5> {
        self.is_target().then(|| fixed::types::U27F5::from_bits(self.0))
    }
}

impl Default for Range {
    fn default() -> Self {
        Self::NO_TARGET
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Range {
    fn format(&self, fmt: defmt::Formatter) {
        if self.is_target() {
            defmt::write!(fmt, "{=u32}+{=u32}/32 mm", self.0 >> RANGE_FRAC_BITS, self.0 & 0x1F)
        } else {
            defmt::write!(fmt, "no target")
        }
    }
}

/// Calibration values captured at bring-up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calibration {
    /// RTC ticks counted during the calibration pulse
    pub rtc_cal_result: u16,
    /// Pulse length used (ms)
    pub rtc_pulse_ms: u32,
    /// Raw transducer frequency count
    pub raw_frequency: u16,
    /// Time-of-flight scale factor reported by the firmware
    pub scale_factor: u16,
    /// Operating frequency (Hz)
    pub op_frequency_hz: u32,
}

/// Results of the last cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Measurement {
    /// Last range read
    pub range: Range,
    /// Echo amplitude, only updated when a target was found
    pub amplitude: u16,
    /// Samples in the configured range
    pub num_samples: u16,
}

/// Mutable per-slot state
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub(crate) slot: u8,
    pub(crate) bus: u8,
    pub(crate) address: u8,
    pub(crate) config: SensorConfig,
    pub(crate) calibration: Calibration,
    pub(crate) measurement: Measurement,
    pub(crate) samples: [IqSample; MAX_IQ_SAMPLES],
    pub(crate) samples_start: u16,
    pub(crate) samples_valid: u16,
    pub(crate) connected: bool,
    pub(crate) last_error: Option<GroupError>,
}

impl DeviceState {
    fn new(slot: u8) -> Self {
        Self {
            slot,
            bus: 0,
            address: PROG_I2C_ADDR,
            config: SensorConfig::default(),
            calibration: Calibration::default(),
            measurement: Measurement::default(),
            samples: [IqSample::default(); MAX_IQ_SAMPLES],
            samples_start: 0,
            samples_valid: 0,
            connected: false,
            last_error: None,
        }
    }

    /// Mark `start..end` as the samples from the latest readout
    pub(crate) fn set_sample_window(&mut self, start: u16, end: u16) {
        self.samples_start = start;
        self.samples_valid = end;
    }
}

/// Descriptor for one slot
#[derive(Debug, Clone)]
pub struct Device {
    pub(crate) firmware: Firmware,
    pub(crate) state: DeviceState,
}

impl Device {
    pub(crate) fn new(slot: u8, firmware: Firmware) -> Self {
        Self { firmware, state: DeviceState::new(slot) }
    }

    /// Slot index, stable for the group's lifetime
    pub fn slot(&self) -> u8 {
        self.state.slot
    }

    /// Bus index
    pub fn bus(&self) -> u8 {
        self.state.bus
    }

    /// Current bus address, the programming address until bring-up assigns one
    pub fn address(&self) -> u8 {
        self.state.address
    }

    /// Bound firmware
    pub fn firmware(&self) -> &Firmware {
        &self.firmware
    }

    /// Part number of the bound variant
    pub fn part_number(&self) -> u16 {
        self.firmware.part_number()
    }

    /// Firmware version string
    pub fn fw_version(&self) -> &'static str {
        self.firmware.version()
    }

    /// Sample capacity of the bound variant
    pub fn max_samples(&self) -> u16 {
        self.firmware.max_samples()
    }

    /// Discovered and programmed
    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    /// Configuration last applied
    pub fn config(&self) -> &SensorConfig {
        &self.state.config
    }

    /// Calibration captured at bring-up
    pub fn calibration(&self) -> &Calibration {
        &self.state.calibration
    }

    /// Last-cycle results
    pub fn measurement(&self) -> &Measurement {
        &self.state.measurement
    }

    /// Samples read during the last readout
    ///
    /// Element 0 is sample [`samples_start`](Self::samples_start) of the
    /// receive window.
    pub fn samples(&self) -> &[IqSample] {
        &self.state.samples[self.state.samples_start as usize..self.state.samples_valid as usize]
    }

    /// Index of the first sample held by [`samples`](Self::samples)
    pub fn samples_start(&self) -> u16 {
        self.state.samples_start
    }

    /// Most recent bring-up or transfer error
    pub fn last_error(&self) -> Option<GroupError> {
        self.state.last_error
    }

    /// Convert samples to millimetres with this device's calibration
    pub fn samples_to_mm(&self, num_samples: u16) -> u16 {
        self.firmware.samples_to_mm(num_samples, &self.state.calibration)
    }

    /// Convert millimetres to samples, capped at the variant's capacity
    pub fn mm_to_samples(&self, mm: u16) -> u16 {
        self.firmware.mm_to_samples(mm, &self.state.calibration)
    }
}
