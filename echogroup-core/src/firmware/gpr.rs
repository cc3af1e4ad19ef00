//! General-purpose rangefinding firmware for the short-range part

use super::{FirmwareImage, FirmwareOps, RegisterMap};
use crate::constants::{CH101_MAX_SAMPLES, CH101_PART_NUMBER};

/// Register layout of the short-range general-purpose firmware
pub const REGISTERS: RegisterMap = RegisterMap {
    opmode: 0x01,
    tick_interval: 0x02,
    period: 0x05,
    cal_trig: 0x06,
    max_range: 0x07,
    cal_result: 0x0A,
    st_range: 0x12,
    ready: 0x14,
    tof_sf: 0x16,
    tof: 0x18,
    amplitude: 0x1A,
    data: 0x1C,
    thresholds: None,
};

/// Short-range binding, single fixed detection threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprFirmware {
    image: &'static FirmwareImage,
}

impl GprFirmware {
    /// Bind to `image`
    pub const fn new(image: &'static FirmwareImage) -> Self {
        Self { image }
    }
}

impl FirmwareOps for GprFirmware {
    fn part_number(&self) -> u16 {
        CH101_PART_NUMBER
    }

    fn max_samples(&self) -> u16 {
        CH101_MAX_SAMPLES
    }

    fn registers(&self) -> &'static RegisterMap {
        &REGISTERS
    }

    fn image(&self) -> &'static FirmwareImage {
        self.image
    }
}
