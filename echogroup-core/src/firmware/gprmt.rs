//! General-purpose rangefinding firmware with multiple thresholds
//!
//! Runs on the long-range part. Each sample covers twice the distance of
//! the short-range part, so time of flight and sample conversions scale by
//! two. Detection uses a six-segment threshold table.

use super::{FirmwareImage, FirmwareOps, RegisterMap};
use crate::constants::{CH201_MAX_SAMPLES, CH201_PART_NUMBER};

/// Register layout of the multi-threshold firmware
pub const REGISTERS: RegisterMap = RegisterMap {
    opmode: 0x01,
    tick_interval: 0x02,
    period: 0x05,
    cal_trig: 0x06,
    max_range: 0x07,
    cal_result: 0x0A,
    st_range: 0x12,
    ready: 0x14,
    tof_sf: 0x22,
    tof: 0x24,
    amplitude: 0x26,
    data: 0x28,
    // Past the end of the 450-sample data block at 0x28..0x730.
    thresholds: Some(0x0740),
};

/// Long-range binding with threshold table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprMultiThresholdFirmware {
    image: &'static FirmwareImage,
}

impl GprMultiThresholdFirmware {
    /// Bind to `image`
    pub const fn new(image: &'static FirmwareImage) -> Self {
        Self { image }
    }
}

impl FirmwareOps for GprMultiThresholdFirmware {
    fn part_number(&self) -> u16 {
        CH201_PART_NUMBER
    }

    fn max_samples(&self) -> u16 {
        CH201_MAX_SAMPLES
    }

    fn registers(&self) -> &'static RegisterMap {
        &REGISTERS
    }

    fn image(&self) -> &'static FirmwareImage {
        self.image
    }

    fn range_scale(&self) -> u32 {
        2
    }
}
