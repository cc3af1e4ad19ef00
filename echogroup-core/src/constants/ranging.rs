//! Time-of-Flight Conversion

/// Range value reported when no echo was detected.
///
/// Distinct from zero. Returned verbatim, never scaled.
pub const NO_TARGET: u32 = 0xFFFF_FFFF;

/// Raw time-of-flight register value meaning "no echo".
pub const TOF_NO_TARGET: u16 = 0xFFFF;

/// Fractional bits in a range value (millimetres × 32).
pub const RANGE_FRAC_BITS: u32 = 5;

/// Speed of sound used for all conversions (m/s, ~20°C dry air).
pub const SPEED_OF_SOUND_MPS: u32 = 343;

/// Right shift applied to `rtc_cal_result × scale_factor` in range math.
pub const TOF_SCALE_SHIFT: u32 = 11;
