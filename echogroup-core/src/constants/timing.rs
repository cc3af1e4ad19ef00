//! Bring-Up and Transfer Timing Defaults

/// Length of the RTC calibration pulse (ms).
///
/// The device counts its low-frequency clock for this long; longer pulses
/// give a finer calibration result.
pub const DEFAULT_RTC_PULSE_MS: u32 = 100;

/// Time the reset line is held asserted (ms).
pub const DEFAULT_RESET_HOLD_MS: u32 = 1;

/// Delay between lock polls (ms).
pub const DEFAULT_LOCK_POLL_MS: u32 = 1;

/// Lock polls before a slot is marked failed.
pub const DEFAULT_LOCK_RETRIES: u16 = 100;

/// Bound on one non-blocking readout round (ms).
///
/// Must be shorter than the measurement interval so a stuck bus is
/// resolved before the next trigger.
pub const DEFAULT_NB_TIMEOUT_MS: u32 = 50;

/// Measurement interval used by the reference application (ms).
pub const MEASUREMENT_INTERVAL_MS: u32 = 100;
