//! Constants for EchoGroup Core
//!
//! Centralized numeric values used throughout the coordinator. Names carry
//! their unit where one applies.
//!
//! ## Organization
//!
//! - **Parts**: silicon identity, sample capacities, programming interface
//! - **Ranging**: sentinels and conversion constants for time-of-flight
//! - **Timing**: bring-up and non-blocking defaults
//! - **Capacity**: compile-time sizes for masks, buses and buffers

/// Part numbers, sample capacities and programming interface values.
pub mod parts;

/// Time-of-flight sentinels and conversion constants.
pub mod ranging;

/// Default delays, retry counts and timeouts.
pub mod timing;

/// Compile-time capacities.
pub mod capacity;

// Re-export commonly used constants for convenience
pub use parts::{
    CH101_PART_NUMBER, CH201_PART_NUMBER, CH101_MAX_SAMPLES, CH201_MAX_SAMPLES,
    PROG_I2C_ADDR, SIGNATURE, NUM_THRESHOLDS, FREQ_COUNTER_CYCLES, READY_FREQ_LOCKED,
};

pub use ranging::{NO_TARGET, TOF_NO_TARGET, RANGE_FRAC_BITS, SPEED_OF_SOUND_MPS};

pub use timing::{
    DEFAULT_RTC_PULSE_MS, DEFAULT_RESET_HOLD_MS, DEFAULT_LOCK_POLL_MS,
    DEFAULT_LOCK_RETRIES, DEFAULT_NB_TIMEOUT_MS,
};

pub use capacity::{MAX_GROUP_SLOTS, MAX_BUSES, MAX_IQ_SAMPLES};
