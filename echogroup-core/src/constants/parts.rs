//! Part Identity and Programming Interface
//!
//! Values shared by every device on the programming interface, before any
//! firmware is running.

/// Part number reported by the short-range transducer.
pub const CH101_PART_NUMBER: u16 = 101;

/// Part number reported by the long-range transducer.
pub const CH201_PART_NUMBER: u16 = 201;

/// Receive sample capacity of the short-range part.
pub const CH101_MAX_SAMPLES: u16 = 150;

/// Receive sample capacity of the long-range part.
///
/// Also the size of the per-device waveform buffer, so any variant fits.
pub const CH201_MAX_SAMPLES: u16 = 450;

/// Bus address every device answers on while held in programming mode.
pub const PROG_I2C_ADDR: u8 = 0x45;

/// Signature bytes read from the programming interface of a live device.
pub const SIGNATURE: [u8; 2] = [0x0A, 0x02];

/// Entries in a multi-threshold detection table.
pub const NUM_THRESHOLDS: usize = 6;

/// Oscillator cycles counted per frequency measurement.
pub const FREQ_COUNTER_CYCLES: u32 = 128;

/// Lock bit in the firmware ready register.
pub const READY_FREQ_LOCKED: u8 = 0x02;
