//! Compile-Time Capacities

use super::parts::CH201_MAX_SAMPLES;

/// Upper bound on slots per group (width of the slot masks).
pub const MAX_GROUP_SLOTS: usize = 32;

/// Buses per group with their own non-blocking queue.
pub const MAX_BUSES: usize = 4;

/// Waveform buffer length per device, sized for the largest variant.
pub const MAX_IQ_SAMPLES: usize = CH201_MAX_SAMPLES as usize;

/// Samples moved per blocking register read.
pub const READ_CHUNK_SAMPLES: usize = 16;

const _: () = assert!(MAX_BUSES <= MAX_GROUP_SLOTS, "Bus mask shares the slot mask width");
