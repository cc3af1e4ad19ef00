//! Measurement coordinator for groups of ultrasonic time-of-flight sensors
//!
//! A group is a fixed set of sensor slots spread over one or more buses.
//! Every slot is bound to a firmware variant once, brought up by
//! [`Group::start`], and then driven through trigger/readout cycles.
//!
//! Key constraints:
//! - No heap allocation anywhere in the crate
//! - Interrupt entry points are lock-free (atomics only)
//! - Heavy work (bus reads, copies) happens in the main flow only
//!
//! ```text
//!  configure ──► group_trigger ──► per-slot interrupts ──► cycle complete
//!                                   (GroupSignals, ISR)         │
//!                                                                ▼
//!            io-complete ◄── per-bus completions ◄── start_nb ◄─ read
//! ```
//!
//! ```no_run
//! use echogroup_core::{Group, GroupConfig, GroupSignals, SensorConfig, Mode};
//! # fn board() -> echogroup_core::sim::SimTransport { unimplemented!() }
//! # fn firmware() -> echogroup_core::Firmware { unimplemented!() }
//!
//! static SIGNALS: GroupSignals = GroupSignals::new();
//!
//! let mut group: Group<_, 4> = Group::new(board(), &SIGNALS, GroupConfig::default());
//! group.init_slot(0, firmware()).unwrap();
//! let report = group.start();
//! if report.is_ok() {
//!     group.configure(0, SensorConfig::new(Mode::TriggeredTxRx)).unwrap();
//!     group.group_trigger().unwrap();
//!     nb::block!(SIGNALS.poll_cycle()).unwrap();
//! }
//! ```

#![cfg_attr(not(feature = "std"), no_std)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod config;
pub mod constants;
pub mod device;
pub mod errors;
pub mod firmware;
pub mod group;
pub mod mask;
pub mod nonblocking;
pub mod signals;
pub mod time;
pub mod transport;

#[cfg(feature = "std")]
pub mod sim;

// Public API
pub use config::{GroupConfig, IoMode, Mode, RangeKind, ResetKind, SensorConfig, Threshold, Thresholds};
pub use device::{Calibration, Device, IqSample, Measurement, Range};
pub use errors::{ErrorFlags, GroupError, GroupResult, ProgrammingStage};
pub use firmware::{Firmware, FirmwareImage, FirmwareOps};
pub use group::{Group, StartReport};
pub use mask::{AtomicMask, BitMask, BusMask, SlotMask};
pub use signals::{GroupSignals, InterruptCallback, InterruptOutcome, IoCompleteCallback};
pub use transport::{BusInfo, ReadRequest, Transport};

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
