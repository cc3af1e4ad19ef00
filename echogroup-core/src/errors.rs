//! Error Types for Group Bring-Up and Measurement Cycles
//!
//! ## Design
//!
//! Errors are returned from main-flow operations and also collected per slot
//! during [`Group::start`](crate::Group::start), so they stay small:
//!
//! 1. **Copy**: returned by value, stored in per-slot tables
//! 2. **No heap**: reasons are `&'static str`
//! 3. **Not generic**: transport errors are mapped at the seam, the group
//!    API never carries `T::Error`
//!
//! ## Aggregation
//!
//! Bring-up never stops at the first failing slot. Every failure maps to
//! one bit of [`ErrorFlags`] and the group status is the OR of all of them:
//!
//! ```text
//! slot 0: ok            0000_0000
//! slot 1: absent        0000_0001  DISCOVERY
//! slot 2: ok            0000_0000
//! slot 3: lock timeout  0000_0100  LOCK_TIMEOUT
//!                       ─────────
//! status                0000_0101
//! ```
//!
//! A zero status means every bound slot came up.
//!
//! ```rust
//! use echogroup_core::{ErrorFlags, GroupError};
//!
//! let mut status = ErrorFlags::empty();
//! status.record(&GroupError::DiscoveryFailure { slot: 1 });
//! status.record(&GroupError::LockTimeout { slot: 3, attempts: 100 });
//!
//! assert!(status.contains(ErrorFlags::DISCOVERY));
//! assert!(!status.contains(ErrorFlags::TRANSFER));
//! assert_ne!(status.bits(), 0);
//! ```

use thiserror_no_std::Error;

/// Result type for group operations
pub type GroupResult<T> = Result<T, GroupError>;

/// Bring-up step that failed after a device answered the probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgrammingStage {
    /// Reset line assert/release
    Reset,
    /// Firmware image transfer
    Program,
    /// Application bus address assignment
    Address,
    /// Releasing the device CPU
    Start,
    /// RTC calibration pulse or readback
    Calibration,
    /// Applying stored configuration after a reset
    Restore,
}

impl ProgrammingStage {
    /// Short name for logs
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reset => "reset",
            Self::Program => "program",
            Self::Address => "address",
            Self::Start => "start",
            Self::Calibration => "calibration",
            Self::Restore => "restore",
        }
    }
}

impl core::fmt::Display for ProgrammingStage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Group errors - kept small for embedded use
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupError {
    /// A bound slot did not answer the probe
    #[error("Slot {slot}: no device answered the probe")]
    DiscoveryFailure {
        /// Slot index
        slot: u8,
    },

    /// A device answered but a bring-up step failed
    #[error("Slot {slot}: programming failed during {stage}")]
    ProgrammingFailure {
        /// Slot index
        slot: u8,
        /// Step that failed
        stage: ProgrammingStage,
    },

    /// Firmware started but never reported frequency lock
    #[error("Slot {slot}: no lock after {attempts} polls")]
    LockTimeout {
        /// Slot index
        slot: u8,
        /// Number of polls made
        attempts: u16,
    },

    /// Requested configuration cannot be applied
    #[error("Slot {slot}: configuration rejected: {reason}")]
    ConfigurationError {
        /// Slot index
        slot: u8,
        /// What was wrong
        reason: &'static str,
    },

    /// A bus transfer failed
    #[error("Slot {slot} on bus {bus}: transfer failed")]
    TransferError {
        /// Slot index
        slot: u8,
        /// Bus index
        bus: u8,
    },

    /// Slot binding input was malformed
    #[error("Slot {slot}: invalid binding: {reason}")]
    InvalidBinding {
        /// Slot index
        slot: u8,
        /// What was wrong
        reason: &'static str,
    },

    /// Operation addressed a slot without a connected device
    #[error("Slot {slot}: no connected device")]
    NotConnected {
        /// Slot index
        slot: u8,
    },

    /// Non-blocking round exceeded its time bound
    #[error("Non-blocking transfer timed out on buses {bus_mask:#x}")]
    IoTimeout {
        /// Buses that never reported completion
        bus_mask: u32,
    },
}

impl GroupError {
    /// Aggregation bit for this error
    pub const fn flag(&self) -> ErrorFlags {
        match self {
            Self::DiscoveryFailure { .. } => ErrorFlags::DISCOVERY,
            Self::ProgrammingFailure { .. } => ErrorFlags::PROGRAMMING,
            Self::LockTimeout { .. } => ErrorFlags::LOCK_TIMEOUT,
            Self::ConfigurationError { .. } => ErrorFlags::CONFIGURATION,
            Self::TransferError { .. } => ErrorFlags::TRANSFER,
            Self::InvalidBinding { .. } => ErrorFlags::INVALID_BINDING,
            Self::NotConnected { .. } => ErrorFlags::NOT_CONNECTED,
            Self::IoTimeout { .. } => ErrorFlags::IO_TIMEOUT,
        }
    }

    /// Slot the error refers to, if any
    pub const fn slot(&self) -> Option<u8> {
        match *self {
            Self::DiscoveryFailure { slot }
            | Self::ProgrammingFailure { slot, .. }
            | Self::LockTimeout { slot, .. }
            | Self::ConfigurationError { slot, .. }
            | Self::TransferError { slot, .. }
            | Self::InvalidBinding { slot, .. }
            | Self::NotConnected { slot } => Some(slot),
            Self::IoTimeout { .. } => None,
        }
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for GroupError {
    fn format(&self, fmt: defmt::Formatter) {
        match self {
            Self::DiscoveryFailure { slot } =>
                defmt::write!(fmt, "Slot {}: no device", slot),
            Self::ProgrammingFailure { slot, stage } =>
                defmt::write!(fmt, "Slot {}: programming failed ({})", slot, stage.as_str()),
            Self::LockTimeout { slot, attempts } =>
                defmt::write!(fmt, "Slot {}: no lock after {}", slot, attempts),
            Self::ConfigurationError { slot, reason } =>
                defmt::write!(fmt, "Slot {}: config: {}", slot, reason),
            Self::TransferError { slot, bus } =>
                defmt::write!(fmt, "Slot {} bus {}: transfer failed", slot, bus),
            Self::InvalidBinding { slot, reason } =>
                defmt::write!(fmt, "Slot {}: binding: {}", slot, reason),
            Self::NotConnected { slot } =>
                defmt::write!(fmt, "Slot {}: not connected", slot),
            Self::IoTimeout { bus_mask } =>
                defmt::write!(fmt, "NB timeout on {=u32:#x}", bus_mask),
        }
    }
}

/// Bitwise-OR aggregate of error kinds
///
/// Same shape as the other flag sets in this crate: a transparent integer
/// with associated constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFlags(u8);

impl ErrorFlags {
    /// Probe found no device
    pub const DISCOVERY: Self = Self(1 << 0);
    /// Reset, program, address, start or calibration failed
    pub const PROGRAMMING: Self = Self(1 << 1);
    /// Lock-wait exhausted its retries
    pub const LOCK_TIMEOUT: Self = Self(1 << 2);
    /// Configuration rejected
    pub const CONFIGURATION: Self = Self(1 << 3);
    /// Bus transfer failed
    pub const TRANSFER: Self = Self(1 << 4);
    /// Malformed binding
    pub const INVALID_BINDING: Self = Self(1 << 5);
    /// Slot not connected
    pub const NOT_CONNECTED: Self = Self(1 << 6);
    /// Non-blocking timeout
    pub const IO_TIMEOUT: Self = Self(1 << 7);

    /// No errors
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every error kind
    pub const fn all() -> Self {
        Self(0xFF)
    }

    /// Raw bits, zero means success
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// True when no error was recorded
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Check whether all bits of `other` are set
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Set the bits of `other`
    pub fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    /// OR in the bit for `error`
    pub fn record(&mut self, error: &GroupError) {
        self.set(error.flag());
    }
}

impl core::ops::BitOr for ErrorFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for ErrorFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for ErrorFlags {
    fn format(&self, fmt: defmt::Formatter) {
        defmt::write!(fmt, "ErrorFlags({=u8:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_variant_has_distinct_flag() {
        let errors = [
            GroupError::DiscoveryFailure { slot: 0 },
            GroupError::ProgrammingFailure { slot: 0, stage: ProgrammingStage::Program },
            GroupError::LockTimeout { slot: 0, attempts: 1 },
            GroupError::ConfigurationError { slot: 0, reason: "x" },
            GroupError::TransferError { slot: 0, bus: 0 },
            GroupError::InvalidBinding { slot: 0, reason: "x" },
            GroupError::NotConnected { slot: 0 },
            GroupError::IoTimeout { bus_mask: 1 },
        ];

        let mut all = ErrorFlags::empty();
        for e in &errors {
            assert!(!all.contains(e.flag()), "{:?} shares a bit", e);
            all.record(e);
        }
        assert_eq!(all, ErrorFlags::all());
    }

    #[test]
    fn empty_status_means_success() {
        let status = ErrorFlags::default();
        assert!(status.is_empty());
        assert_eq!(status.bits(), 0);
    }

    #[test]
    fn slot_is_reported() {
        assert_eq!(GroupError::LockTimeout { slot: 3, attempts: 9 }.slot(), Some(3));
        assert_eq!(GroupError::IoTimeout { bus_mask: 0b10 }.slot(), None);
    }

    #[test]
    fn display_includes_stage() {
        let e = GroupError::ProgrammingFailure { slot: 2, stage: ProgrammingStage::Address };
        let text = format!("{}", e);
        assert!(text.contains("address"));
        assert!(text.contains('2'));
    }
}
