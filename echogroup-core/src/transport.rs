//! Board transport collaborator
//!
//! Everything the coordinator needs from the board: bus transfers, reset and
//! interrupt lines, delays. One implementation per board; the coordinator
//! never touches hardware directly.
//!
//! ## Interrupt wiring
//!
//! The board owns its interrupt handlers. Each handler maps its line to a
//! slot and calls [`GroupSignals::on_interrupt`]; each bus-transfer-complete
//! handler calls [`GroupSignals::notify_bus_complete`]. When `on_interrupt`
//! reports a completed cycle with `disable_line` set, the handler masks the
//! group's lines until the next [`Transport::set_interrupts`] call.
//!
//! ```text
//!  pin IRQ ──► board ISR ──► signals.on_interrupt(slot)
//!  DMA IRQ ──► board ISR ──► signals.notify_bus_complete(bus)
//! ```
//!
//! [`GroupSignals::on_interrupt`]: crate::GroupSignals::on_interrupt
//! [`GroupSignals::notify_bus_complete`]: crate::GroupSignals::notify_bus_complete

use crate::device::IqSample;
use crate::firmware::FirmwareImage;
use crate::mask::SlotMask;

/// Where a slot lives on the board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusInfo {
    /// Bus index, below [`MAX_BUSES`](crate::constants::MAX_BUSES)
    pub bus: u8,
    /// Application address assigned after programming
    pub address: u8,
}

/// One queued waveform read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    /// Device slot
    pub slot: u8,
    /// Register address of sample zero
    pub data_addr: u16,
    /// First sample to read
    pub start_sample: u16,
    /// Samples to read
    pub num_samples: u16,
}

impl ReadRequest {
    /// Bytes to move, four per IQ sample
    pub const fn byte_len(&self) -> usize {
        self.num_samples as usize * 4
    }

    /// Register address of the first requested sample
    pub const fn start_addr(&self) -> u16 {
        self.data_addr + self.start_sample * 4
    }
}

/// Board transport
///
/// Methods taking `slot` address one device. Bus-level methods take the bus
/// index reported by [`bus_info`](Self::bus_info).
pub trait Transport {
    /// Board error type, mapped to [`GroupError`](crate::GroupError) by the group
    type Error: core::fmt::Debug;

    /// Bus and application address of `slot`
    fn bus_info(&self, slot: u8) -> BusInfo;

    /// Read the programming-interface signature, errors mean "absent"
    fn read_signature(&mut self, slot: u8) -> Result<[u8; 2], Self::Error>;

    /// Drive the reset line
    fn reset(&mut self, slot: u8, asserted: bool) -> Result<(), Self::Error>;

    /// Reset through the programming interface
    fn soft_reset(&mut self, slot: u8) -> Result<(), Self::Error>;

    /// Transfer a firmware image and its RAM initialisation block
    fn program(&mut self, slot: u8, image: &FirmwareImage) -> Result<(), Self::Error>;

    /// Move the device from the programming address to `address`
    fn assign_address(&mut self, slot: u8, address: u8) -> Result<(), Self::Error>;

    /// Release the device CPU so the firmware starts
    fn start(&mut self, slot: u8) -> Result<(), Self::Error>;

    /// Blocking register read
    fn read(&mut self, slot: u8, addr: u16, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Blocking register write
    fn write(&mut self, slot: u8, addr: u16, data: &[u8]) -> Result<(), Self::Error>;

    /// Sleep
    fn delay_ms(&mut self, ms: u32);

    /// Hold the interrupt line of `slot` for `ms` so the device can count its RTC
    fn calibration_pulse(&mut self, slot: u8, ms: u32) -> Result<(), Self::Error>;

    /// One simultaneous trigger pulse on every slot in `mask`
    fn trigger(&mut self, mask: SlotMask) -> Result<(), Self::Error>;

    /// Enable or mask the interrupt lines of `mask`
    fn set_interrupts(&mut self, mask: SlotMask, enabled: bool);

    /// Begin a non-blocking transfer of `requests`, all on `bus`
    ///
    /// Returns once the transfer is started. Completion is reported through
    /// [`GroupSignals::notify_bus_complete`](crate::GroupSignals::notify_bus_complete).
    fn start_read_nb(&mut self, bus: u8, requests: &[ReadRequest]) -> Result<(), Self::Error>;

    /// Copy the finished non-blocking data for `slot` into `out`
    fn take_nb_samples(&mut self, slot: u8, out: &mut [IqSample]) -> Result<usize, Self::Error>;

    /// Abandon any transfer in flight on `bus`
    fn cancel_nb(&mut self, bus: u8);
}
