//! Interrupt-to-Main Signalling
//!
//! ## Overview
//!
//! [`GroupSignals`] is the only group state touched at interrupt level. It
//! lives in a `static` shared by the board's interrupt handlers and the
//! [`Group`](crate::Group) running in the main flow:
//!
//! ```text
//! Interrupt level                         Main flow
//!  on_interrupt(slot) ──┐          ┌── group_trigger()  arm(target)
//!  notify_bus_complete ─┤  atomics ├── start_nb()       begin_io(buses)
//!                       └──► flags ◄── poll_cycle() / poll_io()
//! ```
//!
//! Interrupt entry points do three things only: set a bit, detect
//! completion, raise a deferred flag. They never log, never touch the bus
//! and never block. Registered callbacks are invoked from whichever context
//! completes the set, so they must be just as short.
//!
//! ## Exactly-Once Completion
//!
//! Both the per-cycle ready set and the per-round bus set complete through
//! [`AtomicMask::set_and_check`]. The CAS that adds the last bit also clears
//! the set, so duplicates and races cannot complete twice.
//!
//! ## Usage
//!
//! ```rust
//! use echogroup_core::{GroupSignals, InterruptOutcome, SlotMask};
//!
//! static SIGNALS: GroupSignals = GroupSignals::new();
//!
//! // Main flow arms a cycle expecting slots 0 and 2
//! SIGNALS.arm(SlotMask::bit(0) | SlotMask::bit(2), SlotMask::EMPTY);
//!
//! // Interrupt handlers report in any order
//! assert_eq!(SIGNALS.on_interrupt(2), InterruptOutcome::Pending);
//! assert!(SIGNALS.poll_cycle().is_err());
//! assert_eq!(
//!     SIGNALS.on_interrupt(0),
//!     InterruptOutcome::CycleComplete { disable_line: true },
//! );
//! assert!(SIGNALS.poll_cycle().is_ok());
//! ```

use core::cell::Cell;
use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use critical_section::Mutex;

use crate::mask::{AtomicMask, BusMask, Completion, SlotMask};

/// Application hook run on every device interrupt
pub type InterruptCallback = fn(slot: u8, outcome: InterruptOutcome);

/// Application hook run once per non-blocking round, with the failed buses
pub type IoCompleteCallback = fn(failed: BusMask);

/// What an interrupt did to the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    /// Recorded, other slots still outstanding
    Pending,
    /// This interrupt completed the cycle
    CycleComplete {
        /// Mask the group's lines until the next trigger
        disable_line: bool,
    },
    /// Slot not expected this cycle, or lines disarmed
    Ignored,
}

/// Deferred task flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TaskFlags(u8);

impl TaskFlags {
    /// All expected slots reported
    pub const DATA_READY: Self = Self(1 << 0);
    /// Non-blocking round finished
    pub const IQ_READY: Self = Self(1 << 1);

    /// No flags
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits
    pub const fn bits(&self) -> u8 {
        self.0
    }

    /// Check whether all bits of `other` are set
    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// Interrupt-shared state of one group
pub struct GroupSignals {
    target: AtomicMask,
    free_running: AtomicMask,
    ready: AtomicMask,
    armed: AtomicBool,
    io_pending: AtomicMask,
    io_done: AtomicMask,
    io_failed: AtomicMask,
    flags: AtomicU8,
    cycles: AtomicU32,
    io_rounds: AtomicU32,
    on_interrupt_cb: Mutex<Cell<Option<InterruptCallback>>>,
    on_io_complete_cb: Mutex<Cell<Option<IoCompleteCallback>>>,
}

impl GroupSignals {
    /// Idle signals, usable in statics
    pub const fn new() -> Self {
        Self {
            target: AtomicMask::new(),
            free_running: AtomicMask::new(),
            ready: AtomicMask::new(),
            armed: AtomicBool::new(false),
            io_pending: AtomicMask::new(),
            io_done: AtomicMask::new(),
            io_failed: AtomicMask::new(),
            flags: AtomicU8::new(0),
            cycles: AtomicU32::new(0),
            io_rounds: AtomicU32::new(0),
            on_interrupt_cb: Mutex::new(Cell::new(None)),
            on_io_complete_cb: Mutex::new(Cell::new(None)),
        }
    }

    /// Register the per-interrupt hook, replacing any previous one
    pub fn set_interrupt_callback(&self, cb: Option<InterruptCallback>) {
        critical_section::with(|cs| self.on_interrupt_cb.borrow(cs).set(cb));
    }

    /// Register the non-blocking completion hook, replacing any previous one
    pub fn set_io_complete_callback(&self, cb: Option<IoCompleteCallback>) {
        critical_section::with(|cs| self.on_io_complete_cb.borrow(cs).set(cb));
    }

    // ===== MEASUREMENT CYCLES =====

    /// Start a cycle expecting every slot in `target`
    ///
    /// Clears the ready set and any unconsumed cycle flag. Slots in
    /// `free_running` keep the lines enabled after completion when every
    /// target slot is free-running.
    pub fn arm(&self, target: SlotMask, free_running: SlotMask) {
        self.target.store(target);
        self.free_running.store(free_running);
        self.ready.store(SlotMask::EMPTY);
        self.flags.fetch_and(!TaskFlags::DATA_READY.0, Ordering::AcqRel);
        self.armed.store(true, Ordering::Release);
    }

    /// Stop aggregating until the next [`arm`](Self::arm)
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    /// Lines are armed for the current cycle
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Complete a cycle that expects no slots
    pub fn complete_empty_cycle(&self) {
        self.armed.store(false, Ordering::Release);
        self.raise(TaskFlags::DATA_READY);
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// Device interrupt entry point, call from the board's ISR
    pub fn on_interrupt(&self, slot: u8) -> InterruptOutcome {
        let outcome = if !self.armed.load(Ordering::Acquire) {
            InterruptOutcome::Ignored
        } else {
            let target = self.target.load();
            match self.ready.set_and_check(slot, target) {
                Completion::Complete => {
                    let disable_line = !target.is_subset_of(self.free_running.load());
                    if disable_line {
                        self.armed.store(false, Ordering::Release);
                    }
                    self.raise(TaskFlags::DATA_READY);
                    self.cycles.fetch_add(1, Ordering::Relaxed);
                    InterruptOutcome::CycleComplete { disable_line }
                }
                Completion::Pending(_) => InterruptOutcome::Pending,
                Completion::Outside => InterruptOutcome::Ignored,
            }
        };

        if let Some(cb) = critical_section::with(|cs| self.on_interrupt_cb.borrow(cs).get()) {
            cb(slot, outcome);
        }
        outcome
    }

    /// Slots that have reported in the current cycle
    pub fn ready(&self) -> SlotMask {
        self.ready.load()
    }

    /// Slots expected in the current cycle
    pub fn target(&self) -> SlotMask {
        self.target.load()
    }

    /// Consume the cycle-complete flag
    ///
    /// `WouldBlock` until every expected slot has reported, so main loops
    /// can use `nb::block!`.
    pub fn poll_cycle(&self) -> nb::Result<(), Infallible> {
        if self.take(TaskFlags::DATA_READY) {
            Ok(())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    /// Cycles completed since creation
    pub fn cycles_completed(&self) -> u32 {
        self.cycles.load(Ordering::Relaxed)
    }

    // ===== NON-BLOCKING ROUNDS =====

    /// Start a round waiting on every bus in `buses`
    ///
    /// An empty round completes immediately.
    pub fn begin_io(&self, buses: BusMask) {
        self.io_done.store(BusMask::EMPTY);
        self.io_failed.store(BusMask::EMPTY);
        self.flags.fetch_and(!TaskFlags::IQ_READY.0, Ordering::AcqRel);
        self.io_pending.store(buses);

        if buses.is_empty() {
            self.complete_io();
        }
    }

    /// Bus transfer finished, call from the board's transfer-complete ISR
    ///
    /// Returns `true` when this call completed the round.
    pub fn notify_bus_complete(&self, bus: u8) -> bool {
        self.finish_bus(bus, false)
    }

    /// Bus transfer failed, counts as done for aggregation
    pub fn notify_bus_failed(&self, bus: u8) -> bool {
        self.finish_bus(bus, true)
    }

    fn finish_bus(&self, bus: u8, failed: bool) -> bool {
        let pending = self.io_pending.load();
        if !pending.contains(bus) {
            return false;
        }
        if failed {
            self.io_failed.set(bus);
        }

        match self.io_done.set_and_check(bus, pending) {
            Completion::Complete => {
                // Only the completing caller gets here; retire the round so
                // late duplicates see an empty pending set.
                if self.io_pending.compare_and_set(pending, BusMask::EMPTY).is_ok() {
                    self.complete_io();
                    true
                } else {
                    false
                }
            }
            Completion::Pending(_) | Completion::Outside => false,
        }
    }

    fn complete_io(&self) {
        self.raise(TaskFlags::IQ_READY);
        self.io_rounds.fetch_add(1, Ordering::Relaxed);
        let failed = self.io_failed.load();
        if let Some(cb) = critical_section::with(|cs| self.on_io_complete_cb.borrow(cs).get()) {
            cb(failed);
        }
    }

    /// Buses of the current round that have not reported
    pub fn io_outstanding(&self) -> BusMask {
        self.io_pending.load() - self.io_done.load()
    }

    /// Buses of the last round that failed
    pub fn io_failed(&self) -> BusMask {
        self.io_failed.load()
    }

    /// Check the round-complete flag without consuming it
    pub fn io_complete(&self) -> bool {
        self.pending_flags().contains(TaskFlags::IQ_READY)
    }

    /// Consume the round-complete flag, yielding the failed buses
    pub fn poll_io(&self) -> nb::Result<BusMask, Infallible> {
        if self.take(TaskFlags::IQ_READY) {
            Ok(self.io_failed.load())
        } else {
            Err(nb::Error::WouldBlock)
        }
    }

    /// Rounds completed since creation
    pub fn io_rounds_completed(&self) -> u32 {
        self.io_rounds.load(Ordering::Relaxed)
    }

    // ===== FLAGS =====

    /// Flags raised and not yet consumed
    pub fn pending_flags(&self) -> TaskFlags {
        TaskFlags(self.flags.load(Ordering::Acquire))
    }

    fn raise(&self, flag: TaskFlags) {
        self.flags.fetch_or(flag.0, Ordering::AcqRel);
    }

    fn take(&self, flag: TaskFlags) -> bool {
        self.flags.fetch_and(!flag.0, Ordering::AcqRel) & flag.0 != 0
    }
}

impl core::fmt::Debug for GroupSignals {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GroupSignals")
            .field("target", &self.target.load())
            .field("ready", &self.ready.load())
            .field("armed", &self.is_armed())
            .field("io_pending", &self.io_pending.load())
            .field("io_done", &self.io_done.load())
            .field("flags", &self.pending_flags())
            .finish_non_exhaustive()
    }
}

impl Default for GroupSignals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicUsize;

    fn two_slots() -> SlotMask {
        SlotMask::bit(0) | SlotMask::bit(1)
    }

    #[test]
    fn duplicate_interrupt_does_not_complete() {
        let s = GroupSignals::new();
        s.arm(two_slots(), SlotMask::EMPTY);

        assert_eq!(s.on_interrupt(0), InterruptOutcome::Pending);
        assert_eq!(s.on_interrupt(0), InterruptOutcome::Pending);
        assert!(s.poll_cycle().is_err());
        assert!(matches!(s.on_interrupt(1), InterruptOutcome::CycleComplete { .. }));
        assert_eq!(s.cycles_completed(), 1);
    }

    #[test]
    fn line_disarms_after_triggered_cycle() {
        let s = GroupSignals::new();
        s.arm(SlotMask::bit(3), SlotMask::EMPTY);

        assert_eq!(s.on_interrupt(3), InterruptOutcome::CycleComplete { disable_line: true });
        assert!(!s.is_armed());
        assert_eq!(s.on_interrupt(3), InterruptOutcome::Ignored);
        assert_eq!(s.cycles_completed(), 1);
    }

    #[test]
    fn free_running_keeps_line_enabled() {
        let s = GroupSignals::new();
        s.arm(SlotMask::bit(1), SlotMask::bit(1));

        assert_eq!(s.on_interrupt(1), InterruptOutcome::CycleComplete { disable_line: false });
        assert!(s.is_armed());
        assert_eq!(s.on_interrupt(1), InterruptOutcome::CycleComplete { disable_line: false });
        assert_eq!(s.cycles_completed(), 2);
    }

    #[test]
    fn mixed_free_running_disables() {
        let s = GroupSignals::new();
        s.arm(two_slots(), SlotMask::bit(0));
        s.on_interrupt(0);
        assert_eq!(s.on_interrupt(1), InterruptOutcome::CycleComplete { disable_line: true });
    }

    #[test]
    fn stray_slot_is_ignored() {
        let s = GroupSignals::new();
        s.arm(SlotMask::bit(0), SlotMask::EMPTY);
        assert_eq!(s.on_interrupt(5), InterruptOutcome::Ignored);
        assert!(s.ready().is_empty());
    }

    #[test]
    fn empty_cycle_completes_immediately() {
        let s = GroupSignals::new();
        s.arm(SlotMask::EMPTY, SlotMask::EMPTY);
        s.complete_empty_cycle();
        assert!(s.poll_cycle().is_ok());
        assert!(s.poll_cycle().is_err());
    }

    #[test]
    fn rearm_clears_stale_flag() {
        let s = GroupSignals::new();
        s.arm(SlotMask::bit(0), SlotMask::EMPTY);
        s.on_interrupt(0);
        s.arm(SlotMask::bit(0), SlotMask::EMPTY);
        assert!(s.poll_cycle().is_err());
    }

    static ROUNDS: AtomicUsize = AtomicUsize::new(0);

    fn count_round(_failed: BusMask) {
        ROUNDS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn io_round_with_failure_fires_once() {
        let s = GroupSignals::new();
        s.set_io_complete_callback(Some(count_round));
        s.begin_io(BusMask::bit(0) | BusMask::bit(1));

        assert!(!s.notify_bus_failed(1));
        assert!(!s.notify_bus_failed(1));
        assert!(s.notify_bus_complete(0));
        assert!(!s.notify_bus_complete(0));

        assert_eq!(ROUNDS.load(Ordering::SeqCst), 1);
        assert_eq!(s.poll_io(), Ok(BusMask::bit(1)));
        assert!(s.io_outstanding().is_empty());
    }

    #[test]
    fn unrelated_bus_is_ignored() {
        let s = GroupSignals::new();
        s.begin_io(BusMask::bit(2));
        assert!(!s.notify_bus_complete(0));
        assert_eq!(s.io_outstanding(), BusMask::bit(2));
        assert!(s.poll_io().is_err());
    }
}
