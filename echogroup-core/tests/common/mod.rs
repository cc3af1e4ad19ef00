//! Shared board fixtures for integration tests
//!
//! Provides:
//! - Simulated boards with a chosen mix of present and absent sensors
//! - Brought-up groups ready for configuration
//! - A counter for `fn` pointer hooks, one static per test

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use echogroup_core::sim::{SimSensor, SimTransport};
use echogroup_core::{Firmware, FirmwareImage, Group, GroupConfig, GroupSignals};

/// Image bound to every test slot
pub static IMAGE: FirmwareImage = FirmwareImage::new("it_fw_1.0", &[0xC3; 32]);

/// Short-range sensors, slot `i` on bus `buses[i]`
pub fn board_on_buses(buses: &[u8]) -> SimTransport {
    SimTransport::new(buses.iter().map(|&b| SimSensor::ch101(b)).collect())
}

/// `n` short-range sensors on bus 0
pub fn board(n: usize) -> SimTransport {
    SimTransport::new((0..n).map(|_| SimSensor::ch101(0)).collect())
}

/// Bind every board slot to the short-range firmware and bring the group up
pub fn started_group<'s, const N: usize>(
    transport: SimTransport,
    signals: &'s GroupSignals,
) -> Group<'s, SimTransport, N> {
    let config = GroupConfig { num_ports: N as u8, ..GroupConfig::fast() };
    let mut group = Group::new(transport, signals, config);
    for slot in 0..N as u8 {
        group.init_slot(slot, Firmware::gpr(&IMAGE)).unwrap();
    }
    let report = group.start();
    assert!(report.is_ok(), "bring-up failed: {:?}", report);
    group
}

/// Counter bumped from an interrupt hook
pub struct HookCounter(AtomicUsize);

impl HookCounter {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}
