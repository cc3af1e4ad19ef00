//! Per-bus queues for deferred waveform reads
//!
//! Reads are queued in the main flow, started together by
//! [`Group::start_nb`](crate::Group::start_nb), and retired by
//! [`Group::finish_nb`](crate::Group::finish_nb) once every started bus has
//! reported. Only the main flow touches these queues; the interrupt side
//! sees bus bits in [`GroupSignals`](crate::GroupSignals).

use heapless::Vec;

use crate::constants::MAX_BUSES;
use crate::mask::BusMask;
use crate::time::Timestamp;
use crate::transport::ReadRequest;

/// Why a read could not be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Bus index beyond [`MAX_BUSES`]
    NoSuchBus,
    /// Slot already has a read queued this round
    Duplicate,
    /// Queue at capacity
    Full,
    /// A round is in flight, finish it first
    InFlight,
}

/// Queued reads for every bus of a group with `N` slots
#[derive(Debug)]
pub struct NbQueues<const N: usize> {
    buses: [Vec<ReadRequest, N>; MAX_BUSES],
    started: BusMask,
    started_at: Timestamp,
}

impl<const N: usize> NbQueues<N> {
    /// Empty queues
    pub fn new() -> Self {
        Self {
            buses: core::array::from_fn(|_| Vec::new()),
            started: BusMask::EMPTY,
            started_at: 0,
        }
    }

    /// Queue `request` on `bus`
    pub fn push(&mut self, bus: u8, request: ReadRequest) -> Result<(), QueueError> {
        if self.in_flight() {
            return Err(QueueError::InFlight);
        }
        if self.contains_slot(request.slot) {
            return Err(QueueError::Duplicate);
        }
        let queue = self.buses.get_mut(bus as usize).ok_or(QueueError::NoSuchBus)?;
        queue.push(request).map_err(|_| QueueError::Full)
    }

    /// Some bus already holds a read for `slot`
    pub fn contains_slot(&self, slot: u8) -> bool {
        self.buses.iter().flatten().any(|r| r.slot == slot)
    }

    /// Buses with at least one queued read
    pub fn busy_buses(&self) -> BusMask {
        self.buses
            .iter()
            .enumerate()
            .filter(|(_, q)| !q.is_empty())
            .fold(BusMask::EMPTY, |mask, (bus, _)| mask.with(bus as u8))
    }

    /// Reads queued on `bus`
    pub fn bus(&self, bus: u8) -> &[ReadRequest] {
        self.buses.get(bus as usize).map(|q| q.as_slice()).unwrap_or(&[])
    }

    /// Total queued reads
    pub fn len(&self) -> usize {
        self.buses.iter().map(|q| q.len()).sum()
    }

    /// Nothing queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record that `buses` were started at `now`
    pub fn mark_started(&mut self, buses: BusMask, now: Timestamp) {
        self.started = buses;
        self.started_at = now;
    }

    /// Buses of the round in flight
    pub fn started(&self) -> BusMask {
        self.started
    }

    /// When the round in flight was started
    pub fn started_at(&self) -> Timestamp {
        self.started_at
    }

    /// A started round has not been retired
    pub fn in_flight(&self) -> bool {
        !self.started.is_empty()
    }

    /// Drop every queued read and forget the round
    pub fn clear(&mut self) {
        for queue in self.buses.iter_mut() {
            queue.clear();
        }
        self.started = BusMask::EMPTY;
    }
}

impl<const N: usize> Default for NbQueues<N> {
    fn default() -> Self {
        Self::new()
    }
}
