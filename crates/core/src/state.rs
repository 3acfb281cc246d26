#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};

pub const TCP_STATE_COUNT: usize = 10;

/// Canonical TCP connection states tracked per connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed = 0,
    Listen = 1,
    SynSent = 2,
    SynReceived = 3,
    Established = 4,
    FinWait = 5,
    CloseWait = 6,
    Closing = 7,
    LastAck = 8,
    TimeWait = 9,
}

impl TcpState {
    pub const ALL: [TcpState; TCP_STATE_COUNT] = [
        TcpState::Closed,
        TcpState::Listen,
        TcpState::SynSent,
        TcpState::SynReceived,
        TcpState::Established,
        TcpState::FinWait,
        TcpState::CloseWait,
        TcpState::Closing,
        TcpState::LastAck,
        TcpState::TimeWait,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Per-state connection refcounts. An external tracker decides which
/// transitions happen; this table only keeps the counts, and a count never
/// drops below zero.
#[derive(Debug, Default)]
pub struct TcpStateTable {
    slots: [AtomicU64; TCP_STATE_COUNT],
}

impl TcpStateTable {
    pub fn new() -> Self {
        TcpStateTable::default()
    }

    pub fn enter(&self, state: TcpState) {
        self.slots[state.slot()].fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero; a spurious leave is dropped rather than wrapped.
    pub fn leave(&self, state: TcpState) {
        let _ = self.slots[state.slot()]
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            });
    }

    /// Move one connection between slots; `from == None` admits a new
    /// connection.
    pub fn transition(&self, from: Option<TcpState>, to: TcpState) {
        if let Some(from) = from {
            self.leave(from);
        }
        self.enter(to);
    }

    pub fn count(&self, state: TcpState) -> u64 {
        self.slots[state.slot()].load(Ordering::Relaxed)
    }

    pub fn counts(&self) -> [u64; TCP_STATE_COUNT] {
        let mut out = [0u64; TCP_STATE_COUNT];
        for (slot, value) in self.slots.iter().enumerate() {
            out[slot] = value.load(Ordering::Relaxed);
        }
        out
    }

    pub fn total(&self) -> u64 {
        self.counts().iter().sum()
    }
}
