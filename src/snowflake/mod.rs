//! Time-ordered 64-bit id allocation.
//!
//! Layout, most significant bit first:
//!
//! ```text
//! [1 unused][41 timestamp offset ms][5 datacenter][5 machine][12 sequence]
//! ```
//!
//! The timestamp is relative to [`EPOCH_MILLIS`] (2024-01-01T00:00:00Z), which leaves
//! roughly 69 years of range. One allocator serializes every caller through a single
//! critical section holding the last timestamp and the per-millisecond sequence.

pub mod node;

use crate::clock::{Clock, SystemClock};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

pub const EPOCH_MILLIS: u64 = 1_704_067_200_000;

const DATACENTER_ID_BITS: u32 = 5;
const MACHINE_ID_BITS: u32 = 5;
const SEQUENCE_BITS: u32 = 12;
const TIMESTAMP_BITS: u32 = 41;

pub const MAX_DATACENTER_ID: i64 = (1 << DATACENTER_ID_BITS) - 1;
pub const MAX_MACHINE_ID: i64 = (1 << MACHINE_ID_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP_OFFSET: u64 = (1 << TIMESTAMP_BITS) - 1;

const MACHINE_ID_SHIFT: u32 = SEQUENCE_BITS;
const DATACENTER_ID_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS + DATACENTER_ID_BITS;

// Sequence exhaustion waits for the next tick, sleeping between polls.
const TICK_POLL_INTERVAL: Duration = Duration::from_micros(100);
const MAX_TICK_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid allocator configuration: {0}")]
    Config(String),
    #[error("clock moved backwards by {behind_ms}ms, refusing to allocate")]
    ClockRegression { behind_ms: u64 },
    #[error("clock did not advance past {last_ms} while waiting for a new sequence")]
    ClockStalled { last_ms: u64 },
    #[error("clock reads before the allocator epoch")]
    BeforeEpoch,
    #[error("timestamp no longer fits the id layout")]
    TimestampOverflow,
}

/// Decoded id fields. `timestamp` is absolute Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnowflakeParts {
    pub timestamp: u64,
    pub datacenter_id: u8,
    pub machine_id: u8,
    pub sequence: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorInfo {
    pub datacenter_id: u8,
    pub machine_id: u8,
    pub epoch: u64,
}

#[derive(Debug, Default)]
struct AllocatorState {
    last_timestamp: u64,
    sequence: u64,
}

#[derive(Debug)]
pub struct IdAllocator {
    datacenter_id: u8,
    machine_id: u8,
    clock: Arc<dyn Clock>,
    state: Mutex<AllocatorState>,
}

impl IdAllocator {
    /// Allocator reading the system clock.
    ///
    /// # Errors
    /// Returns [`IdError::Config`] if either node id is outside `0..=31`.
    pub fn new(datacenter_id: i64, machine_id: i64) -> Result<Self, IdError> {
        Self::with_clock(datacenter_id, machine_id, Arc::new(SystemClock))
    }

    /// # Errors
    /// Returns [`IdError::Config`] if either node id is outside `0..=31`.
    pub fn with_clock(
        datacenter_id: i64,
        machine_id: i64,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IdError> {
        if !(0..=MAX_DATACENTER_ID).contains(&datacenter_id) {
            return Err(IdError::Config(format!(
                "datacenter id must be between 0 and {MAX_DATACENTER_ID}, got {datacenter_id}"
            )));
        }
        if !(0..=MAX_MACHINE_ID).contains(&machine_id) {
            return Err(IdError::Config(format!(
                "machine id must be between 0 and {MAX_MACHINE_ID}, got {machine_id}"
            )));
        }

        Ok(Self {
            datacenter_id: u8::try_from(datacenter_id)
                .map_err(|e| IdError::Config(e.to_string()))?,
            machine_id: u8::try_from(machine_id).map_err(|e| IdError::Config(e.to_string()))?,
            clock,
            state: Mutex::new(AllocatorState::default()),
        })
    }

    /// Allocate the next id.
    ///
    /// # Errors
    /// - [`IdError::ClockRegression`] if the clock is behind the last allocation.
    /// - [`IdError::ClockStalled`] if the sequence is exhausted and the clock never advances.
    /// - [`IdError::BeforeEpoch`] / [`IdError::TimestampOverflow`] if the clock is out of range.
    pub fn next(&self) -> Result<u64, IdError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let mut timestamp = self.clock.now_millis();
        if timestamp < state.last_timestamp {
            let behind_ms = state.last_timestamp - timestamp;
            warn!(behind_ms, "clock regression detected, refusing to allocate id");
            return Err(IdError::ClockRegression { behind_ms });
        }

        let sequence = if timestamp == state.last_timestamp {
            let sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if sequence == 0 {
                // State is only committed below, so a failed wait leaves the
                // exhausted sequence in place for the next caller.
                timestamp = self.wait_next_millis(state.last_timestamp)?;
            }
            sequence
        } else {
            0
        };

        let id = self.pack(timestamp, sequence)?;

        state.last_timestamp = timestamp;
        state.sequence = sequence;

        Ok(id)
    }

    /// Signed view of [`IdAllocator::next`] for consumers storing ids as `BIGINT`.
    ///
    /// # Errors
    /// Same as [`IdAllocator::next`].
    pub fn generate(&self) -> Result<i64, IdError> {
        let id = self.next()?;
        i64::try_from(id).map_err(|_| IdError::TimestampOverflow)
    }

    #[must_use]
    pub fn info(&self) -> AllocatorInfo {
        AllocatorInfo {
            datacenter_id: self.datacenter_id,
            machine_id: self.machine_id,
            epoch: EPOCH_MILLIS,
        }
    }

    fn pack(&self, timestamp: u64, sequence: u64) -> Result<u64, IdError> {
        let offset = timestamp
            .checked_sub(EPOCH_MILLIS)
            .ok_or(IdError::BeforeEpoch)?;
        if offset > MAX_TIMESTAMP_OFFSET {
            return Err(IdError::TimestampOverflow);
        }

        Ok((offset << TIMESTAMP_SHIFT)
            | (u64::from(self.datacenter_id) << DATACENTER_ID_SHIFT)
            | (u64::from(self.machine_id) << MACHINE_ID_SHIFT)
            | sequence)
    }

    fn wait_next_millis(&self, last: u64) -> Result<u64, IdError> {
        let started = Instant::now();
        loop {
            let now = self.clock.now_millis();
            if now > last {
                return Ok(now);
            }
            if now < last {
                return Err(IdError::ClockRegression {
                    behind_ms: last - now,
                });
            }
            if started.elapsed() >= MAX_TICK_WAIT {
                return Err(IdError::ClockStalled { last_ms: last });
            }
            std::thread::sleep(TICK_POLL_INTERVAL);
        }
    }
}

/// Decode an id into its fields.
#[must_use]
pub fn parse(id: u64) -> SnowflakeParts {
    SnowflakeParts {
        timestamp: (id >> TIMESTAMP_SHIFT) + EPOCH_MILLIS,
        datacenter_id: ((id >> DATACENTER_ID_SHIFT) & 0x1F) as u8,
        machine_id: ((id >> MACHINE_ID_SHIFT) & 0x1F) as u8,
        sequence: (id & SEQUENCE_MASK) as u16,
    }
}
