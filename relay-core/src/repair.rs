//! Reserved "pairing invalid" status codes and the re-pair budget.
//!
//! The relay server answers with a status from a contiguous reserved block
//! when it no longer recognizes the client or pair id. Relay servers have
//! shipped with different blocks (560-562 and 559-569), so the block is
//! configuration, not a literal.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Inclusive range of HTTP status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRange {
    /// First reserved status.
    pub start: u16,
    /// Last reserved status (inclusive).
    pub end: u16,
}

/// A status range whose start lies after its end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("status range {start}-{end} is inverted")]
pub struct StatusRangeError {
    /// Rejected start.
    pub start: u16,
    /// Rejected end.
    pub end: u16,
}

impl StatusRange {
    /// Default reserved block.
    pub const DEFAULT: StatusRange = StatusRange {
        start: 559,
        end: 569,
    };

    /// Create a validated range.
    pub fn new(start: u16, end: u16) -> Result<Self, StatusRangeError> {
        let range = Self { start, end };
        range.validate()?;
        Ok(range)
    }

    /// Reject inverted ranges (deserialized ranges skip [`StatusRange::new`]).
    pub fn validate(&self) -> Result<(), StatusRangeError> {
        if self.start > self.end {
            return Err(StatusRangeError {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// True if `status` falls inside the range.
    pub fn contains(&self, status: u16) -> bool {
        (self.start..=self.end).contains(&status)
    }
}

impl Default for StatusRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// What the coordinator should do about one reserved status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairDecision {
    /// Re-pair and retry; `attempt` is the counter after incrementing.
    Repair {
        /// Counter value for this re-pair.
        attempt: u32,
    },
    /// Budget spent; surface the failure.
    Exhausted {
        /// Counter value when the budget ran out.
        attempts: u32,
    },
}

/// Reserved range plus re-pair budget for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairPolicy {
    /// Statuses that mean "pairing invalid".
    pub reserved: StatusRange,
    /// Re-pairs allowed between two successful responses.
    pub budget: u32,
}

impl RepairPolicy {
    /// True if the status asks for a re-pair.
    pub fn is_reserved(&self, status: u16) -> bool {
        self.reserved.contains(status)
    }

    /// A fresh counter for this policy.
    pub fn counter(&self) -> RepairCounter {
        RepairCounter::new(self.budget)
    }
}

/// Consecutive re-pair counter.
///
/// Starts at 1; a re-pair is allowed while `attempts < budget`. Any
/// successfully decrypted response resets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairCounter {
    attempts: u32,
    budget: u32,
}

impl RepairCounter {
    /// Create a counter with the given budget.
    pub fn new(budget: u32) -> Self {
        Self {
            attempts: 1,
            budget,
        }
    }

    /// Current counter value.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record one reserved status.
    pub fn on_reserved(&mut self) -> RepairDecision {
        if self.attempts < self.budget {
            self.attempts += 1;
            RepairDecision::Repair {
                attempt: self.attempts,
            }
        } else {
            RepairDecision::Exhausted {
                attempts: self.attempts,
            }
        }
    }

    /// Record a successful exchange.
    pub fn reset(&mut self) {
        self.attempts = 1;
    }
}
