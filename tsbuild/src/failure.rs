//! Bridge from external liveness detection into work redistribution.
//!
//! Liveness detection itself is an external collaborator; the transport
//! core only consumes its verdicts. When a connection is declared dead,
//! the bridge takes the manager's reschedule decision, hands the
//! displaced timeslices back to the sender for re-transmission, and
//! stretches the current interval deadline so the stragglers do not
//! count as schedule drift.

use std::collections::BTreeSet;
use std::collections::VecDeque;

use crate::manager::TimesliceManager;
use crate::scheduler::IntervalScheduler;

/// Verdict of the external failure oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedNodeInfo {
    /// Index of the dead connection.
    pub connection: u16,
    /// Timeslice at which the failure was detected; contributions after
    /// it are considered undelivered.
    pub trigger_timeslice: u64,
}

/// External source of failure verdicts.
pub trait FailureOracle {
    /// Next pending verdict, if any. Non-blocking.
    fn poll_failure(&mut self) -> Option<FailedNodeInfo>;
}

/// A queue-backed oracle, useful for tests and for embedders that feed
/// verdicts from their own detection loop.
#[derive(Default)]
pub struct QueueOracle {
    pending: VecDeque<FailedNodeInfo>,
}

impl QueueOracle {
    /// Create an empty oracle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a verdict.
    pub fn push(&mut self, info: FailedNodeInfo) {
        self.pending.push_back(info);
    }
}

impl FailureOracle for QueueOracle {
    fn poll_failure(&mut self) -> Option<FailedNodeInfo> {
        self.pending.pop_front()
    }
}

/// Consumes oracle verdicts and drives redistribution.
pub struct FailureBridge {
    timeout_connections: BTreeSet<u32>,
}

impl FailureBridge {
    /// Create a bridge with no known failures.
    pub fn new() -> Self {
        Self {
            timeout_connections: BTreeSet::new(),
        }
    }

    /// Connections declared dead so far.
    pub fn timeout_connections(&self) -> &BTreeSet<u32> {
        &self.timeout_connections
    }

    /// Process one pending verdict.
    ///
    /// Returns the failed connection and the timeslices to re-send, or
    /// `None` if the oracle has nothing new.
    pub fn poll(
        &mut self,
        oracle: &mut dyn FailureOracle,
        manager: &mut TimesliceManager,
        scheduler: &mut IntervalScheduler,
        gap_us: u64,
    ) -> Option<(u16, Vec<u64>)> {
        let info = oracle.poll_failure()?;
        if manager.is_decision_considered(info.connection) {
            return None;
        }
        self.timeout_connections.insert(info.connection as u32);
        let moved = manager.consider_reschedule_decision(info, &self.timeout_connections);
        scheduler.extend_current_deadline(gap_us);
        Some((info.connection, moved))
    }
}

impl Default for FailureBridge {
    fn default() -> Self {
        Self::new()
    }
}
