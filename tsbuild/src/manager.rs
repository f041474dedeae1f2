//! Timeslice-to-connection assignment and lifecycle tracking.
//!
//! Every timeslice is assigned to exactly one compute connection through
//! a virtual-to-physical mapping (uniform round-robin by default,
//! weighted when a distribution frequency is set). The manager tracks
//! each timeslice from transmission through rdma-ack to completion-ack,
//! translates peer work-item indices back to timeslices, and reassigns
//! unsent or in-flight timeslices when a connection is declared failed.

use std::collections::BTreeSet;

use sizedmap::SizedMap;

use crate::failure::FailedNodeInfo;

/// History bound for blockage bookkeeping.
const LOG_HISTORY: usize = 200;

/// Per-(connection, timeslice) transfer record.
#[derive(Debug, Clone, Copy)]
pub struct TimesliceInfo {
    /// Time the write was submitted, microseconds.
    pub transmit_time_us: u64,
    /// Total transferred bytes.
    pub size: u64,
    /// Work-item index at the peer (dense, monotone per connection).
    pub compute_desc: u64,
    /// Submission-to-write-completion latency, once known.
    pub rdma_acked_us: Option<u64>,
    /// Submission-to-completion-ack latency, once known.
    pub completion_acked_us: Option<u64>,
}

/// Assignment and lifecycle manager for one input channel.
pub struct TimesliceManager {
    compute_count: u32,
    virtual_mapping: Vec<u32>,
    refill_chunk: u64,
    conn_timeslice_info: Vec<SizedMap<u64, TimesliceInfo>>,
    conn_desc_timeslice: Vec<SizedMap<u64, u64>>,
    future_timeslices: Vec<BTreeSet<u64>>,
    last_conn_desc: Vec<u64>,
    last_conn_timeslice: Vec<u64>,
    last_rdma_acked: Vec<u64>,
    last_acked_desc: Vec<u64>,
    next_start_future_timeslice: u64,
    redistribution_decisions: SizedMap<u32, u64>,
    timeout_connections: BTreeSet<u32>,
    ib_blocked_since: SizedMap<u64, u64>,
    cb_blocked_since: SizedMap<u64, u64>,
    mr_blocked_since: SizedMap<u64, u64>,
}

impl TimesliceManager {
    /// Create a manager for `compute_count` connections with uniform
    /// round-robin distribution.
    pub fn new(compute_count: u32, interval_length: u64) -> Self {
        let n = compute_count.max(1) as usize;
        Self {
            compute_count: n as u32,
            virtual_mapping: (0..n as u32).collect(),
            refill_chunk: (interval_length.max(1)) * n as u64,
            conn_timeslice_info: (0..n).map(|_| SizedMap::unbounded()).collect(),
            conn_desc_timeslice: (0..n).map(|_| SizedMap::unbounded()).collect(),
            future_timeslices: (0..n).map(|_| BTreeSet::new()).collect(),
            last_conn_desc: vec![0; n],
            last_conn_timeslice: vec![0; n],
            last_rdma_acked: vec![0; n],
            last_acked_desc: vec![0; n],
            next_start_future_timeslice: 0,
            redistribution_decisions: SizedMap::new(LOG_HISTORY),
            timeout_connections: BTreeSet::new(),
            ib_blocked_since: SizedMap::new(LOG_HISTORY),
            cb_blocked_since: SizedMap::new(LOG_HISTORY),
            mr_blocked_since: SizedMap::new(LOG_HISTORY),
        }
    }

    /// Number of compute connections.
    #[inline]
    pub fn compute_count(&self) -> u32 {
        self.compute_count
    }

    /// The connection a timeslice is assigned to under the current
    /// distribution.
    #[inline]
    pub fn owner_of(&self, ts: u64) -> u16 {
        self.virtual_mapping[(ts % self.virtual_mapping.len() as u64) as usize] as u16
    }

    /// Check whether a connection has been declared failed.
    #[inline]
    pub fn is_connection_timed_out(&self, conn: u16) -> bool {
        self.timeout_connections.contains(&(conn as u32))
    }

    /// Check whether a reschedule decision for `conn` has already been
    /// taken.
    pub fn is_decision_considered(&self, conn: u16) -> bool {
        self.redistribution_decisions.contains(&(conn as u32))
    }

    fn refill_future_timeslices(&mut self, up_to: u64) {
        for ts in self.next_start_future_timeslice..up_to {
            let owner = self.owner_of(ts) as usize;
            self.future_timeslices[owner].insert(ts);
        }
        self.next_start_future_timeslice = self.next_start_future_timeslice.max(up_to);
    }

    /// The next unsent timeslice assigned to `conn`, if any.
    pub fn next_for(&mut self, conn: u16) -> Option<u64> {
        if self.is_connection_timed_out(conn) {
            return None;
        }
        if self.future_timeslices[conn as usize].is_empty() {
            let up_to = self.next_start_future_timeslice + self.refill_chunk;
            self.refill_future_timeslices(up_to);
        }
        self.future_timeslices[conn as usize].first().copied()
    }

    /// Record the transmission of `ts` on `conn`, assigning the next
    /// dense work-item index.
    pub fn mark_transmitted(&mut self, conn: u16, ts: u64, size: u64, now_us: u64) {
        let cn = conn as usize;
        self.refill_future_timeslices(ts + 1);
        self.future_timeslices[cn].remove(&ts);
        self.last_conn_desc[cn] += 1;
        let compute_desc = self.last_conn_desc[cn];
        self.last_conn_timeslice[cn] = ts;
        self.conn_timeslice_info[cn].add(
            ts,
            TimesliceInfo {
                transmit_time_us: now_us,
                size,
                compute_desc,
                rdma_acked_us: None,
                completion_acked_us: None,
            },
        );
        self.conn_desc_timeslice[cn].add(compute_desc, ts);
    }

    /// Record the local write completion of `ts` on `conn`.
    ///
    /// Returns false if the timeslice is unknown (already redistributed
    /// away from this connection).
    pub fn mark_rdma_write_acked(&mut self, conn: u16, ts: u64, now_us: u64) -> bool {
        let cn = conn as usize;
        match self.conn_timeslice_info[cn].get_mut(&ts) {
            Some(info) => {
                info.rdma_acked_us = Some(now_us.saturating_sub(info.transmit_time_us));
                self.last_rdma_acked[cn] = self.last_rdma_acked[cn].max(ts);
                true
            }
            None => false,
        }
    }

    /// Acknowledge all timeslices of `conn` with work-item indices
    /// `<= up_to_desc`, dropping them from the working set.
    ///
    /// Returns the average submission-to-ack latency of the acknowledged
    /// timeslices, if any.
    pub fn mark_completion_acked(&mut self, conn: u16, up_to_desc: u64, now_us: u64) -> Option<u64> {
        let cn = conn as usize;
        let acked = self.conn_desc_timeslice[cn].drain_up_to(up_to_desc);
        if acked.is_empty() {
            return None;
        }
        self.last_acked_desc[cn] = self.last_acked_desc[cn].max(up_to_desc);
        let mut total = 0u64;
        let mut count = 0u64;
        for (_, ts) in &acked {
            if let Some(info) = self.conn_timeslice_info[cn].remove(ts) {
                total += now_us.saturating_sub(info.transmit_time_us);
                count += 1;
            }
        }
        (count > 0).then(|| total / count)
    }

    /// Check whether the write for `ts` on `conn` has completed locally.
    pub fn is_timeslice_rdma_acked(&self, conn: u16, ts: u64) -> bool {
        self.conn_timeslice_info[conn as usize]
            .get(&ts)
            .is_some_and(|info| info.rdma_acked_us.is_some())
    }

    /// The timeslice behind a peer work-item index.
    pub fn timeslice_by_descriptor(&self, conn: u16, desc: u64) -> Option<u64> {
        self.conn_desc_timeslice[conn as usize].get(&desc).copied()
    }

    /// Highest work-item index acknowledged by `conn`.
    pub fn last_acked_descriptor(&self, conn: u16) -> u64 {
        self.last_acked_desc[conn as usize]
    }

    /// Newest timeslice on `conn` whose write has completed locally.
    pub fn last_rdma_acked_timeslice(&self, conn: u16) -> u64 {
        self.last_rdma_acked[conn as usize]
    }

    /// Transfer record of a timeslice on a connection.
    pub fn timeslice_info(&self, conn: u16, ts: u64) -> Option<&TimesliceInfo> {
        self.conn_timeslice_info[conn as usize].get(&ts)
    }

    /// Greatest timeslice that can still be sent to `conn` before its
    /// peer buffer window (of `peer_desc_capacity` work items beyond the
    /// last ack) blocks further writes.
    pub fn last_timeslice_before_blockage(&mut self, conn: u16, peer_desc_capacity: u64) -> u64 {
        let cn = conn as usize;
        let limit_desc = self.last_acked_desc[cn] + peer_desc_capacity;
        if self.last_conn_desc[cn] >= limit_desc {
            return self
                .conn_desc_timeslice[cn]
                .get(&limit_desc)
                .copied()
                .unwrap_or(self.last_conn_timeslice[cn]);
        }
        let mut remaining = limit_desc - self.last_conn_desc[cn];
        if self.future_timeslices[cn].len() < remaining as usize {
            let up_to = self.next_start_future_timeslice + remaining * self.compute_count as u64;
            self.refill_future_timeslices(up_to);
        }
        let mut last = self.last_conn_timeslice[cn];
        for &ts in &self.future_timeslices[cn] {
            if remaining == 0 {
                break;
            }
            last = ts;
            remaining -= 1;
        }
        last
    }

    /// Apply a failure decision: remove the dead connection from the
    /// distribution and return the timeslices transmitted to it after
    /// the trigger, reassigned to the surviving connections.
    ///
    /// A second decision for the same connection is a no-op.
    pub fn consider_reschedule_decision(
        &mut self,
        failed: FailedNodeInfo,
        timeout_connections: &BTreeSet<u32>,
    ) -> Vec<u64> {
        let cn = failed.connection as u32;
        if !self.redistribution_decisions.add(cn, failed.trigger_timeslice) {
            return Vec::new();
        }
        self.timeout_connections.insert(cn);
        self.timeout_connections.extend(timeout_connections.iter().copied());
        self.rebuild_mapping_without_timeouts();

        // pull back what was already on the wire after the trigger
        let moved = self.undo_transmitted_after_trigger(failed.connection, failed.trigger_timeslice);

        // unsent work of the dead connection moves as well
        let unsent: Vec<u64> =
            std::mem::take(&mut self.future_timeslices[failed.connection as usize])
                .into_iter()
                .collect();
        for ts in unsent {
            let owner = self.owner_of(ts) as usize;
            self.future_timeslices[owner].insert(ts);
        }
        for &ts in &moved {
            let owner = self.owner_of(ts) as usize;
            self.future_timeslices[owner].insert(ts);
        }
        moved
    }

    fn rebuild_mapping_without_timeouts(&mut self) {
        let alive: Vec<u32> = self
            .virtual_mapping
            .iter()
            .copied()
            .filter(|c| !self.timeout_connections.contains(c))
            .collect();
        if !alive.is_empty() {
            self.virtual_mapping = alive;
        }
    }

    fn undo_transmitted_after_trigger(&mut self, conn: u16, trigger: u64) -> Vec<u64> {
        let cn = conn as usize;
        let moved: Vec<u64> = self.conn_timeslice_info[cn]
            .iter()
            .map(|(ts, _)| *ts)
            .filter(|ts| *ts > trigger)
            .collect();
        for ts in &moved {
            if let Some(info) = self.conn_timeslice_info[cn].remove(ts) {
                self.conn_desc_timeslice[cn].remove(&info.compute_desc);
            }
        }
        moved
    }

    /// Replace the distribution weights for `[start_ts, last_ts]` and
    /// onwards. `frequency[c]` is the share of connection `c`.
    ///
    /// Returns already-transmitted timeslices in the range that now
    /// belong to a different connection; they are re-queued on their new
    /// owners.
    pub fn update_compute_distribution_frequency(
        &mut self,
        start_ts: u64,
        last_ts: u64,
        frequency: &[u32],
    ) -> Vec<u64> {
        assert_eq!(frequency.len(), self.compute_count as usize);
        let mut mapping = Vec::new();
        for (conn, freq) in frequency.iter().enumerate() {
            if self.timeout_connections.contains(&(conn as u32)) {
                continue;
            }
            for _ in 0..*freq {
                mapping.push(conn as u32);
            }
        }
        assert!(!mapping.is_empty(), "distribution maps to no connection");
        self.virtual_mapping = mapping;

        // reshuffle unsent work under the new mapping
        let pending: Vec<u64> = self
            .future_timeslices
            .iter_mut()
            .flat_map(std::mem::take)
            .collect();
        for ts in pending {
            let owner = self.owner_of(ts) as usize;
            self.future_timeslices[owner].insert(ts);
        }

        // pull back transmitted timeslices that changed owner
        let mut moved = Vec::new();
        for conn in 0..self.compute_count as usize {
            let in_range: Vec<u64> = self.conn_timeslice_info[conn]
                .range(start_ts, last_ts)
                .map(|(ts, _)| *ts)
                .filter(|ts| self.owner_of(*ts) as usize != conn)
                .collect();
            for ts in in_range {
                if let Some(info) = self.conn_timeslice_info[conn].remove(&ts) {
                    self.conn_desc_timeslice[conn].remove(&info.compute_desc);
                }
                let owner = self.owner_of(ts) as usize;
                self.future_timeslices[owner].insert(ts);
                moved.push(ts);
            }
        }
        moved.sort_unstable();
        moved
    }

    /// Record the start or end of a producer-underrun blockage for `ts`.
    /// Returns the blocked duration when `sent_completed` closes an open
    /// record.
    pub fn log_timeslice_ib_blocked(&mut self, ts: u64, now_us: u64, sent_completed: bool) -> u64 {
        Self::log_blocked(&mut self.ib_blocked_since, ts, now_us, sent_completed)
    }

    /// Record the start or end of a peer-buffer blockage for `ts`.
    pub fn log_timeslice_cb_blocked(&mut self, ts: u64, now_us: u64, sent_completed: bool) -> u64 {
        Self::log_blocked(&mut self.cb_blocked_since, ts, now_us, sent_completed)
    }

    /// Record the start or end of a credit-limit blockage for `ts`.
    pub fn log_timeslice_mr_blocked(&mut self, ts: u64, now_us: u64, sent_completed: bool) -> u64 {
        Self::log_blocked(&mut self.mr_blocked_since, ts, now_us, sent_completed)
    }

    fn log_blocked(log: &mut SizedMap<u64, u64>, ts: u64, now_us: u64, sent_completed: bool) -> u64 {
        if sent_completed {
            match log.remove(&ts) {
                Some(since) => now_us.saturating_sub(since),
                None => 0,
            }
        } else {
            log.add(ts, now_us);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(n: u32) -> TimesliceManager {
        TimesliceManager::new(n, 100)
    }

    #[test]
    fn test_round_robin_assignment() {
        let mut mgr = manager(3);
        assert_eq!(mgr.owner_of(0), 0);
        assert_eq!(mgr.owner_of(1), 1);
        assert_eq!(mgr.owner_of(2), 2);
        assert_eq!(mgr.owner_of(3), 0);

        assert_eq!(mgr.next_for(1), Some(1));
        mgr.mark_transmitted(1, 1, 1000, 10);
        assert_eq!(mgr.next_for(1), Some(4));
    }

    #[test]
    fn test_transmit_assigns_dense_descriptors() {
        let mut mgr = manager(2);
        mgr.mark_transmitted(0, 0, 100, 10);
        mgr.mark_transmitted(0, 2, 100, 20);
        mgr.mark_transmitted(0, 4, 100, 30);
        assert_eq!(mgr.timeslice_by_descriptor(0, 1), Some(0));
        assert_eq!(mgr.timeslice_by_descriptor(0, 2), Some(2));
        assert_eq!(mgr.timeslice_by_descriptor(0, 3), Some(4));
    }

    #[test]
    fn test_rdma_ack_lifecycle() {
        let mut mgr = manager(1);
        mgr.mark_transmitted(0, 0, 100, 1000);
        assert!(!mgr.is_timeslice_rdma_acked(0, 0));
        assert!(mgr.mark_rdma_write_acked(0, 0, 1250));
        assert!(mgr.is_timeslice_rdma_acked(0, 0));
        assert_eq!(mgr.timeslice_info(0, 0).unwrap().rdma_acked_us, Some(250));
        // unknown timeslice
        assert!(!mgr.mark_rdma_write_acked(0, 7, 1300));
    }

    #[test]
    fn test_completion_ack_drains_up_to_descriptor() {
        let mut mgr = manager(1);
        for ts in 0..4 {
            mgr.mark_transmitted(0, ts, 100, ts * 100);
        }
        // descriptors 1..=4; ack through 3 at t=1000
        let avg = mgr.mark_completion_acked(0, 3, 1000).unwrap();
        // latencies 1000, 900, 800 -> avg 900
        assert_eq!(avg, 900);
        assert_eq!(mgr.last_acked_descriptor(0), 3);
        assert!(mgr.timeslice_info(0, 2).is_none());
        assert!(mgr.timeslice_info(0, 3).is_some());
        // acked timeslices are gone from the working set for good
        assert!(mgr.mark_completion_acked(0, 3, 2000).is_none());
    }

    #[test]
    fn test_failure_redistribution() {
        // two connections, timeslices assigned alternately
        let mut mgr = manager(2);
        for ts in 0..10 {
            mgr.mark_transmitted(mgr.owner_of(ts), ts, 100, ts);
        }
        // 1 and 3 fully acked on connection 1 (descriptors 1 and 2)
        mgr.mark_completion_acked(1, 2, 100);

        let failed = FailedNodeInfo {
            connection: 1,
            trigger_timeslice: 4,
        };
        let moved = mgr.consider_reschedule_decision(failed, &BTreeSet::new());
        assert_eq!(moved, vec![5, 7, 9]);

        // the survivor picks up the moved timeslices before new work
        assert_eq!(mgr.next_for(0), Some(5));
        mgr.mark_transmitted(0, 5, 100, 200);
        assert_eq!(mgr.next_for(0), Some(7));
        mgr.mark_transmitted(0, 7, 100, 201);
        assert_eq!(mgr.next_for(0), Some(9));
        mgr.mark_transmitted(0, 9, 100, 202);
        assert_eq!(mgr.next_for(0), Some(10));

        // the dead connection yields nothing
        assert_eq!(mgr.next_for(1), None);
        // second decision is a no-op
        assert!(mgr
            .consider_reschedule_decision(
                FailedNodeInfo {
                    connection: 1,
                    trigger_timeslice: 4
                },
                &BTreeSet::new()
            )
            .is_empty());
    }

    #[test]
    fn test_weighted_distribution() {
        let mut mgr = manager(2);
        for ts in 0..4 {
            mgr.mark_transmitted(mgr.owner_of(ts), ts, 100, ts);
        }
        // shift to 2:1 in favor of connection 0
        let moved = mgr.update_compute_distribution_frequency(0, 3, &[2, 1]);
        // mapping [0, 0, 1]: ts 1 and 3 (conn 1) now belong to conn 0,
        // ts 2 (conn 0) now belongs to conn 1
        assert_eq!(moved, vec![1, 2, 3]);
        assert_eq!(mgr.owner_of(0), 0);
        assert_eq!(mgr.owner_of(1), 0);
        assert_eq!(mgr.owner_of(2), 1);
        assert_eq!(mgr.owner_of(3), 0);
        assert_eq!(mgr.next_for(0), Some(1));
        assert_eq!(mgr.next_for(1), Some(2));
    }

    #[test]
    fn test_last_timeslice_before_blockage() {
        let mut mgr = manager(2);
        mgr.mark_transmitted(0, 0, 100, 1);
        mgr.mark_transmitted(0, 2, 100, 2);
        // peer window of 4 work items, none acked: descriptors 1..=4,
        // i.e. two transmitted plus the next two future timeslices (4, 6)
        assert_eq!(mgr.last_timeslice_before_blockage(0, 4), 6);
        // window exhausted by what was already transmitted
        assert_eq!(mgr.last_timeslice_before_blockage(0, 2), 2);
    }

    #[test]
    fn test_blockage_logging() {
        let mut mgr = manager(1);
        assert_eq!(mgr.log_timeslice_cb_blocked(5, 100, false), 0);
        assert_eq!(mgr.log_timeslice_cb_blocked(5, 350, true), 250);
        // closing without an open record
        assert_eq!(mgr.log_timeslice_cb_blocked(5, 400, true), 0);
    }
}
