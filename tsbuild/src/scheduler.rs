//! Input-side interval scheduler.
//!
//! Tracks one [`IntervalInfo`] per interval of timeslices, ingests
//! proposed interval metadata from compute nodes, paces sends via the
//! round law, and emits actual interval metadata once an interval
//! completes.

use sizedmap::SizedMap;

use crate::interval::IntervalInfo;
use crate::wire::IntervalMeta;

/// Number of interval records kept for reporting.
const INTERVAL_HISTORY: usize = 200;

/// Closed-loop pacing controller for one input channel.
pub struct IntervalScheduler {
    compute_count: u32,
    interval_length: u64,
    rounds_per_interval: u64,
    initial_duration_per_ts_us: u64,
    begin_time_us: u64,
    intervals: SizedMap<u64, IntervalInfo>,
    proposed: SizedMap<u64, IntervalMeta>,
    actual: SizedMap<u64, IntervalMeta>,
}

impl IntervalScheduler {
    /// Create a scheduler for `compute_count` connections with
    /// `interval_length` timeslices per compute node per interval.
    pub fn new(
        compute_count: u32,
        interval_length: u64,
        rounds_per_interval: u64,
        initial_duration_per_ts_us: u64,
    ) -> Self {
        Self {
            compute_count: compute_count.max(1),
            interval_length: interval_length.max(1),
            rounds_per_interval,
            initial_duration_per_ts_us,
            begin_time_us: 0,
            intervals: SizedMap::new(INTERVAL_HISTORY),
            proposed: SizedMap::new(INTERVAL_HISTORY),
            actual: SizedMap::new(INTERVAL_HISTORY),
        }
    }

    /// Update the compute connection count (only before interval 0 is
    /// created).
    pub fn update_compute_count(&mut self, compute_count: u32) {
        if self.intervals.is_empty() {
            self.compute_count = compute_count.max(1);
        }
    }

    /// Record the sender start time and create the first interval.
    pub fn set_begin_time(&mut self, now_us: u64) {
        self.begin_time_us = now_us;
        self.ensure_interval(0);
    }

    /// Timeslices per interval across all compute nodes.
    #[inline]
    pub fn ts_per_interval(&self) -> u64 {
        self.interval_length * self.compute_count as u64
    }

    /// Interval index containing `ts`.
    #[inline]
    pub fn interval_of(&self, ts: u64) -> u64 {
        ts / self.ts_per_interval()
    }

    /// Ingest a proposed interval metadata record from a compute node.
    ///
    /// The first proposal for an interval wins; a proposal for an
    /// already-started interval is ignored.
    pub fn add_proposed_meta_data(&mut self, meta: IntervalMeta) {
        let index = meta.interval_index;
        if !self.proposed.add(index, meta) {
            return;
        }
        if let Some(info) = self.intervals.get_mut(&index)
            && info.actual_start_time_us.is_none()
        {
            info.proposed_start_time_us = meta.start_time_us;
            info.proposed_duration_us = meta.duration_us;
        }
    }

    /// Actual metadata of a completed interval, if available.
    pub fn get_actual_meta_data(&self, index: u64) -> Option<&IntervalMeta> {
        self.actual.get(&index)
    }

    /// The most recently completed interval's actual metadata.
    pub fn latest_actual(&self) -> Option<&IntervalMeta> {
        self.actual.last_key().and_then(|k| self.actual.get(&k))
    }

    /// Greatest timeslice the sender may currently work on.
    ///
    /// Always leaves one interval of headroom past the newest known
    /// interval so progress never stalls waiting for a proposal.
    pub fn last_timeslice_to_send(&self) -> u64 {
        let known = self
            .intervals
            .last_key()
            .into_iter()
            .chain(self.proposed.last_key())
            .max()
            .unwrap_or(0);
        (known + 2) * self.ts_per_interval() - 1
    }

    /// Runtime state of the interval containing `ts`, creating it on
    /// first use.
    pub fn interval_info(&mut self, ts: u64) -> &mut IntervalInfo {
        let index = self.interval_of(ts);
        self.ensure_interval(index);
        self.intervals.get_mut(&index).unwrap()
    }

    fn ensure_interval(&mut self, index: u64) {
        if self.intervals.contains(&index) {
            return;
        }
        let per_interval = self.ts_per_interval();
        let meta = match self.proposed.get(&index) {
            Some(meta) => *meta,
            None => {
                // no proposal yet: inherit the previous interval's
                // duration, or pace by the configured initial rate
                let duration_us = index
                    .checked_sub(1)
                    .and_then(|prev| self.intervals.get(&prev))
                    .map(|prev| prev.proposed_duration_us)
                    .unwrap_or(per_interval * self.initial_duration_per_ts_us);
                IntervalMeta {
                    interval_index: index,
                    start_ts: index * per_interval,
                    end_ts: (index + 1) * per_interval - 1,
                    start_time_us: self.begin_time_us,
                    duration_us,
                }
            }
        };
        self.intervals
            .add(index, IntervalInfo::new(&meta, self.rounds_per_interval));
    }

    /// Record a sent timeslice; starts its interval on first send and
    /// emits actual metadata on completion.
    pub fn on_sent(&mut self, ts: u64, now_us: u64) {
        let info = self.interval_info(ts);
        info.start(now_us);
        info.on_sent();
        self.check_completed(ts, now_us);
    }

    /// Record an acknowledged timeslice.
    pub fn on_acked(&mut self, ts: u64, now_us: u64) {
        let index = self.interval_of(ts);
        if let Some(info) = self.intervals.get_mut(&index) {
            info.on_acked();
        }
        self.check_completed(ts, now_us);
    }

    fn check_completed(&mut self, ts: u64, now_us: u64) {
        let index = self.interval_of(ts);
        if self.actual.contains(&index) {
            return;
        }
        if let Some(info) = self.intervals.get(&index)
            && info.is_completed()
            && let Some(meta) = info.actual_meta(now_us)
        {
            self.actual.add(index, meta);
        }
    }

    /// Absolute time at which the next timeslice send should fire.
    pub fn next_fire_time(&mut self, next_ts: u64, now_us: u64) -> u64 {
        let info = self.interval_info(next_ts);
        if info.actual_start_time_us.is_none() {
            // first send of the interval is never deferred
            return now_us;
        }
        now_us + info.duration_to_next_round(now_us)
    }

    /// Extend the deadline of the newest started, uncompleted interval
    /// after a peer failure.
    pub fn extend_current_deadline(&mut self, gap_us: u64) {
        let mut target = None;
        for (index, info) in self.intervals.iter() {
            if info.actual_start_time_us.is_some() && !info.is_completed() {
                target = Some(*index);
            }
        }
        if let Some(index) = target
            && let Some(info) = self.intervals.get_mut(&index)
        {
            info.extend_deadline(gap_us);
        }
    }
}
