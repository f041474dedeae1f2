//! Per-interval runtime state and the round pacing law.
//!
//! An interval is a run of `interval_length × n_compute` timeslices over
//! which pacing is negotiated. The interval partitions into a fixed
//! number of rounds; the sender defers between sends so that the interval
//! finishes close to the proposed deadline, speeding up when behind and
//! slowing down when ahead.

use crate::wire::IntervalMeta;

/// Ack percentage (in percent) that must be reached before an interval
/// counts as complete, and below which a missed deadline forces
/// full-speed sending.
const ACK_THRESHOLD_PERCENT: u64 = 70;

/// Accumulator for time spent blocked on one kind of backpressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockedTimer {
    since_us: Option<u64>,
    total_us: u64,
}

impl BlockedTimer {
    /// Start the timer if not already running.
    pub fn begin(&mut self, now_us: u64) {
        if self.since_us.is_none() {
            self.since_us = Some(now_us);
        }
    }

    /// Stop the timer and accumulate the blocked duration.
    pub fn end(&mut self, now_us: u64) {
        if let Some(since) = self.since_us.take() {
            self.total_us += now_us.saturating_sub(since);
        }
    }

    /// Total accumulated blocked time in microseconds.
    pub fn total_us(&self) -> u64 {
        self.total_us
    }
}

/// Runtime state of one pacing interval on the input side.
#[derive(Debug, Clone)]
pub struct IntervalInfo {
    /// Interval index.
    pub index: u64,
    /// First timeslice of the interval.
    pub start_ts: u64,
    /// Last timeslice of the interval (inclusive).
    pub end_ts: u64,
    /// Proposed start time, microseconds.
    pub proposed_start_time_us: u64,
    /// Proposed duration, microseconds.
    pub proposed_duration_us: u64,
    /// Actual start time, set when the first timeslice is sent.
    pub actual_start_time_us: Option<u64>,
    /// Timeslices sent so far.
    pub count_sent_ts: u64,
    /// Timeslices acknowledged so far.
    pub count_acked_ts: u64,
    /// Time blocked on producer underrun.
    pub ib_blocked: BlockedTimer,
    /// Time blocked on peer buffer space.
    pub cb_blocked: BlockedTimer,
    /// Time blocked on the in-flight write limit.
    pub mr_blocked: BlockedTimer,
    duration_per_ts_us: u64,
    duration_per_round_us: u64,
    num_ts_per_round: u64,
    rounds: u64,
}

impl IntervalInfo {
    /// Create runtime state for an interval with the given geometry and
    /// proposal, partitioned into `rounds` pacing rounds.
    pub fn new(meta: &IntervalMeta, rounds: u64) -> Self {
        let rounds = rounds.max(1);
        let mut info = Self {
            index: meta.interval_index,
            start_ts: meta.start_ts,
            end_ts: meta.end_ts,
            proposed_start_time_us: meta.start_time_us,
            proposed_duration_us: meta.duration_us,
            actual_start_time_us: None,
            count_sent_ts: 0,
            count_acked_ts: 0,
            ib_blocked: BlockedTimer::default(),
            cb_blocked: BlockedTimer::default(),
            mr_blocked: BlockedTimer::default(),
            duration_per_ts_us: 0,
            duration_per_round_us: 0,
            num_ts_per_round: 0,
            rounds,
        };
        info.init_statistics();
        info
    }

    fn init_statistics(&mut self) {
        let count = self.ts_count();
        self.duration_per_ts_us = self.proposed_duration_us / count;
        self.duration_per_round_us = self.proposed_duration_us / self.rounds;
        // integer division can round to zero for short intervals; a zero
        // round would leave the round index undefined
        self.num_ts_per_round = (count / self.rounds).max(1);
    }

    /// Number of timeslices in the interval.
    #[inline]
    pub fn ts_count(&self) -> u64 {
        self.end_ts - self.start_ts + 1
    }

    /// Check whether `ts` belongs to this interval.
    #[inline]
    pub fn contains(&self, ts: u64) -> bool {
        (self.start_ts..=self.end_ts).contains(&ts)
    }

    /// Record the start of the interval if not yet started.
    pub fn start(&mut self, now_us: u64) {
        if self.actual_start_time_us.is_none() {
            self.actual_start_time_us = Some(now_us);
        }
    }

    /// Record one sent timeslice.
    pub fn on_sent(&mut self) {
        self.count_sent_ts += 1;
    }

    /// Record one acknowledged timeslice.
    pub fn on_acked(&mut self) {
        self.count_acked_ts += 1;
    }

    /// Extend the proposed deadline, absorbing failure stragglers.
    pub fn extend_deadline(&mut self, gap_us: u64) {
        self.proposed_duration_us += gap_us;
    }

    /// Number of timeslices that should have been sent by `now_us` to be
    /// on the proposed schedule.
    pub fn expected_sent_ts(&self, now_us: u64) -> u64 {
        if self.duration_per_ts_us == 0 {
            return self.ts_count();
        }
        let Some(start) = self.actual_start_time_us else {
            return 0;
        };
        now_us.saturating_sub(start) / self.duration_per_ts_us
    }

    /// Deferral before the next send, in microseconds.
    ///
    /// Zero means fire immediately. The schedule is monotone
    /// nondecreasing relative to the actual start time.
    pub fn duration_to_next_round(&self, now_us: u64) -> u64 {
        if self.duration_per_ts_us == 0 {
            return 0;
        }
        // past the proposed finish without the ack threshold: catch up at
        // full speed
        if !self.is_ack_percentage_reached()
            && self.proposed_start_time_us + self.proposed_duration_us < now_us
        {
            return 0;
        }

        let expected = self.expected_sent_ts(now_us);

        if expected == self.count_sent_ts {
            return self.duration_per_round_us;
        }
        if expected < self.count_sent_ts {
            // ahead of schedule
            return self.duration_per_round_us
                + (self.count_sent_ts - expected - 1) * self.duration_per_ts_us;
        }
        if expected - self.count_sent_ts >= self.num_ts_per_round {
            // a full round behind
            return 0;
        }
        self.duration_per_round_us - (expected - self.count_sent_ts) * self.duration_per_ts_us
    }

    /// Round index the schedule expects to be in at `now_us`.
    pub fn current_round_index(&self, now_us: u64) -> u64 {
        self.expected_sent_ts(now_us) / self.num_ts_per_round
    }

    /// Check whether `ts` may be sent within the current round.
    pub fn is_ts_within_current_round(&self, ts: u64, now_us: u64) -> bool {
        let round_end =
            self.start_ts + (self.current_round_index(now_us) + 1) * self.num_ts_per_round;
        ts <= round_end && ts <= self.end_ts
    }

    /// Check whether all timeslices of the interval have been sent.
    ///
    /// Retransmissions after a peer failure count again, so the
    /// comparison must not be exact.
    #[inline]
    pub fn is_sent_completed(&self) -> bool {
        self.count_sent_ts >= self.ts_count()
    }

    /// Check whether the ack threshold has been reached.
    #[inline]
    pub fn is_ack_percentage_reached(&self) -> bool {
        self.count_acked_ts * 100 >= self.ts_count() * ACK_THRESHOLD_PERCENT
    }

    /// Interval completion: everything sent and the ack threshold met.
    #[inline]
    pub fn is_completed(&self) -> bool {
        self.is_sent_completed() && self.is_ack_percentage_reached()
    }

    /// Build the actual interval metadata reported back to compute nodes.
    ///
    /// Returns `None` until the interval has started.
    pub fn actual_meta(&self, now_us: u64) -> Option<IntervalMeta> {
        let start = self.actual_start_time_us?;
        Some(IntervalMeta {
            interval_index: self.index,
            start_ts: self.start_ts,
            end_ts: self.end_ts,
            start_time_us: start,
            duration_us: now_us.saturating_sub(start),
        })
    }
}
