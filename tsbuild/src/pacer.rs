//! Compute-side pacing feedback.
//!
//! Each compute node measures when every input's contribution to a
//! timeslice arrives, derives per-interval duration statistics, and
//! proposes the send time of each input's first contribution of the
//! next interval. Proposals travel back to the inputs inside status
//! messages.
//!
//! Clocks are aligned once at startup: every participant records its
//! local time at a shared barrier, and per-input offsets convert input
//! timestamps into the compute node's clock.

use sizedmap::SizedMap;

use crate::wire::IntervalMeta;

/// Completed-timeslice duration records kept per compute node.
const MAX_DURATION_HISTORY: usize = 100;

/// Duration statistics over a trailing window of completed timeslices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationStats {
    /// Mean duration, microseconds.
    pub mean: u64,
    /// Median duration, microseconds.
    pub median: u64,
    /// Mean absolute deviation from the mean, microseconds.
    pub variance: u64,
}

#[derive(Debug)]
struct InputSenderInfo {
    /// Arrival bookkeeping: timeslice -> (sent time in the input's
    /// clock, contribution duration).
    ts_sent_info: SizedMap<u64, (u64, u64)>,
    /// Compute-local minus input-local barrier time.
    clock_offset_us: i64,
    /// Fastest contribution seen from this input.
    min_duration_us: Option<u64>,
}

impl InputSenderInfo {
    fn new() -> Self {
        Self {
            ts_sent_info: SizedMap::new(MAX_DURATION_HISTORY),
            clock_offset_us: 0,
            min_duration_us: None,
        }
    }
}

/// Arrival-time aggregator and proposal generator for one compute node.
pub struct ComputePacer {
    compute_index: u64,
    input_count: u32,
    interval_length: u64,
    stats_window: usize,
    barrier_time_us: u64,
    senders: Vec<InputSenderInfo>,
    ts_duration: SizedMap<u64, u64>,
    ts_duration_stats: SizedMap<u64, DurationStats>,
    acked_count: SizedMap<u64, u32>,
    /// interval -> (taken duration, adjusted per-ts duration)
    interval_durations: SizedMap<u64, (Option<u64>, Option<u64>)>,
    alpha: Vec<f64>,
    min_ts_duration_us: Option<u64>,
    completed_flag: bool,
}

impl ComputePacer {
    /// Create a pacer for compute node `compute_index` receiving from
    /// `input_count` inputs, with `interval_length` timeslices per
    /// compute node per interval and duration statistics over
    /// `stats_window` completed timeslices.
    pub fn new(
        compute_index: u64,
        input_count: u32,
        interval_length: u64,
        stats_window: usize,
    ) -> Self {
        let n = input_count.max(1) as usize;
        Self {
            compute_index,
            input_count: n as u32,
            interval_length: interval_length.max(1),
            stats_window: stats_window.max(1),
            barrier_time_us: 0,
            senders: (0..n).map(|_| InputSenderInfo::new()).collect(),
            ts_duration: SizedMap::new(MAX_DURATION_HISTORY),
            ts_duration_stats: SizedMap::new(MAX_DURATION_HISTORY),
            acked_count: SizedMap::new(MAX_DURATION_HISTORY),
            interval_durations: SizedMap::new(MAX_DURATION_HISTORY),
            alpha: vec![0.0; n],
            min_ts_duration_us: None,
            completed_flag: false,
        }
    }

    /// Record the compute-local time of the startup barrier.
    pub fn set_barrier_time(&mut self, compute_local_us: u64) {
        self.barrier_time_us = compute_local_us;
    }

    /// Record an input's local time at the startup barrier, fixing the
    /// clock offset used to translate its timestamps.
    pub fn init_input_clock(&mut self, input: u32, input_local_us: u64) {
        self.senders[input as usize].clock_offset_us =
            self.barrier_time_us as i64 - input_local_us as i64;
    }

    /// Clock offset of an input (compute-local minus input-local).
    pub fn clock_offset(&self, input: u32) -> i64 {
        self.senders[input as usize].clock_offset_us
    }

    /// Timeslices per interval across all compute nodes.
    #[inline]
    fn ts_per_interval(&self) -> u64 {
        self.interval_length * self.input_count as u64
    }

    /// Interval index containing `ts`.
    #[inline]
    pub fn interval_of(&self, ts: u64) -> u64 {
        ts / self.ts_per_interval()
    }

    /// Record the arrival of input `input`'s contribution to `ts`.
    ///
    /// `sent_time_us` is in the input's clock; `duration_us` is the
    /// contribution's measured transfer duration. Duplicate arrivals are
    /// ignored.
    pub fn add_contribution(&mut self, input: u32, ts: u64, sent_time_us: u64, duration_us: u64) {
        let sender = &mut self.senders[input as usize];
        if !sender.ts_sent_info.add(ts, (sent_time_us, duration_us)) {
            return;
        }
        if sender.min_duration_us.is_none_or(|min| duration_us < min) {
            sender.min_duration_us = Some(duration_us);
        }

        let count = match self.acked_count.get(&ts) {
            Some(count) => {
                let count = count + 1;
                self.acked_count.update(ts, count);
                count
            }
            None => {
                self.acked_count.add(ts, 1);
                1
            }
        };
        if count == self.input_count {
            self.complete_timeslice(ts);
        }
    }

    fn complete_timeslice(&mut self, ts: u64) {
        let total: u64 = self
            .senders
            .iter()
            .filter_map(|s| s.ts_sent_info.get(&ts).map(|(_, dur)| *dur))
            .sum();
        self.ts_duration.add(ts, total);
        if self.min_ts_duration_us.is_none_or(|min| total < min) {
            self.min_ts_duration_us = Some(total);
        }
        self.completed_flag = true;
    }

    /// The newest timeslice with contributions from all inputs.
    pub fn last_complete_ts(&self) -> Option<u64> {
        self.ts_duration.last_key()
    }

    /// Take the new-completion flag.
    pub fn check_new_ts_completed(&mut self) -> bool {
        std::mem::take(&mut self.completed_flag)
    }

    /// Total duration needed to complete `ts`, if it completed.
    pub fn ts_duration(&self, ts: u64) -> Option<u64> {
        self.ts_duration.get(&ts).copied()
    }

    /// Median completion duration over the stats window ending at `ts`.
    pub fn median_ts_duration(&mut self, ts: u64) -> Option<u64> {
        self.stats_data(ts).map(|stats| stats.median)
    }

    /// Duration statistics over the stats window ending at `ts`.
    pub fn stats_data(&mut self, ts: u64) -> Option<DurationStats> {
        if !self.ts_duration.contains(&ts) {
            return None;
        }
        if let Some(stats) = self.ts_duration_stats.get(&ts) {
            return Some(*stats);
        }

        let mut values: Vec<u64> = self
            .ts_duration
            .iter_back_from(ts)
            .take(self.stats_window)
            .map(|(_, dur)| *dur)
            .collect();
        values.sort_unstable();

        let sum: u64 = values.iter().sum();
        let mean = sum / values.len() as u64;
        let median = values[values.len() / 2];
        let variance =
            values.iter().map(|v| v.abs_diff(mean)).sum::<u64>() / values.len() as u64;

        let stats = DurationStats {
            mean,
            median,
            variance,
        };
        self.ts_duration_stats.add(ts, stats);
        Some(stats)
    }

    /// Sum of completion durations over one interval of this node's
    /// timeslices, if the interval completed.
    fn actual_interval_duration(&mut self, interval: u64) -> Option<u64> {
        if let Some((Some(taken), _)) = self.interval_durations.get(&interval) {
            return Some(*taken);
        }
        let start_ts = interval * self.ts_per_interval() + self.compute_index;
        let last_ts = start_ts + self.ts_per_interval();
        if !self.ts_duration.contains(&start_ts) || !self.ts_duration.contains(&last_ts) {
            return None;
        }
        let sum: u64 = self
            .ts_duration
            .range(start_ts, last_ts)
            .map(|(_, dur)| *dur)
            .sum();
        match self.interval_durations.get_mut(&interval) {
            Some(entry) => entry.0 = Some(sum),
            None => {
                self.interval_durations.add(interval, (Some(sum), None));
            }
        }
        Some(sum)
    }

    /// Duration multiplier for the next interval proposal, derived from
    /// the trend of the last two completed intervals.
    fn adjusted_theta(&mut self, interval: u64) -> f64 {
        if interval <= 1 {
            return 0.0;
        }
        let Some(prev) = self.actual_interval_duration(interval - 1) else {
            // previous interval incomplete: no evidence to adjust on
            return 0.0;
        };
        let Some(pre_prev) = self.actual_interval_duration(interval - 2) else {
            return 0.0;
        };
        if prev <= pre_prev { -0.1 } else { 0.1 }
    }

    /// Per-timeslice duration for the interval after the one containing
    /// `ts`, adjusted by theta.
    pub fn adjusted_ts_duration(&mut self, ts: u64) -> Option<u64> {
        if !self.ts_duration.contains(&ts) {
            return None;
        }
        let interval = self.interval_of(ts);
        if let Some((_, Some(adjusted))) = self.interval_durations.get(&(interval + 1)) {
            return Some(*adjusted);
        }

        let theta = self.adjusted_theta(interval);
        let base = match self.min_ts_duration_us {
            Some(min) => min,
            None => self.stats_data(ts)?.median,
        };
        let adjusted = (base as f64 * (1.0 + theta)) as u64;

        match self.interval_durations.get_mut(&(interval + 1)) {
            Some(entry) => entry.1 = Some(adjusted),
            None => {
                self.interval_durations.add(interval + 1, (None, Some(adjusted)));
            }
        }
        Some(adjusted)
    }

    /// Proposed send time (in input `input`'s clock) for that input's
    /// first contribution of the next interval.
    ///
    /// Returns `None` until enough arrivals exist to extrapolate.
    pub fn next_interval_sent_time(&self, input: u32, next_interval_start_ts: u64) -> Option<u64> {
        let n = self.input_count as u64;
        let last_complete = self.last_complete_ts()?;
        let interval_index = last_complete / self.ts_per_interval();
        let current_start = interval_index * self.ts_per_interval() + self.compute_index;
        debug_assert_eq!(
            next_interval_start_ts,
            (interval_index + 1) * self.ts_per_interval() + self.compute_index
        );
        let count_received = (last_complete.checked_sub(current_start)?) / n + 1;
        let count_to_next = (next_interval_start_ts - last_complete) / n - 1;

        let own = (self.compute_index % n) as usize;
        let last_input = ((self.compute_index + n - 1) % n) as usize;

        // first and last arrivals of the current interval, compute clock
        let t_first = {
            let (sent, _) = self.senders[own].ts_sent_info.get(&current_start)?;
            *sent as i64 + self.senders[own].clock_offset_us
        };
        let t_last = {
            let (sent, _) = self.senders[last_input].ts_sent_info.get(&last_complete)?;
            *sent as i64 + self.senders[last_input].clock_offset_us
        };

        let avg_per_ts = (t_last - t_first) / count_received as i64;

        // time gap between this node's first input and input `input`
        let mut gap: u64 = 0;
        let mut j = (self.compute_index % n) as u32;
        while j != input {
            gap += self.senders[j as usize].min_duration_us.unwrap_or(0);
            j = (j + 1) % self.input_count;
        }
        let gap = gap as f64 * (1.0 + self.alpha[input as usize]);

        let proposed = t_last + count_to_next as i64 * avg_per_ts + gap as i64
            - self.senders[input as usize].clock_offset_us;
        Some(proposed.max(0) as u64)
    }

    /// Build the next-interval proposal for `input`, embedded in the
    /// outbound status message.
    pub fn propose_interval(&mut self, input: u32) -> Option<IntervalMeta> {
        let last_complete = self.last_complete_ts()?;
        let per_interval = self.ts_per_interval();
        let next_index = last_complete / per_interval + 1;
        let next_start = next_index * per_interval + self.compute_index;
        let start_time_us = self.next_interval_sent_time(input, next_start)?;
        let adjusted = self.adjusted_ts_duration(last_complete)?;
        Some(IntervalMeta {
            interval_index: next_index,
            start_ts: next_index * per_interval,
            end_ts: (next_index + 1) * per_interval - 1,
            start_time_us,
            duration_us: adjusted * self.interval_length,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two inputs, one compute node (index 0), 4 timeslices per input
    /// per interval -> 8 per interval; this node owns the even ones.
    fn pacer() -> ComputePacer {
        let mut pacer = ComputePacer::new(0, 2, 4, 4);
        pacer.set_barrier_time(1000);
        pacer.init_input_clock(0, 1000); // offset 0
        pacer.init_input_clock(1, 400); // offset +600
        pacer
    }

    #[test]
    fn test_clock_offsets() {
        let pacer = pacer();
        assert_eq!(pacer.clock_offset(0), 0);
        assert_eq!(pacer.clock_offset(1), 600);
    }

    #[test]
    fn test_completion_requires_all_inputs() {
        let mut pacer = pacer();
        pacer.add_contribution(0, 0, 2000, 100);
        assert_eq!(pacer.last_complete_ts(), None);
        assert!(!pacer.check_new_ts_completed());

        pacer.add_contribution(1, 0, 1500, 140);
        assert_eq!(pacer.last_complete_ts(), Some(0));
        assert!(pacer.check_new_ts_completed());
        assert_eq!(pacer.ts_duration(0), Some(240));

        // duplicate arrival changes nothing
        pacer.add_contribution(1, 0, 9999, 1);
        assert_eq!(pacer.ts_duration(0), Some(240));
    }

    #[test]
    fn test_stats_window() {
        let mut pacer = pacer();
        for (i, dur) in [(0u64, 100u64), (2, 300), (4, 200), (6, 400)] {
            pacer.add_contribution(0, i, 1000 + i * 10, dur);
            pacer.add_contribution(1, i, 1000 + i * 10, 0);
        }
        let stats = pacer.stats_data(6).unwrap();
        assert_eq!(stats.mean, 250);
        // sorted [100, 200, 300, 400], median = values[2]
        assert_eq!(stats.median, 300);
        // deviations 150, 50, 50, 150 -> 100
        assert_eq!(stats.variance, 100);
    }

    #[test]
    fn test_next_interval_sent_time() {
        let mut pacer = pacer();
        // complete this node's timeslices 0, 2, 4, 6 of interval 0
        // input 0 sends at t = 2000 + 500 * (ts / 2)
        for ts in [0u64, 2, 4, 6] {
            pacer.add_contribution(0, ts, 2000 + 250 * ts, 100);
            pacer.add_contribution(1, ts, 1500 + 250 * ts, 150);
        }
        assert_eq!(pacer.last_complete_ts(), Some(6));

        // current interval start = 0; 4 received; next start = 8;
        // count_to_next = (8 - 6) / 2 - 1 = 0
        // t_first = sent[0][0] + 0 = 2000
        // t_last = sent[1][6] + 600 = 1500 + 1500 + 600 = 3600
        // avg = (3600 - 2000) / 4 = 400
        // gap for input 0: empty walk -> 0
        let proposed = pacer.next_interval_sent_time(0, 8).unwrap();
        assert_eq!(proposed, 3600);

        // gap for input 1: min_duration[0] = 100, offset 600
        let proposed = pacer.next_interval_sent_time(1, 8).unwrap();
        assert_eq!(proposed, 3600 + 100 - 600);
    }

    #[test]
    fn test_theta_neutral_without_history() {
        let mut pacer = pacer();
        for ts in [0u64, 2, 4, 6] {
            pacer.add_contribution(0, ts, 2000, 100);
            pacer.add_contribution(1, ts, 1500, 100);
        }
        // interval 0: theta must be 0, adjusted = min duration
        assert_eq!(pacer.adjusted_ts_duration(6), Some(200));
    }

    #[test]
    fn test_proposal_meta() {
        let mut pacer = pacer();
        for ts in [0u64, 2, 4, 6] {
            pacer.add_contribution(0, ts, 2000 + 250 * ts, 100);
            pacer.add_contribution(1, ts, 1500 + 250 * ts, 150);
        }
        let meta = pacer.propose_interval(0).unwrap();
        assert_eq!(meta.interval_index, 1);
        assert_eq!(meta.start_ts, 8);
        assert_eq!(meta.end_ts, 15);
        assert_eq!(meta.start_time_us, 3600);
        // adjusted per-ts duration 250 (min total), 4 ts per node
        assert_eq!(meta.duration_us, 250 * 4);
    }
}
