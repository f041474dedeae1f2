//! Configuration for the input channel sender.

/// Input channel sender configuration.
///
/// Controls timeslice geometry, credit limits and pacing parameters.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Index of this input node.
    pub input_index: u64,
    /// Number of microslices per timeslice (excluding overlap).
    /// Default: 100
    pub timeslice_size: u32,
    /// Number of trailing microslices shared with the next timeslice.
    /// Default: 1
    pub overlap_size: u32,
    /// Total number of timeslices to transmit.
    pub max_timeslice_number: u64,
    /// Maximum send queue depth per connection.
    /// Default: 495
    pub max_send_wr: u32,
    /// Completion queue depth.
    /// Default: 1_000_000
    pub num_cqe: u32,
    /// Timeslices per compute node per interval.
    /// Default: 100
    pub interval_length: u64,
    /// Pacing rounds per interval.
    /// Default: 10
    pub rounds_per_interval: u64,
    /// Initial per-timeslice duration before the first proposal arrives,
    /// in microseconds. Zero sends as fast as possible.
    /// Default: 0
    pub initial_duration_per_ts_us: u64,
    /// Slack added to an interval deadline after a peer failure, in
    /// microseconds.
    /// Default: 1000
    pub input_gap_us: u64,
    /// Interval between status reports, in microseconds.
    /// Default: 1_000_000
    pub status_interval_us: u64,
    /// Interval between heartbeat messages, in microseconds.
    /// Default: 500_000
    pub heartbeat_interval_us: u64,
    /// CPU core to pin the sender thread to.
    /// Default: None
    pub pin_core: Option<usize>,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            input_index: 0,
            timeslice_size: 100,
            overlap_size: 1,
            max_timeslice_number: u64::MAX,
            max_send_wr: 495,
            num_cqe: 1_000_000,
            interval_length: 100,
            rounds_per_interval: 10,
            initial_duration_per_ts_us: 0,
            input_gap_us: 1000,
            status_interval_us: 1_000_000,
            heartbeat_interval_us: 500_000,
            pin_core: None,
        }
    }
}

impl SenderConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the input node index.
    pub fn with_input_index(mut self, input_index: u64) -> Self {
        self.input_index = input_index;
        self
    }

    /// Set the timeslice size in microslices.
    pub fn with_timeslice_size(mut self, timeslice_size: u32) -> Self {
        self.timeslice_size = timeslice_size;
        self
    }

    /// Set the overlap size in microslices.
    pub fn with_overlap_size(mut self, overlap_size: u32) -> Self {
        self.overlap_size = overlap_size;
        self
    }

    /// Set the total number of timeslices to transmit.
    pub fn with_max_timeslice_number(mut self, max: u64) -> Self {
        self.max_timeslice_number = max;
        self
    }

    /// Set the maximum send queue depth.
    pub fn with_max_send_wr(mut self, max_send_wr: u32) -> Self {
        self.max_send_wr = max_send_wr;
        self
    }

    /// Set the completion queue depth.
    pub fn with_num_cqe(mut self, num_cqe: u32) -> Self {
        self.num_cqe = num_cqe;
        self
    }

    /// Set the interval length in timeslices per compute node.
    pub fn with_interval_length(mut self, interval_length: u64) -> Self {
        self.interval_length = interval_length;
        self
    }

    /// Pin the sender thread to a CPU core.
    pub fn with_pin_core(mut self, core: usize) -> Self {
        self.pin_core = Some(core);
        self
    }

    /// Maximum number of concurrently pending remote writes per
    /// connection.
    ///
    /// Each timeslice costs three work requests (payload write, work-item
    /// write, status receive), and the completion queue is shared across
    /// all compute connections.
    pub fn max_pending_writes(&self, num_compute: usize) -> u32 {
        ((self.max_send_wr - 1) / 3).min((self.num_cqe - 1) / num_compute.max(1) as u32)
    }
}
