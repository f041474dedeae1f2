//! Input channel sender: the per-input event loop.
//!
//! An `InputChannelSender` owns an input buffer (filled by an external
//! producer) and a group of timeslice building connections to compute
//! nodes. It paces timeslice transmissions per the interval scheduler,
//! builds wrap-aware gather lists over the descriptor and data rings,
//! dispatches completions by work-request id, collapses out-of-order
//! acknowledgments, and lazily publishes the producer read index.
//!
//! The loop is single-threaded and cooperative: every operation is
//! non-blocking, and transient conditions (producer underrun, peer
//! backpressure) simply yield the current iteration.

use std::collections::VecDeque;
use std::io;

use dualring::{AckRing, DualIndex, InputBufferSource, MICROSLICE_DESCRIPTOR_SIZE};

use crate::config::SenderConfig;
use crate::connection::{ComputeNodeConnection, ConnectionState};
use crate::error::{Error, Result};
use crate::failure::{FailedNodeInfo, FailureBridge, FailureOracle};
use crate::manager::TimesliceManager;
use crate::scheduler::IntervalScheduler;
use crate::timing::TimerQueue;
use crate::transport::{
    AccessFlags, Completion, CompletionStatus, ConnectionEvent, MemoryRegion, RemoteWriteTransport,
    RequestKind, Segment, wr_id_connection, wr_id_timeslice,
};
use crate::wire::TIMESLICE_COMPONENT_SIZE;

/// Scheduled event-loop callbacks.
enum TimerAction {
    ReportStatus,
    SyncBufferPositions,
    Heartbeat,
}

/// Snapshot of one send buffer's cursor relations.
///
/// The four regions tile the buffer: `used` (written, not yet sent),
/// `sending` (sent, not yet acknowledged), `freeing` (acknowledged, not
/// yet published to the producer) and `unused`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendBufferStatus {
    /// Buffer size in elements.
    pub size: u64,
    /// Read index last published to the producer.
    pub cached_acked: u64,
    /// Acknowledged low-water mark.
    pub acked: u64,
    /// Sent high-water mark.
    pub sent: u64,
    /// Producer high-water mark.
    pub written: u64,
}

impl SendBufferStatus {
    /// Elements written but not yet sent.
    pub fn used(&self) -> u64 {
        self.written - self.sent
    }

    /// Elements sent but not yet acknowledged.
    pub fn sending(&self) -> u64 {
        self.sent - self.acked
    }

    /// Elements acknowledged but not yet published.
    pub fn freeing(&self) -> u64 {
        self.acked - self.cached_acked
    }

    /// Free elements.
    pub fn unused(&self) -> u64 {
        self.cached_acked + self.size - self.written
    }

    fn percentage(&self, value: u64) -> f32 {
        value as f32 / self.size as f32
    }

    /// The four regions as percentages, `used/sending/freeing/free`.
    pub fn percentages(&self) -> String {
        format!(
            "{:4.1}% {:4.1}% {:4.1}% {:4.1}%",
            self.percentage(self.used()) * 100.0,
            self.percentage(self.sending()) * 100.0,
            self.percentage(self.freeing()) * 100.0,
            self.percentage(self.unused()) * 100.0,
        )
    }
}

/// Gather list for one timeslice write: at most two descriptor segments
/// followed by at most two data segments.
struct GatherList {
    segments: [Segment; 4],
    len: usize,
    num_desc_segments: usize,
}

/// Input buffer and compute node connection container.
pub struct InputChannelSender<T: RemoteWriteTransport, S: InputBufferSource> {
    cfg: SenderConfig,
    transport: T,
    data_source: S,
    peers: Vec<String>,
    conn: Vec<ComputeNodeConnection>,
    manager: TimesliceManager,
    scheduler: IntervalScheduler,
    bridge: FailureBridge,
    timers: TimerQueue<TimerAction>,
    ack: AckRing,
    mr_desc: Option<MemoryRegion>,
    mr_data: Option<MemoryRegion>,
    next_timeslice: u64,
    pending_resend: VecDeque<u64>,
    write_index_desc: u64,
    sent_desc: u64,
    sent_data: u64,
    acked_desc: u64,
    acked_data: u64,
    cached_acked_desc: u64,
    cached_acked_data: u64,
    min_acked_desc: u64,
    min_acked_data: u64,
    next_fire_us: u64,
    abort: bool,
    all_done: bool,
    connections_done: usize,
    connected: usize,
    begin: minstant::Instant,
    last_status: Option<(SendBufferStatus, SendBufferStatus)>,
    completions: Vec<Completion>,
    events: Vec<ConnectionEvent>,
}

impl<T: RemoteWriteTransport, S: InputBufferSource> InputChannelSender<T, S> {
    /// Create a sender for the given compute node addresses.
    pub fn new(cfg: SenderConfig, transport: T, data_source: S, peers: Vec<String>) -> Self {
        let max_pending_writes = cfg.max_pending_writes(peers.len());
        let conn: Vec<ComputeNodeConnection> = (0..peers.len())
            .map(|i| ComputeNodeConnection::new(i as u16, cfg.input_index as u16, max_pending_writes))
            .collect();

        let desc_size = data_source.desc_buffer().size();
        let data_bytes = data_source.data_buffer().bytes();
        let ack_capacity = (desc_size / cfg.timeslice_size as u64 + 1) as usize;

        let manager = TimesliceManager::new(peers.len() as u32, cfg.interval_length);
        let scheduler = IntervalScheduler::new(
            peers.len() as u32,
            cfg.interval_length,
            cfg.rounds_per_interval,
            cfg.initial_duration_per_ts_us,
        );

        Self {
            transport,
            peers,
            conn,
            manager,
            scheduler,
            bridge: FailureBridge::new(),
            timers: TimerQueue::new(),
            ack: AckRing::with_capacity(ack_capacity),
            mr_desc: None,
            mr_data: None,
            next_timeslice: 0,
            pending_resend: VecDeque::new(),
            write_index_desc: 0,
            sent_desc: 0,
            sent_data: 0,
            acked_desc: 0,
            acked_data: 0,
            cached_acked_desc: 0,
            cached_acked_data: 0,
            min_acked_desc: desc_size / 4,
            min_acked_data: data_bytes / 4,
            next_fire_us: 0,
            abort: false,
            all_done: false,
            connections_done: 0,
            connected: 0,
            begin: minstant::Instant::now(),
            last_status: None,
            completions: Vec::new(),
            events: Vec::new(),
            data_source,
            cfg,
        }
    }

    /// Microseconds since sender construction.
    pub fn now_us(&self) -> u64 {
        self.begin.elapsed().as_micros() as u64
    }

    /// The acknowledged descriptor low-water mark.
    pub fn acked_desc(&self) -> u64 {
        self.acked_desc
    }

    /// The acknowledged data low-water mark.
    pub fn acked_data(&self) -> u64 {
        self.acked_data
    }

    /// The next sequential timeslice to transmit.
    pub fn next_timeslice(&self) -> u64 {
        self.next_timeslice
    }

    /// Whether every connection confirmed teardown.
    pub fn all_done(&self) -> bool {
        self.all_done
    }

    /// Whether an abort was requested.
    pub fn aborted(&self) -> bool {
        self.abort
    }

    /// A connection by index.
    pub fn connection(&self, index: u16) -> &ComputeNodeConnection {
        &self.conn[index as usize]
    }

    /// The input buffer source.
    pub fn data_source(&self) -> &S {
        &self.data_source
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable access to the underlying transport.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The timeslice manager.
    pub fn manager(&mut self) -> &mut TimesliceManager {
        &mut self.manager
    }

    /// The most recent status report (descriptor ring, data ring).
    pub fn send_buffer_status(&self) -> Option<(SendBufferStatus, SendBufferStatus)> {
        self.last_status
    }

    /// Initiate connection requests to all compute node targets.
    pub fn connect(&mut self) -> Result<()> {
        for i in 0..self.conn.len() {
            let peer = self.peers[i].clone();
            self.conn[i].connect(&mut self.transport, &peer)?;
        }
        Ok(())
    }

    /// Number of established connections.
    pub fn connected(&self) -> usize {
        self.connected
    }

    /// Drain and dispatch connection management events.
    pub fn poll_cm_events(&mut self) -> Result<()> {
        let mut events = std::mem::take(&mut self.events);
        self.transport.poll_events(&mut events);
        for event in events.drain(..) {
            match event {
                ConnectionEvent::Established { connection, remote } => {
                    self.register_memory_regions()?;
                    self.conn[connection as usize]
                        .on_established(&mut self.transport, remote)?;
                    self.connected += 1;
                }
                ConnectionEvent::Rejected { connection } => {
                    let cn = connection as usize;
                    if !self.conn[cn].on_rejected() {
                        return Err(Error::PeerUnreachable(connection));
                    }
                    eprintln!(
                        "[i{}] connection {} rejected, retrying",
                        self.cfg.input_index, connection
                    );
                    let peer = self.peers[cn].clone();
                    self.conn[cn].connect(&mut self.transport, &peer)?;
                }
                ConnectionEvent::Disconnected { connection } => {
                    self.conn[connection as usize].on_disconnected();
                    self.connected = self.connected.saturating_sub(1);
                }
            }
        }
        self.events = events;
        Ok(())
    }

    fn register_memory_regions(&mut self) -> io::Result<()> {
        if self.mr_data.is_none() {
            let data = self.data_source.data_send_buffer();
            self.mr_data = Some(self.transport.register_memory(
                data.ptr() as u64,
                data.bytes() as usize,
                AccessFlags::LOCAL_WRITE,
            )?);
            let desc = self.data_source.desc_send_buffer();
            self.mr_desc = Some(self.transport.register_memory(
                desc.ptr() as u64,
                desc.bytes() as usize,
                AccessFlags::LOCAL_WRITE,
            )?);
        }
        Ok(())
    }

    fn release_memory_regions(&mut self) {
        if let Some(mr) = self.mr_desc.take() {
            let _ = self.transport.close_region(mr);
        }
        if let Some(mr) = self.mr_data.take() {
            let _ = self.transport.close_region(mr);
        }
    }

    /// Start the event loop bookkeeping at `now_us` and arm the
    /// periodic callbacks.
    pub fn start(&mut self, now_us: u64) {
        self.scheduler.set_begin_time(now_us);
        self.timers.add(TimerAction::SyncBufferPositions, now_us);
        self.timers
            .add(TimerAction::ReportStatus, now_us + self.cfg.status_interval_us);
        self.timers
            .add(TimerAction::Heartbeat, now_us + self.cfg.heartbeat_interval_us);
        self.next_fire_us = now_us;
    }

    /// Whether the send phase still has work.
    pub fn sending_active(&self) -> bool {
        !self.abort
            && (!self.pending_resend.is_empty()
                || self.next_timeslice < self.cfg.max_timeslice_number)
    }

    /// One event-loop iteration at an explicit timestamp.
    pub fn tick(&mut self, now_us: u64, oracle: &mut dyn FailureOracle) -> Result<()> {
        if self.sending_active() && now_us >= self.next_fire_us {
            if let Some(ts) = self.next_to_send()
                && self.try_send_timeslice(ts, now_us)?
            {
                self.consume_sent(ts);
                self.scheduler.on_sent(ts, now_us);
                if let Some(next) = self.next_to_send() {
                    self.next_fire_us = self.scheduler.next_fire_time(next, now_us);
                }
            }
        }
        self.poll_completion()?;
        self.data_source.proceed();
        self.timer(now_us)?;
        self.poll_failures(oracle);
        Ok(())
    }

    fn next_to_send(&self) -> Option<u64> {
        if let Some(ts) = self.pending_resend.front() {
            return Some(*ts);
        }
        let ts = self.next_timeslice;
        (ts < self.cfg.max_timeslice_number && ts <= self.scheduler.last_timeslice_to_send())
            .then_some(ts)
    }

    fn consume_sent(&mut self, ts: u64) {
        if self.pending_resend.front() == Some(&ts) {
            self.pending_resend.pop_front();
        } else {
            self.next_timeslice += 1;
        }
    }

    fn poll_failures(&mut self, oracle: &mut dyn FailureOracle) {
        if let Some((connection, moved)) = self.bridge.poll(
            oracle,
            &mut self.manager,
            &mut self.scheduler,
            self.cfg.input_gap_us,
        ) {
            self.conn[connection as usize].mark_failed();
            self.pending_resend.extend(moved);
        }
    }

    /// Declare a connection failed after a fabric-level error, pulling
    /// its in-flight work back for redistribution.
    fn handle_connection_failure(&mut self, connection: u16) -> Result<()> {
        let trigger = self.manager.last_rdma_acked_timeslice(connection);
        let moved = self.manager.consider_reschedule_decision(
            FailedNodeInfo {
                connection,
                trigger_timeslice: trigger,
            },
            self.bridge.timeout_connections(),
        );
        self.scheduler.extend_current_deadline(self.cfg.input_gap_us);
        self.conn[connection as usize].mark_failed();
        self.pending_resend.extend(moved);
        if self.conn.iter().all(|c| c.state() == ConnectionState::Failed) {
            return Err(Error::PeerFailure(connection));
        }
        Ok(())
    }

    /// Attempt to transmit one timeslice. Returns false on producer
    /// underrun or peer backpressure.
    pub fn try_send_timeslice(&mut self, timeslice: u64, now_us: u64) -> Result<bool> {
        let desc_offset = timeslice * self.cfg.timeslice_size as u64;
        let desc_length = (self.cfg.timeslice_size + self.cfg.overlap_size) as u64;

        // wait until the complete timeslice is available in the buffer
        if self.write_index_desc < desc_offset + desc_length {
            self.write_index_desc = self.data_source.get_write_index().desc;
        }
        if self.write_index_desc < desc_offset + desc_length {
            self.manager.log_timeslice_ib_blocked(timeslice, now_us, false);
            return Ok(false);
        }

        let desc = self.data_source.desc_buffer();
        let data_offset = desc.at(desc_offset).offset;
        let last = desc.at(desc_offset + desc_length - 1);
        let data_end = last.offset + last.size as u64;
        if data_end < data_offset {
            return Err(Error::InvariantBreach("descriptor offsets not monotone"));
        }
        let data_length = data_end - data_offset;
        let mut total_length = TIMESLICE_COMPONENT_SIZE as u64
            + data_length
            + desc_length * MICROSLICE_DESCRIPTOR_SIZE as u64;

        let cn = self.manager.owner_of(timeslice);
        let conn = &self.conn[cn as usize];
        if conn.state() != ConnectionState::Established {
            return Ok(false);
        }
        if !conn.write_request_available() {
            self.manager.log_timeslice_mr_blocked(timeslice, now_us, false);
            return Ok(false);
        }

        let skip = conn.skip_required(total_length);
        total_length += skip;

        if !conn.check_for_buffer_space(total_length, 1) {
            self.manager.log_timeslice_cb_blocked(timeslice, now_us, false);
            return Ok(false);
        }

        self.post_send_data(timeslice, cn, desc_offset, desc_length, data_offset, data_length, skip)?;
        self.conn[cn as usize].inc_write_pointers(total_length, 1);
        self.manager.mark_transmitted(cn, timeslice, total_length, now_us);
        self.manager.log_timeslice_ib_blocked(timeslice, now_us, true);
        self.manager.log_timeslice_cb_blocked(timeslice, now_us, true);
        self.manager.log_timeslice_mr_blocked(timeslice, now_us, true);

        self.sent_desc = self.sent_desc.max(desc_offset + desc_length);
        self.sent_data = self.sent_data.max(data_end);
        Ok(true)
    }

    /// Build the wrap-aware gather list for one timeslice.
    ///
    /// One or two descriptor segments followed by zero, one or two data
    /// segments, depending on whether each range crosses its ring
    /// boundary.
    fn build_gather_list(
        &self,
        desc_offset: u64,
        desc_length: u64,
        data_offset: u64,
        data_length: u64,
    ) -> GatherList {
        let desc_lkey = self.mr_desc.map(|mr| mr.lkey).unwrap_or(0);
        let data_lkey = self.mr_data.map(|mr| mr.lkey).unwrap_or(0);
        let desc_ring = self.data_source.desc_send_buffer();
        let data_ring = self.data_source.data_send_buffer();
        let desc_ptr = desc_ring.ptr() as u64;
        let data_ptr = data_ring.ptr() as u64;
        let md = MICROSLICE_DESCRIPTOR_SIZE as u64;

        let mut segments = [Segment { addr: 0, len: 0, lkey: 0 }; 4];
        let mut n = 0;

        if desc_ring.is_contiguous(desc_offset, desc_length) {
            segments[n] = Segment {
                addr: desc_ptr + (desc_offset & desc_ring.size_mask()) * md,
                len: desc_length * md,
                lkey: desc_lkey,
            };
            n += 1;
        } else {
            let first = desc_ring.size() - (desc_offset & desc_ring.size_mask());
            segments[n] = Segment {
                addr: desc_ptr + (desc_offset & desc_ring.size_mask()) * md,
                len: first * md,
                lkey: desc_lkey,
            };
            n += 1;
            segments[n] = Segment {
                addr: desc_ptr,
                len: (desc_length - first) * md,
                lkey: desc_lkey,
            };
            n += 1;
        }
        let num_desc_segments = n;

        if data_length > 0 {
            if data_ring.is_contiguous(data_offset, data_length) {
                segments[n] = Segment {
                    addr: data_ptr + (data_offset & data_ring.size_mask()),
                    len: data_length,
                    lkey: data_lkey,
                };
                n += 1;
            } else {
                let first = data_ring.size() - (data_offset & data_ring.size_mask());
                segments[n] = Segment {
                    addr: data_ptr + (data_offset & data_ring.size_mask()),
                    len: first,
                    lkey: data_lkey,
                };
                n += 1;
                segments[n] = Segment {
                    addr: data_ptr,
                    len: data_length - first,
                    lkey: data_lkey,
                };
                n += 1;
            }
        }

        GatherList {
            segments,
            len: n,
            num_desc_segments,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn post_send_data(
        &mut self,
        timeslice: u64,
        cn: u16,
        desc_offset: u64,
        desc_length: u64,
        data_offset: u64,
        data_length: u64,
        skip: u64,
    ) -> Result<()> {
        let gather = self.build_gather_list(desc_offset, desc_length, data_offset, data_length);

        // stage the segments into the send regions where they differ
        // from the producer rings
        let md = MICROSLICE_DESCRIPTOR_SIZE as u64;
        let desc_ptr = self.data_source.desc_send_buffer().ptr() as u64;
        let data_ptr = self.data_source.data_send_buffer().ptr() as u64;
        for (i, segment) in gather.segments[..gather.len].iter().enumerate() {
            if i < gather.num_desc_segments {
                self.data_source
                    .copy_to_desc_send_buffer((segment.addr - desc_ptr) / md, segment.len / md);
            } else {
                self.data_source
                    .copy_to_data_send_buffer(segment.addr - data_ptr, segment.len);
            }
        }

        self.conn[cn as usize].send_data(
            &mut self.transport,
            &gather.segments[..gather.len],
            timeslice,
            desc_length,
            data_length,
            skip,
        )
    }

    /// Drain and dispatch transport completions.
    pub fn poll_completion(&mut self) -> Result<()> {
        let mut completions = std::mem::take(&mut self.completions);
        loop {
            self.transport.poll_completions(&mut completions);
            if completions.is_empty() {
                break;
            }
            for completion in completions.drain(..) {
                self.on_completion(completion)?;
            }
        }
        self.completions = completions;
        Ok(())
    }

    /// Completion notification dispatcher.
    fn on_completion(&mut self, completion: Completion) -> Result<()> {
        let wr_id = completion.wr_id;
        let now_us = self.now_us();
        let connection = wr_id_connection(wr_id);

        if let CompletionStatus::Error(_) = completion.status {
            eprintln!(
                "[i{}] wr_id {:#x} failed on connection {}",
                self.cfg.input_index, wr_id, connection
            );
            if self.conn.len() == 1 {
                return Err(Error::Fabric { connection, wr_id });
            }
            return self.handle_connection_failure(connection);
        }

        match RequestKind::from_wr_id(wr_id) {
            Some(RequestKind::WriteDesc) => {
                let ts = wr_id_timeslice(wr_id);
                self.conn[connection as usize].on_complete_write()?;
                if self.manager.mark_rdma_write_acked(connection, ts, now_us) {
                    self.scheduler.on_acked(ts, now_us);
                    self.record_ack(ts);
                }
            }
            Some(RequestKind::WriteData) => {
                // payload writes are posted unsignaled; nothing to do if
                // a transport reports them anyway
            }
            Some(RequestKind::ReceiveStatus) => {
                self.conn[connection as usize]
                    .on_complete_recv(&mut self.transport, &completion.payload)?;
                let conn = &mut self.conn[connection as usize];
                if let Some(proposal) = conn.take_proposal() {
                    self.scheduler.add_proposed_meta_data(proposal);
                }
                let acked_desc = conn.cn_ack().desc;
                if conn.request_abort_flag() {
                    self.abort = true;
                }
                let done = conn.done();
                self.manager
                    .mark_completion_acked(connection, acked_desc, now_us);
                if done {
                    self.connections_done += 1;
                    let expected = self
                        .conn
                        .iter()
                        .filter(|c| c.state() != ConnectionState::Failed)
                        .count();
                    self.all_done = self.connections_done >= expected;
                }
            }
            Some(RequestKind::SendStatus) => {
                self.conn[connection as usize].on_complete_send();
            }
            Some(RequestKind::SendHeartbeat) => {}
            Some(RequestKind::ReceiveHeartbeat) => {
                // liveness evaluation is the failure oracle's business;
                // just re-arm the receive
                self.conn[connection as usize].post_recv_heartbeat(&mut self.transport)?;
            }
            None => return Err(Error::UnknownCompletion(wr_id)),
        }
        Ok(())
    }

    /// Collapse an acknowledged timeslice into the cursor low-water
    /// marks and lazily publish the producer read index.
    fn record_ack(&mut self, timeslice: u64) {
        self.ack.mark(timeslice);
        let acked_ts = self.ack.low_water();
        self.acked_desc = acked_ts * self.cfg.timeslice_size as u64;
        self.acked_data = self.data_source.desc_buffer().at(self.acked_desc).offset;

        if self.acked_data >= self.cached_acked_data + self.min_acked_data
            || self.acked_desc >= self.cached_acked_desc + self.min_acked_desc
        {
            self.cached_acked_desc = self.acked_desc;
            self.cached_acked_data = self.acked_data;
            self.data_source
                .set_read_index(DualIndex::new(self.cached_acked_desc, self.cached_acked_data));
        }
    }

    /// Fire due timer callbacks.
    fn timer(&mut self, now_us: u64) -> Result<()> {
        let mut due = Vec::new();
        self.timers.timer(now_us, &mut due);
        for action in due {
            match action {
                TimerAction::ReportStatus => {
                    self.report_status();
                    self.timers
                        .add(TimerAction::ReportStatus, now_us + self.cfg.status_interval_us);
                }
                TimerAction::SyncBufferPositions => {
                    self.sync_buffer_positions()?;
                    self.timers.add(TimerAction::SyncBufferPositions, now_us);
                }
                TimerAction::Heartbeat => {
                    for conn in &mut self.conn {
                        if conn.state() == ConnectionState::Established
                            || conn.state() == ConnectionState::Draining
                        {
                            conn.post_send_heartbeat(&mut self.transport, now_us)?;
                        }
                    }
                    self.timers
                        .add(TimerAction::Heartbeat, now_us + self.cfg.heartbeat_interval_us);
                }
            }
        }
        Ok(())
    }

    /// Record buffer fill-state snapshots for both rings.
    fn report_status(&mut self) {
        // written pointers may lag behind due to lazy updates; use the
        // sent values instead
        let write_index = self.data_source.get_write_index();
        let written_desc = write_index.desc.max(self.sent_desc);
        let written_data = write_index.data.max(self.sent_data);

        let status_desc = SendBufferStatus {
            size: self.data_source.desc_buffer().size(),
            cached_acked: self.cached_acked_desc,
            acked: self.acked_desc,
            sent: self.sent_desc,
            written: written_desc,
        };
        let status_data = SendBufferStatus {
            size: self.data_source.data_buffer().bytes(),
            cached_acked: self.cached_acked_data,
            acked: self.acked_data,
            sent: self.sent_data,
            written: written_data,
        };
        self.last_status = Some((status_desc, status_data));
    }

    /// Send local buffer positions to peers whose view is stale.
    pub fn sync_buffer_positions(&mut self) -> Result<()> {
        let actual = self.scheduler.latest_actual().copied();
        let wp = DualIndex::new(self.sent_desc, self.sent_data);
        for conn in &mut self.conn {
            match conn.state() {
                ConnectionState::Established | ConnectionState::Draining => {
                    conn.try_sync_buffer_positions(
                        &mut self.transport,
                        wp,
                        actual.as_ref(),
                        self.abort,
                    )?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Announce teardown on every live connection.
    pub fn finalize_all(&mut self) {
        for conn in &mut self.conn {
            if conn.state() != ConnectionState::Failed {
                conn.finalize(self.abort);
            }
        }
    }

    /// Tear down fabric connections.
    pub fn disconnect(&mut self) {
        for conn in &self.conn {
            if conn.state() != ConnectionState::Failed {
                self.transport.disconnect(conn.index());
            }
        }
    }

    /// Run the complete sender lifecycle against the real clock.
    ///
    /// Registered memory regions are released on every exit path.
    pub fn run(&mut self, oracle: &mut dyn FailureOracle) -> Result<()> {
        if let Some(core) = self.cfg.pin_core {
            core_affinity::set_for_current(core_affinity::CoreId { id: core });
        }
        let result = self.run_inner(oracle);
        self.release_memory_regions();
        result
    }

    fn run_inner(&mut self, oracle: &mut dyn FailureOracle) -> Result<()> {
        self.connect()?;
        while self.connected < self.conn.len() {
            self.poll_cm_events()?;
        }

        self.data_source.proceed();
        self.start(self.now_us());

        while self.sending_active() {
            self.tick(self.now_us(), oracle)?;
        }

        self.finalize_all();
        while !self.all_done {
            let now = self.now_us();
            self.poll_completion()?;
            self.timer(now)?;
        }

        self.disconnect();
        while self.connected > 0 {
            self.poll_cm_events()?;
        }
        Ok(())
    }
}

impl<T: RemoteWriteTransport, S: InputBufferSource> Drop for InputChannelSender<T, S> {
    /// Registered regions must not outlive the sender, even when the
    /// loop unwinds.
    fn drop(&mut self) {
        self.release_memory_regions();
    }
}
