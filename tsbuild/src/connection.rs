//! Per-compute-node connection endpoint.
//!
//! Tracks the peer's buffer cursors and the in-flight write budget,
//! submits gather-list writes for timeslice contributions, and exchanges
//! status and heartbeat messages. All methods are non-blocking; credit
//! gates are expressed as predicates the sender checks before
//! submitting.

use std::io;

use dualring::DualIndex;

use crate::error::{Error, Result};
use crate::transport::{
    ComputeBufferInfo, RemoteWriteTransport, RequestKind, Segment, TAG_HEARTBEAT, TAG_STATUS,
    encode_wr_id,
};
use crate::wire::{
    COMPUTE_STATUS_SIZE, ComputeStatusMessage, HEARTBEAT_SIZE, HeartbeatMessage,
    InputStatusMessage, IntervalMeta, TIMESLICE_COMPONENT_SIZE, TIMESLICE_WORK_ITEM_SIZE,
    TimesliceComponent, TimesliceWorkItem,
};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connecting.
    Idle,
    /// Rendezvous initiated.
    Connecting,
    /// Ready for data transfer.
    Established,
    /// Finalize requested, draining in-flight work.
    Draining,
    /// Terminal: peer confirmed the finalize or disconnected.
    Closed,
    /// Terminal: rejected twice.
    Failed,
}

/// Endpoint for one compute-node target.
pub struct ComputeNodeConnection {
    index: u16,
    remote_index: u16,
    state: ConnectionState,
    max_pending_writes: u32,
    in_flight_writes: u32,
    remote: Option<ComputeBufferInfo>,
    /// Peer write cursor (work items and data bytes we have placed).
    cn_wp: DualIndex,
    /// Peer ack cursor from the last status message.
    cn_ack: DualIndex,
    last_sent_wp: DualIndex,
    announced_actual_interval: Option<u64>,
    pending_proposal: Option<IntervalMeta>,
    send_buffer_available: bool,
    request_abort_flag: bool,
    finalize_requested: bool,
    abort_on_finalize: bool,
    finalize_sent: bool,
    done: bool,
    rejected_once: bool,
    heartbeat_id: u64,
    total_bytes_sent: u64,
    total_sync_bytes_sent: u64,
    total_send_requests: u64,
    total_recv_requests: u64,
}

impl ComputeNodeConnection {
    /// Create an endpoint for connection `index`, known to the peer as
    /// input `remote_index`, with the given in-flight write budget.
    pub fn new(index: u16, remote_index: u16, max_pending_writes: u32) -> Self {
        Self {
            index,
            remote_index,
            state: ConnectionState::Idle,
            max_pending_writes,
            in_flight_writes: 0,
            remote: None,
            cn_wp: DualIndex::default(),
            cn_ack: DualIndex::default(),
            last_sent_wp: DualIndex::default(),
            announced_actual_interval: None,
            pending_proposal: None,
            send_buffer_available: true,
            request_abort_flag: false,
            finalize_requested: false,
            abort_on_finalize: false,
            finalize_sent: false,
            done: false,
            rejected_once: false,
            heartbeat_id: 0,
            total_bytes_sent: 0,
            total_sync_bytes_sent: 0,
            total_send_requests: 0,
            total_recv_requests: 0,
        }
    }

    /// Connection index in the local group.
    #[inline]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Index of this input at the remote group.
    #[inline]
    pub fn remote_index(&self) -> u16 {
        self.remote_index
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the peer confirmed teardown.
    #[inline]
    pub fn done(&self) -> bool {
        self.done
    }

    /// Whether the peer asked to abort the run.
    #[inline]
    pub fn request_abort_flag(&self) -> bool {
        self.request_abort_flag
    }

    /// Peer buffer geometry, once established.
    pub fn remote_info(&self) -> Option<&ComputeBufferInfo> {
        self.remote.as_ref()
    }

    /// Number of writes currently in flight.
    #[inline]
    pub fn in_flight_writes(&self) -> u32 {
        self.in_flight_writes
    }

    /// Total payload bytes submitted.
    pub fn total_bytes_sent(&self) -> u64 {
        self.total_bytes_sent
    }

    /// Total status/heartbeat bytes submitted.
    pub fn total_sync_bytes_sent(&self) -> u64 {
        self.total_sync_bytes_sent
    }

    /// Total send work requests submitted.
    pub fn total_send_requests(&self) -> u64 {
        self.total_send_requests
    }

    /// Total receive work requests posted.
    pub fn total_recv_requests(&self) -> u64 {
        self.total_recv_requests
    }

    /// Initiate the fabric-level rendezvous.
    pub fn connect<T: RemoteWriteTransport>(&mut self, transport: &mut T, peer: &str) -> Result<()> {
        transport
            .connect(self.index, peer)
            .map_err(|_| Error::FabricUnreachable(peer.to_string()))?;
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    /// Handle a successful rendezvous: record the peer geometry and arm
    /// the receive side.
    pub fn on_established<T: RemoteWriteTransport>(
        &mut self,
        transport: &mut T,
        remote: ComputeBufferInfo,
    ) -> io::Result<()> {
        self.remote = Some(remote);
        self.state = ConnectionState::Established;
        self.post_recv_status(transport)?;
        self.post_recv_heartbeat(transport)?;
        Ok(())
    }

    /// Handle a rejection. Returns true if a retry may be scheduled;
    /// a second rejection is terminal.
    pub fn on_rejected(&mut self) -> bool {
        if self.rejected_once {
            self.state = ConnectionState::Failed;
            false
        } else {
            self.rejected_once = true;
            self.state = ConnectionState::Idle;
            true
        }
    }

    /// Handle teardown of the fabric-level connection.
    pub fn on_disconnected(&mut self) {
        self.state = ConnectionState::Closed;
    }

    /// Whether another write may be submitted within the in-flight
    /// budget.
    #[inline]
    pub fn write_request_available(&self) -> bool {
        self.in_flight_writes < self.max_pending_writes
    }

    /// Padding needed in front of a `total` byte placement so it does
    /// not straddle the peer data ring boundary.
    pub fn skip_required(&self, total: u64) -> u64 {
        let Some(remote) = &self.remote else {
            return 0;
        };
        let offset = self.cn_wp.data & (remote.data_capacity - 1);
        if offset + total > remote.data_capacity {
            remote.data_capacity - offset
        } else {
            0
        }
    }

    /// Whether the peer has `len` data bytes and `descs` work-item slots
    /// free.
    pub fn check_for_buffer_space(&self, len: u64, descs: u64) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        self.cn_wp.data + len - self.cn_ack.data <= remote.data_capacity
            && self.cn_wp.desc + descs - self.cn_ack.desc <= remote.desc_capacity
    }

    /// Submit the remote writes for one timeslice contribution: the
    /// component (header + gather segments) into the peer data ring and
    /// a work item into the peer work-item ring.
    ///
    /// The work-item write carries the signaled wr_id; its completion
    /// acknowledges the pair. The caller advances the peer cursors via
    /// [`inc_write_pointers`](Self::inc_write_pointers).
    #[allow(clippy::too_many_arguments)]
    pub fn send_data<T: RemoteWriteTransport>(
        &mut self,
        transport: &mut T,
        segments: &[Segment],
        timeslice: u64,
        desc_length: u64,
        data_length: u64,
        skip: u64,
    ) -> Result<()> {
        let remote = self.remote.ok_or(Error::InvariantBreach(
            "send_data on unestablished connection",
        ))?;

        let header = TimesliceComponent {
            timeslice,
            desc_length,
            data_length,
            skip,
        };
        let target = self.cn_wp.data + skip;
        let data_mask = remote.data_capacity - 1;
        transport.post_write(
            self.index,
            &header.to_bytes(),
            segments,
            remote.data_addr + (target & data_mask),
            remote.data_rkey,
            encode_wr_id(RequestKind::WriteData, self.index, timeslice),
            false,
        )?;

        let component_size = TIMESLICE_COMPONENT_SIZE as u64
            + desc_length * dualring::MICROSLICE_DESCRIPTOR_SIZE as u64
            + data_length;
        let work_item = TimesliceWorkItem {
            timeslice,
            offset: target,
            size: component_size,
            num_microslices: desc_length,
        };
        let desc_mask = remote.desc_capacity - 1;
        let desc_slot = self.cn_wp.desc & desc_mask;
        transport.post_write(
            self.index,
            &work_item.to_bytes(),
            &[],
            remote.desc_addr + desc_slot * TIMESLICE_WORK_ITEM_SIZE as u64,
            remote.desc_rkey,
            encode_wr_id(RequestKind::WriteDesc, self.index, timeslice),
            true,
        )?;

        self.in_flight_writes += 1;
        self.total_bytes_sent += component_size + TIMESLICE_WORK_ITEM_SIZE as u64;
        self.total_send_requests += 2;
        Ok(())
    }

    /// Advance the peer cursors after a submission.
    pub fn inc_write_pointers(&mut self, total_len: u64, descs: u64) {
        self.cn_wp.data += total_len;
        self.cn_wp.desc += descs;
    }

    /// Handle the completion of a signaled timeslice write.
    pub fn on_complete_write(&mut self) -> Result<()> {
        if self.in_flight_writes == 0 {
            return Err(Error::InvariantBreach("write completion without in-flight write"));
        }
        self.in_flight_writes -= 1;
        Ok(())
    }

    /// Consume a status message from the peer.
    ///
    /// Updates the ack view, surfaces abort and finalize confirmations,
    /// stores the pacing proposal, and re-arms the receive unless the
    /// connection is finished.
    pub fn on_complete_recv<T: RemoteWriteTransport>(
        &mut self,
        transport: &mut T,
        payload: &[u8],
    ) -> Result<()> {
        let msg = ComputeStatusMessage::from_bytes(payload)?;
        self.total_recv_requests += 1;

        if msg.ack.desc > self.cn_ack.desc {
            self.cn_ack.desc = msg.ack.desc;
        }
        if msg.ack.data > self.cn_ack.data {
            self.cn_ack.data = msg.ack.data;
        }
        if msg.request_abort {
            self.request_abort_flag = true;
        }
        if let Some(meta) = msg.proposed_interval {
            self.pending_proposal = Some(meta);
        }

        if msg.final_flag {
            self.done = true;
            self.state = ConnectionState::Closed;
        } else {
            self.post_recv_status(transport)?;
        }
        Ok(())
    }

    /// Acked positions from the peer's last status message.
    #[inline]
    pub fn cn_ack(&self) -> DualIndex {
        self.cn_ack
    }

    /// Take the pacing proposal received from the peer, if any.
    pub fn take_proposal(&mut self) -> Option<IntervalMeta> {
        self.pending_proposal.take()
    }

    /// Send the local buffer positions (and a completed interval's
    /// actual metadata, at most once) to the peer if anything changed
    /// since the last sync.
    ///
    /// Non-blocking; returns false when the send buffer is busy or
    /// nothing needs syncing.
    pub fn try_sync_buffer_positions<T: RemoteWriteTransport>(
        &mut self,
        transport: &mut T,
        wp: DualIndex,
        actual: Option<&IntervalMeta>,
        request_abort: bool,
    ) -> io::Result<bool> {
        if !self.send_buffer_available {
            return Ok(false);
        }
        let announce = actual.filter(|meta| {
            self.announced_actual_interval
                .is_none_or(|last| meta.interval_index > last)
        });
        let finalize_pending = self.finalize_requested && !self.finalize_sent;
        if wp == self.last_sent_wp && announce.is_none() && !finalize_pending && !request_abort {
            return Ok(false);
        }

        let msg = InputStatusMessage {
            wp,
            request_abort: request_abort || (self.finalize_requested && self.abort_on_finalize),
            finalize: self.finalize_requested,
            actual_interval: announce.copied(),
        };
        let bytes = msg.to_bytes();
        transport.post_tagged_send(
            self.index,
            &bytes,
            TAG_STATUS,
            encode_wr_id(RequestKind::SendStatus, self.index, 0),
        )?;

        self.send_buffer_available = false;
        self.last_sent_wp = wp;
        if let Some(meta) = announce {
            self.announced_actual_interval = Some(meta.interval_index);
        }
        if finalize_pending {
            self.finalize_sent = true;
        }
        self.total_sync_bytes_sent += bytes.len() as u64;
        self.total_send_requests += 1;
        Ok(true)
    }

    /// Handle completion of an outbound status message.
    pub fn on_complete_send(&mut self) {
        self.send_buffer_available = true;
    }

    /// Arm a receive for the next status message.
    pub fn post_recv_status<T: RemoteWriteTransport>(&mut self, transport: &mut T) -> io::Result<()> {
        transport.post_tagged_recv(
            self.index,
            COMPUTE_STATUS_SIZE,
            TAG_STATUS,
            encode_wr_id(RequestKind::ReceiveStatus, self.index, 0),
        )
    }

    /// Arm a receive for the next heartbeat.
    pub fn post_recv_heartbeat<T: RemoteWriteTransport>(
        &mut self,
        transport: &mut T,
    ) -> io::Result<()> {
        transport.post_tagged_recv(
            self.index,
            HEARTBEAT_SIZE,
            TAG_HEARTBEAT,
            encode_wr_id(RequestKind::ReceiveHeartbeat, self.index, 0),
        )
    }

    /// Send a heartbeat on the dedicated tag.
    pub fn post_send_heartbeat<T: RemoteWriteTransport>(
        &mut self,
        transport: &mut T,
        now_us: u64,
    ) -> io::Result<()> {
        let msg = HeartbeatMessage {
            message_id: self.heartbeat_id,
            timestamp_us: now_us,
            alive: true,
        };
        self.heartbeat_id += 1;
        transport.post_tagged_send(
            self.index,
            &msg.to_bytes(),
            TAG_HEARTBEAT,
            encode_wr_id(RequestKind::SendHeartbeat, self.index, 0),
        )?;
        self.total_sync_bytes_sent += HEARTBEAT_SIZE as u64;
        self.total_send_requests += 1;
        Ok(())
    }

    /// Declare the connection failed after a fabric error or an oracle
    /// verdict. Terminal; no further sends target it.
    pub fn mark_failed(&mut self) {
        self.state = ConnectionState::Failed;
    }

    /// Request teardown: no further timeslices will be sent. The
    /// finalize flag goes out with the next buffer-position sync, and
    /// the connection is `done` once the peer confirms.
    pub fn finalize(&mut self, abort: bool) {
        self.finalize_requested = true;
        self.abort_on_finalize = abort;
        if self.state == ConnectionState::Established {
            self.state = ConnectionState::Draining;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{AccessFlags, Completion, ConnectionEvent, MemoryRegion};

    /// Minimal transport stub for connection-level tests.
    #[derive(Default)]
    struct StubTransport {
        writes: Vec<(u64, bool)>,
        sends: Vec<(u64, Vec<u8>)>,
        recvs: Vec<u64>,
    }

    impl RemoteWriteTransport for StubTransport {
        fn register_memory(
            &mut self,
            addr: u64,
            len: usize,
            _access: AccessFlags,
        ) -> io::Result<MemoryRegion> {
            Ok(MemoryRegion {
                lkey: 1,
                rkey: 1,
                addr,
                len,
            })
        }

        fn close_region(&mut self, _region: MemoryRegion) -> io::Result<()> {
            Ok(())
        }

        fn connect(&mut self, _connection: u16, _peer: &str) -> io::Result<()> {
            Ok(())
        }

        fn disconnect(&mut self, _connection: u16) {}

        fn poll_events(&mut self, _out: &mut Vec<ConnectionEvent>) {}

        fn post_write(
            &mut self,
            _connection: u16,
            _inline: &[u8],
            _segments: &[Segment],
            _remote_addr: u64,
            _rkey: u32,
            wr_id: u64,
            signaled: bool,
        ) -> io::Result<()> {
            self.writes.push((wr_id, signaled));
            Ok(())
        }

        fn post_tagged_send(
            &mut self,
            _connection: u16,
            msg: &[u8],
            _tag: u64,
            wr_id: u64,
        ) -> io::Result<()> {
            self.sends.push((wr_id, msg.to_vec()));
            Ok(())
        }

        fn post_tagged_recv(
            &mut self,
            _connection: u16,
            _len: usize,
            _tag: u64,
            wr_id: u64,
        ) -> io::Result<()> {
            self.recvs.push(wr_id);
            Ok(())
        }

        fn poll_completions(&mut self, _out: &mut Vec<Completion>) {}
    }

    fn remote_info() -> ComputeBufferInfo {
        ComputeBufferInfo {
            data_addr: 0x10_0000,
            data_rkey: 7,
            data_capacity: 1 << 16,
            desc_addr: 0x20_0000,
            desc_rkey: 8,
            desc_capacity: 1 << 8,
        }
    }

    fn established(max_pending: u32) -> (ComputeNodeConnection, StubTransport) {
        let mut transport = StubTransport::default();
        let mut conn = ComputeNodeConnection::new(0, 3, max_pending);
        conn.connect(&mut transport, "cn00:5711").unwrap();
        conn.on_established(&mut transport, remote_info()).unwrap();
        (conn, transport)
    }

    #[test]
    fn test_state_machine() {
        let (mut conn, mut transport) = established(4);
        assert_eq!(conn.state(), ConnectionState::Established);
        conn.finalize(false);
        assert_eq!(conn.state(), ConnectionState::Draining);

        let confirm = ComputeStatusMessage {
            final_flag: true,
            ..Default::default()
        };
        conn.on_complete_recv(&mut transport, &confirm.to_bytes()).unwrap();
        assert!(conn.done());
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[test]
    fn test_single_retry_on_rejection() {
        let mut conn = ComputeNodeConnection::new(0, 0, 4);
        assert!(conn.on_rejected());
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(!conn.on_rejected());
        assert_eq!(conn.state(), ConnectionState::Failed);
    }

    #[test]
    fn test_write_budget() {
        let (mut conn, mut transport) = established(2);
        assert!(conn.write_request_available());
        for ts in 0..2 {
            conn.send_data(&mut transport, &[], ts, 10, 100, 0).unwrap();
            conn.inc_write_pointers(452, 1);
        }
        assert!(!conn.write_request_available());
        conn.on_complete_write().unwrap();
        assert!(conn.write_request_available());
        // completion without a matching write is an invariant breach
        conn.on_complete_write().unwrap();
        assert!(conn.on_complete_write().is_err());
    }

    #[test]
    fn test_skip_required() {
        let (mut conn, _) = established(4);
        assert_eq!(conn.skip_required(100), 0);
        // place the cursor 40 bytes short of the ring boundary
        conn.inc_write_pointers((1 << 16) - 40, 0);
        assert_eq!(conn.skip_required(40), 0);
        assert_eq!(conn.skip_required(41), 40);
    }

    #[test]
    fn test_buffer_space_gate() {
        let (mut conn, mut transport) = established(64);
        assert!(conn.check_for_buffer_space(1 << 16, 1));
        assert!(!conn.check_for_buffer_space((1 << 16) + 1, 1));

        conn.inc_write_pointers(1 << 16, 1);
        assert!(!conn.check_for_buffer_space(1, 1));

        // peer ack frees space
        let status = ComputeStatusMessage {
            ack: DualIndex::new(1, 1 << 16),
            ..Default::default()
        };
        conn.on_complete_recv(&mut transport, &status.to_bytes()).unwrap();
        assert!(conn.check_for_buffer_space(1 << 16, 1));
    }

    #[test]
    fn test_work_item_slot_gate() {
        let (mut conn, mut transport) = established(64);
        // every work-item slot occupied while the data ring stays empty
        conn.inc_write_pointers(0, 1 << 8);
        assert!(conn.check_for_buffer_space(1, 0));
        assert!(!conn.check_for_buffer_space(1, 1));

        let status = ComputeStatusMessage {
            ack: DualIndex::new(1, 0),
            ..Default::default()
        };
        conn.on_complete_recv(&mut transport, &status.to_bytes()).unwrap();
        assert!(conn.check_for_buffer_space(1, 1));
    }

    #[test]
    fn test_send_data_write_pair() {
        let (mut conn, mut transport) = established(4);
        conn.send_data(&mut transport, &[], 5, 101, 10_100, 0).unwrap();
        assert_eq!(transport.writes.len(), 2);
        let (payload_id, payload_signaled) = transport.writes[0];
        let (item_id, item_signaled) = transport.writes[1];
        assert!(!payload_signaled);
        assert!(item_signaled);
        assert_eq!(RequestKind::from_wr_id(payload_id), Some(RequestKind::WriteData));
        assert_eq!(RequestKind::from_wr_id(item_id), Some(RequestKind::WriteDesc));
        assert_eq!(crate::transport::wr_id_timeslice(item_id), 5);
        assert_eq!(conn.in_flight_writes(), 1);
    }

    #[test]
    fn test_sync_skips_unchanged_positions() {
        let (mut conn, mut transport) = established(4);
        let wp = DualIndex::new(10, 1000);
        assert!(conn.try_sync_buffer_positions(&mut transport, wp, None, false).unwrap());
        // busy until the send completes
        assert!(!conn.try_sync_buffer_positions(&mut transport, wp, None, false).unwrap());
        conn.on_complete_send();
        // unchanged positions need no sync
        assert!(!conn.try_sync_buffer_positions(&mut transport, wp, None, false).unwrap());
        let wp = DualIndex::new(11, 1100);
        assert!(conn.try_sync_buffer_positions(&mut transport, wp, None, false).unwrap());
    }

    #[test]
    fn test_sync_announces_interval_once() {
        let (mut conn, mut transport) = established(4);
        let meta = IntervalMeta {
            interval_index: 2,
            start_ts: 20,
            end_ts: 29,
            start_time_us: 1,
            duration_us: 2,
        };
        let wp = DualIndex::new(1, 1);
        assert!(conn
            .try_sync_buffer_positions(&mut transport, wp, Some(&meta), false)
            .unwrap());
        conn.on_complete_send();
        // same interval again: nothing new to announce
        assert!(!conn
            .try_sync_buffer_positions(&mut transport, wp, Some(&meta), false)
            .unwrap());

        let decoded = InputStatusMessage::from_bytes(&transport.sends[0].1).unwrap();
        assert_eq!(decoded.actual_interval.unwrap().interval_index, 2);
    }

    #[test]
    fn test_proposal_taken_once() {
        let (mut conn, mut transport) = established(4);
        let status = ComputeStatusMessage {
            proposed_interval: Some(IntervalMeta {
                interval_index: 1,
                start_ts: 10,
                end_ts: 19,
                start_time_us: 500,
                duration_us: 900,
            }),
            ..Default::default()
        };
        conn.on_complete_recv(&mut transport, &status.to_bytes()).unwrap();
        let proposal = conn.take_proposal().unwrap();
        assert_eq!(proposal.interval_index, 1);
        assert!(conn.take_proposal().is_none());
    }
}
