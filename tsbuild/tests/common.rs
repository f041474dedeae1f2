//! Common test utilities for the transport integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;

use tsbuild::transport::{
    AccessFlags, Completion, CompletionStatus, ComputeBufferInfo, ConnectionEvent, MemoryRegion,
    RemoteWriteTransport, RequestKind, Segment, encode_wr_id,
};
use tsbuild::wire::ComputeStatusMessage;

/// One recorded remote write.
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub connection: u16,
    pub inline: Vec<u8>,
    pub segments: Vec<Segment>,
    pub remote_addr: u64,
    pub rkey: u32,
    pub wr_id: u64,
    pub signaled: bool,
}

impl RecordedWrite {
    /// Reconstruct the bytes this write would place at the peer, in
    /// gather order (inline header first).
    ///
    /// Segments reference memory owned by the test's data source; the
    /// regions are alive for the duration of the test.
    pub fn gathered_bytes(&self) -> Vec<u8> {
        let mut bytes = self.inline.clone();
        for segment in &self.segments {
            let slice = unsafe {
                std::slice::from_raw_parts(segment.addr as *const u8, segment.len as usize)
            };
            bytes.extend_from_slice(slice);
        }
        bytes
    }
}

/// Recording transport with scriptable events and completions.
///
/// Tagged sends complete immediately; write completions and inbound
/// messages are injected by the test.
pub struct MockTransport {
    pub writes: Vec<RecordedWrite>,
    pub tagged_sends: Vec<(u16, u64, Vec<u8>)>,
    pub recvs_posted: Vec<(u16, u64)>,
    pub regions: Vec<MemoryRegion>,
    pub closed_regions: Vec<MemoryRegion>,
    events: VecDeque<ConnectionEvent>,
    completions: VecDeque<Completion>,
    next_key: u32,
    /// Peer geometry handed out on connect().
    pub remote_info: ComputeBufferInfo,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            writes: Vec::new(),
            tagged_sends: Vec::new(),
            recvs_posted: Vec::new(),
            regions: Vec::new(),
            closed_regions: Vec::new(),
            events: VecDeque::new(),
            completions: VecDeque::new(),
            next_key: 1,
            remote_info: ComputeBufferInfo {
                data_addr: 0x1000_0000,
                data_rkey: 100,
                data_capacity: 1 << 20,
                desc_addr: 0x2000_0000,
                desc_rkey: 101,
                desc_capacity: 1 << 10,
            },
        }
    }

    pub fn with_peer_data_capacity(mut self, capacity: u64) -> Self {
        self.remote_info.data_capacity = capacity;
        self
    }

    /// Inject a successful completion for the signaled write of `ts` on
    /// `connection`.
    pub fn complete_write(&mut self, connection: u16, ts: u64) {
        self.completions.push_back(Completion {
            wr_id: encode_wr_id(RequestKind::WriteDesc, connection, ts),
            status: CompletionStatus::Success,
            payload: Vec::new(),
        });
    }

    /// Inject a failed completion for the signaled write of `ts`.
    pub fn fail_write(&mut self, connection: u16, ts: u64) {
        self.completions.push_back(Completion {
            wr_id: encode_wr_id(RequestKind::WriteDesc, connection, ts),
            status: CompletionStatus::Error(5),
            payload: Vec::new(),
        });
    }

    /// Inject an arbitrary completion.
    pub fn push_completion(&mut self, completion: Completion) {
        self.completions.push_back(completion);
    }

    /// Deliver a status message from the peer on `connection`.
    pub fn deliver_status(&mut self, connection: u16, msg: &ComputeStatusMessage) {
        self.completions.push_back(Completion {
            wr_id: encode_wr_id(RequestKind::ReceiveStatus, connection, 0),
            status: CompletionStatus::Success,
            payload: msg.to_bytes().to_vec(),
        });
    }

    /// Signaled timeslice writes recorded so far, as (connection, ts).
    pub fn signaled_writes(&self) -> Vec<(u16, u64)> {
        self.writes
            .iter()
            .filter(|w| w.signaled)
            .map(|w| {
                (
                    tsbuild::transport::wr_id_connection(w.wr_id),
                    tsbuild::transport::wr_id_timeslice(w.wr_id),
                )
            })
            .collect()
    }

    /// The payload (unsignaled) write for timeslice `ts`.
    pub fn payload_write(&self, ts: u64) -> Option<&RecordedWrite> {
        self.writes.iter().find(|w| {
            !w.signaled
                && RequestKind::from_wr_id(w.wr_id) == Some(RequestKind::WriteData)
                && tsbuild::transport::wr_id_timeslice(w.wr_id) == ts
        })
    }
}

impl RemoteWriteTransport for MockTransport {
    fn register_memory(
        &mut self,
        addr: u64,
        len: usize,
        _access: AccessFlags,
    ) -> io::Result<MemoryRegion> {
        let region = MemoryRegion {
            lkey: self.next_key,
            rkey: self.next_key + 1,
            addr,
            len,
        };
        self.next_key += 2;
        self.regions.push(region);
        Ok(region)
    }

    fn close_region(&mut self, region: MemoryRegion) -> io::Result<()> {
        self.closed_regions.push(region);
        Ok(())
    }

    fn connect(&mut self, connection: u16, _peer: &str) -> io::Result<()> {
        self.events.push_back(ConnectionEvent::Established {
            connection,
            remote: self.remote_info,
        });
        Ok(())
    }

    fn disconnect(&mut self, connection: u16) {
        self.events.push_back(ConnectionEvent::Disconnected { connection });
    }

    fn poll_events(&mut self, out: &mut Vec<ConnectionEvent>) {
        out.extend(self.events.drain(..));
    }

    fn post_write(
        &mut self,
        connection: u16,
        inline: &[u8],
        segments: &[Segment],
        remote_addr: u64,
        rkey: u32,
        wr_id: u64,
        signaled: bool,
    ) -> io::Result<()> {
        self.writes.push(RecordedWrite {
            connection,
            inline: inline.to_vec(),
            segments: segments.to_vec(),
            remote_addr,
            rkey,
            wr_id,
            signaled,
        });
        Ok(())
    }

    fn post_tagged_send(
        &mut self,
        connection: u16,
        msg: &[u8],
        tag: u64,
        wr_id: u64,
    ) -> io::Result<()> {
        self.tagged_sends.push((connection, tag, msg.to_vec()));
        // sends complete immediately
        self.completions.push_back(Completion {
            wr_id,
            status: CompletionStatus::Success,
            payload: Vec::new(),
        });
        Ok(())
    }

    fn post_tagged_recv(
        &mut self,
        connection: u16,
        _len: usize,
        tag: u64,
        _wr_id: u64,
    ) -> io::Result<()> {
        self.recvs_posted.push((connection, tag));
        Ok(())
    }

    fn poll_completions(&mut self, out: &mut Vec<Completion>) {
        out.extend(self.completions.drain(..));
    }
}
