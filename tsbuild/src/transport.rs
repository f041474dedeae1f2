//! Abstract remote-write fabric interface.
//!
//! The transport core never touches fabric primitives directly; it
//! consumes this trait. A production implementation wraps a one-sided,
//! registered-memory fabric (verbs, libfabric); tests use a recording
//! mock.
//!
//! Work request ids encode `(timeslice << 24) | (connection << 8) | kind`
//! so completion consumers can reconstruct what finished without back
//! pointers into the submitting object.

use std::io;

use bitflags::bitflags;

bitflags! {
    /// Memory registration access flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessFlags: u32 {
        /// Local write access.
        const LOCAL_WRITE = 1;
        /// Remote write access.
        const REMOTE_WRITE = 2;
        /// Remote read access.
        const REMOTE_READ = 4;
    }
}

/// A registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Local access key.
    pub lkey: u32,
    /// Remote access key.
    pub rkey: u32,
    /// Base address of the registered range.
    pub addr: u64,
    /// Length of the registered range in bytes.
    pub len: usize,
}

/// One gather-list entry of a remote write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Local source address.
    pub addr: u64,
    /// Length in bytes.
    pub len: u64,
    /// Local key of the region containing the source.
    pub lkey: u32,
}

/// Completion status of a work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The work request completed successfully.
    Success,
    /// The work request failed with a provider-specific code.
    Error(u32),
}

/// A polled completion queue entry.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Work request id as submitted.
    pub wr_id: u64,
    /// Completion status.
    pub status: CompletionStatus,
    /// Received bytes for tagged-receive completions, empty otherwise.
    pub payload: Vec<u8>,
}

/// Remote buffer geometry of a compute node, exchanged at connection
/// establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeBufferInfo {
    /// Remote data ring base address.
    pub data_addr: u64,
    /// Remote data ring access key.
    pub data_rkey: u32,
    /// Remote data ring capacity in bytes (a power of two).
    pub data_capacity: u64,
    /// Remote work-item ring base address.
    pub desc_addr: u64,
    /// Remote work-item ring access key.
    pub desc_rkey: u32,
    /// Remote work-item ring capacity in entries (a power of two).
    pub desc_capacity: u64,
}

/// Connection management event.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The fabric-level rendezvous succeeded.
    Established {
        /// Connection index.
        connection: u16,
        /// Remote buffer geometry.
        remote: ComputeBufferInfo,
    },
    /// The remote refused the connection.
    Rejected {
        /// Connection index.
        connection: u16,
    },
    /// The connection was torn down.
    Disconnected {
        /// Connection index.
        connection: u16,
    },
}

/// Tag for status messages.
pub const TAG_STATUS: u64 = 0x10;

/// Tag for heartbeat messages.
pub const TAG_HEARTBEAT: u64 = 0x20;

/// One-sided remote-write fabric, consumed by the transport core.
pub trait RemoteWriteTransport {
    /// Register a memory range for remote access.
    fn register_memory(&mut self, addr: u64, len: usize, access: AccessFlags)
    -> io::Result<MemoryRegion>;

    /// Release a registered memory region.
    ///
    /// Must only be called once no in-flight write references the region.
    fn close_region(&mut self, region: MemoryRegion) -> io::Result<()>;

    /// Initiate the rendezvous with a peer. Completion is reported via
    /// [`poll_events`](Self::poll_events).
    fn connect(&mut self, connection: u16, peer: &str) -> io::Result<()>;

    /// Tear down a connection. Completion is reported via
    /// [`poll_events`](Self::poll_events).
    fn disconnect(&mut self, connection: u16);

    /// Drain pending connection management events into `out`.
    fn poll_events(&mut self, out: &mut Vec<ConnectionEvent>);

    /// Post a remote write of `inline` followed by the gather `segments`
    /// to `remote_addr`.
    ///
    /// Writes on one connection complete in submission order. Unsignaled
    /// writes produce no completion.
    fn post_write(
        &mut self,
        connection: u16,
        inline: &[u8],
        segments: &[Segment],
        remote_addr: u64,
        rkey: u32,
        wr_id: u64,
        signaled: bool,
    ) -> io::Result<()>;

    /// Post a tagged message send.
    fn post_tagged_send(
        &mut self,
        connection: u16,
        msg: &[u8],
        tag: u64,
        wr_id: u64,
    ) -> io::Result<()>;

    /// Post a tagged message receive of up to `len` bytes.
    fn post_tagged_recv(
        &mut self,
        connection: u16,
        len: usize,
        tag: u64,
        wr_id: u64,
    ) -> io::Result<()>;

    /// Drain pending completions into `out`.
    fn poll_completions(&mut self, out: &mut Vec<Completion>);
}

/// Work request kind, encoded in the low byte of the wr_id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestKind {
    /// Timeslice payload write (normally unsignaled).
    WriteData = 1,
    /// Timeslice work-item write; its completion acknowledges the pair.
    WriteDesc = 2,
    /// Outbound status message send.
    SendStatus = 3,
    /// Inbound status message receive.
    ReceiveStatus = 4,
    /// Outbound heartbeat send.
    SendHeartbeat = 5,
    /// Inbound heartbeat receive.
    ReceiveHeartbeat = 6,
}

impl RequestKind {
    /// Decode a request kind from the low byte of a wr_id.
    pub fn from_wr_id(wr_id: u64) -> Option<Self> {
        match wr_id & 0xFF {
            1 => Some(RequestKind::WriteData),
            2 => Some(RequestKind::WriteDesc),
            3 => Some(RequestKind::SendStatus),
            4 => Some(RequestKind::ReceiveStatus),
            5 => Some(RequestKind::SendHeartbeat),
            6 => Some(RequestKind::ReceiveHeartbeat),
            _ => None,
        }
    }
}

/// Encode a work request id from kind, connection index and timeslice.
#[inline]
pub fn encode_wr_id(kind: RequestKind, connection: u16, timeslice: u64) -> u64 {
    (timeslice << 24) | ((connection as u64) << 8) | kind as u64
}

/// Connection index from a wr_id.
#[inline]
pub fn wr_id_connection(wr_id: u64) -> u16 {
    ((wr_id >> 8) & 0xFFFF) as u16
}

/// Timeslice index from a wr_id.
#[inline]
pub fn wr_id_timeslice(wr_id: u64) -> u64 {
    wr_id >> 24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wr_id_roundtrip() {
        let wr_id = encode_wr_id(RequestKind::WriteDesc, 7, 123_456);
        assert_eq!(RequestKind::from_wr_id(wr_id), Some(RequestKind::WriteDesc));
        assert_eq!(wr_id_connection(wr_id), 7);
        assert_eq!(wr_id_timeslice(wr_id), 123_456);
    }

    #[test]
    fn test_wr_id_all_kinds() {
        for kind in [
            RequestKind::WriteData,
            RequestKind::WriteDesc,
            RequestKind::SendStatus,
            RequestKind::ReceiveStatus,
            RequestKind::SendHeartbeat,
            RequestKind::ReceiveHeartbeat,
        ] {
            let wr_id = encode_wr_id(kind, 0xFFFF, 0);
            assert_eq!(RequestKind::from_wr_id(wr_id), Some(kind));
            assert_eq!(wr_id_connection(wr_id), 0xFFFF);
        }
    }

    #[test]
    fn test_wr_id_unknown_kind() {
        assert_eq!(RequestKind::from_wr_id(0xAB00), None);
        assert_eq!(RequestKind::from_wr_id(0x07), None);
    }

    #[test]
    fn test_access_flags() {
        let flags = AccessFlags::LOCAL_WRITE | AccessFlags::REMOTE_WRITE;
        assert!(flags.contains(AccessFlags::REMOTE_WRITE));
        assert!(!flags.contains(AccessFlags::REMOTE_READ));
    }
}
