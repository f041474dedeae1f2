//! Microslice descriptor record.
//!
//! One descriptor per microslice, produced by the detector front-end and
//! read-only for the transport. Consecutive descriptors satisfy
//! `next.offset == prev.offset + prev.size` (modulo the data ring size).

/// Size of a microslice descriptor in bytes.
pub const MICROSLICE_DESCRIPTOR_SIZE: usize = 32;

/// Fixed-size metadata record for one microslice.
///
/// `offset` is a virtual byte position into the data ring; `size` is the
/// payload length in bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MicrosliceDescriptor {
    /// Header format identifier.
    pub hdr_id: u8,
    /// Header format version.
    pub hdr_ver: u8,
    /// Equipment identifier.
    pub eq_id: u16,
    /// Status and error flags.
    pub flags: u16,
    /// Subsystem identifier.
    pub sys_id: u8,
    /// Subsystem format version.
    pub sys_ver: u8,
    /// Microslice index.
    pub idx: u64,
    /// CRC32 checksum of the payload.
    pub crc: u32,
    /// Payload size in bytes.
    pub size: u32,
    /// Virtual byte offset of the payload in the data ring.
    pub offset: u64,
}
