//! Input buffer read interface and in-memory producer.
//!
//! The transport never writes to the descriptor or data rings; it reads
//! them, reports how far it has safely consumed via [`set_read_index`],
//! and pumps the producer via [`proceed`].
//!
//! [`set_read_index`]: InputBufferSource::set_read_index
//! [`proceed`]: InputBufferSource::proceed

use crate::microslice::MicrosliceDescriptor;
use crate::ring::{DualIndex, HostRing};

/// Read interface over a paired descriptor/data ring filled by an
/// external producer.
///
/// Implementations with separate transport-registered send buffers stage
/// slices via `copy_to_*_send_buffer`; unified implementations make these
/// no-ops and return the same rings from both buffer accessors.
pub trait InputBufferSource {
    /// The descriptor ring.
    fn desc_buffer(&self) -> &HostRing<MicrosliceDescriptor>;

    /// The data ring.
    fn data_buffer(&self) -> &HostRing<u8>;

    /// The transport-registered descriptor region.
    fn desc_send_buffer(&self) -> &HostRing<MicrosliceDescriptor>;

    /// The transport-registered data region.
    fn data_send_buffer(&self) -> &HostRing<u8>;

    /// Stage `count` descriptors starting at virtual position `offset`
    /// into the send region.
    fn copy_to_desc_send_buffer(&mut self, offset: u64, count: u64);

    /// Stage `len` data bytes starting at virtual position `offset` into
    /// the send region.
    fn copy_to_data_send_buffer(&mut self, offset: u64, len: u64);

    /// Current producer high-water marks. May lag real production;
    /// monotone nondecreasing.
    fn get_write_index(&self) -> DualIndex;

    /// Publish the consumer low-water marks back to the producer.
    ///
    /// Must be monotone nondecreasing in both components; calling it
    /// twice with the same argument is a no-op.
    fn set_read_index(&mut self, index: DualIndex);

    /// The last published read index.
    fn read_index(&self) -> DualIndex;

    /// Give the producer an opportunity to make progress.
    fn proceed(&mut self);
}

/// Deterministic in-memory producer of microslice data.
///
/// Stands in for the detector front-end in tests, demos and benches:
/// each call to [`proceed`](InputBufferSource::proceed) appends
/// microslices of `content_size` bytes until the rings are full relative
/// to the published read index. Buffers are unified (no separate send
/// region).
pub struct PatternSource {
    desc: HostRing<MicrosliceDescriptor>,
    data: HostRing<u8>,
    write_index: DualIndex,
    read_index: DualIndex,
    content_size: u32,
    next_idx: u64,
}

impl PatternSource {
    /// Create a source with the given ring sizes (rounded up to powers
    /// of two) producing microslices of `content_size` payload bytes.
    pub fn new(desc_ring_size: usize, data_ring_size: usize, content_size: u32) -> Self {
        Self {
            desc: HostRing::new(desc_ring_size),
            data: HostRing::new(data_ring_size),
            write_index: DualIndex::default(),
            read_index: DualIndex::default(),
            content_size,
            next_idx: 0,
        }
    }

    /// Start producing data at a nonzero virtual byte offset.
    ///
    /// Only valid before the first `proceed` call.
    pub fn with_data_start(mut self, data_offset: u64) -> Self {
        assert_eq!(self.write_index.desc, 0);
        self.write_index.data = data_offset;
        self.read_index.data = data_offset;
        self
    }

    /// Append a single microslice with an explicit payload size.
    ///
    /// Returns false if either ring lacks space.
    pub fn append_microslice(&mut self, size: u32) -> bool {
        if self.write_index.desc - self.read_index.desc >= self.desc.size() {
            return false;
        }
        if self.write_index.data - self.read_index.data + size as u64 > self.data.size() {
            return false;
        }

        let offset = self.write_index.data;
        for i in 0..size as u64 {
            *self.data.at_mut(offset + i) = (self.next_idx ^ i) as u8;
        }
        *self.desc.at_mut(self.write_index.desc) = MicrosliceDescriptor {
            hdr_id: 0xdd,
            hdr_ver: 0x01,
            sys_id: 0xf0,
            idx: self.next_idx,
            size,
            offset,
            ..Default::default()
        };

        self.next_idx += 1;
        self.write_index.desc += 1;
        self.write_index.data += size as u64;
        true
    }
}

impl InputBufferSource for PatternSource {
    fn desc_buffer(&self) -> &HostRing<MicrosliceDescriptor> {
        &self.desc
    }

    fn data_buffer(&self) -> &HostRing<u8> {
        &self.data
    }

    fn desc_send_buffer(&self) -> &HostRing<MicrosliceDescriptor> {
        &self.desc
    }

    fn data_send_buffer(&self) -> &HostRing<u8> {
        &self.data
    }

    fn copy_to_desc_send_buffer(&mut self, _offset: u64, _count: u64) {
        // unified buffers
    }

    fn copy_to_data_send_buffer(&mut self, _offset: u64, _len: u64) {
        // unified buffers
    }

    fn get_write_index(&self) -> DualIndex {
        self.write_index
    }

    fn set_read_index(&mut self, index: DualIndex) {
        assert!(
            index.desc >= self.read_index.desc && index.data >= self.read_index.data,
            "read index moved backwards"
        );
        self.read_index = index;
    }

    fn read_index(&self) -> DualIndex {
        self.read_index
    }

    fn proceed(&mut self) {
        while self.append_microslice(self.content_size) {}
    }
}
