//! dualring - paired descriptor/data ring buffers for timeslice input channels.
//!
//! An input node owns two rings filled by an external producer: a ring of
//! fixed-size microslice descriptors and a ring of raw payload bytes. Both
//! use power-of-two sizes and virtual (unwrapped) cursors; the actual
//! buffer offset is the cursor masked by `size - 1`.
//!
//! This crate provides:
//!
//! - [`HostRing`]: a typed, mask-indexed ring view with the raw geometry
//!   needed by gather-list builders
//! - [`MicrosliceDescriptor`]: the fixed-size record describing one unit
//!   of detector data
//! - [`InputBufferSource`]: the read interface the transport consumes,
//!   with a monotone write index and a published read index
//! - [`PatternSource`]: a deterministic in-memory producer for tests,
//!   demos and benches
//! - [`AckRing`]: a sparse out-of-order acknowledgment accumulator that
//!   collapses to a monotonic low-water mark

pub mod ack;
pub mod microslice;
pub mod ring;
pub mod source;

pub use ack::AckRing;
pub use microslice::{MICROSLICE_DESCRIPTOR_SIZE, MicrosliceDescriptor};
pub use ring::{DualIndex, HostRing, is_contiguous};
pub use source::{InputBufferSource, PatternSource};
