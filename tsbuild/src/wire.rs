//! Wire formats for the timeslice transport.
//!
//! All records are fixed-layout and little-endian. Payload writes carry a
//! [`TimesliceComponent`] header directly in front of the gathered
//! descriptor and data bytes; a separate [`TimesliceWorkItem`] lands in
//! the peer's work-item ring. Status and heartbeat messages travel as
//! tagged sends on their own tags.

use dualring::DualIndex;

use crate::error::{Error, Result};
use crate::transport::ComputeBufferInfo;

fn put_u64(buf: &mut [u8], offset: usize, v: u64) {
    buf[offset..offset + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
}

fn put_u32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap())
}

fn check_len(buf: &[u8], required: usize) -> Result<()> {
    if buf.len() < required {
        return Err(Error::InvalidMessage {
            required,
            available: buf.len(),
        });
    }
    Ok(())
}

/// Size of an encoded [`IntervalMeta`] in bytes.
pub const INTERVAL_META_SIZE: usize = 40;

/// Negotiated pacing metadata for one interval of timeslices.
///
/// Sent compute→input as a proposal for the next interval and input→
/// compute as the actual outcome of a finished interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntervalMeta {
    /// Interval index.
    pub interval_index: u64,
    /// First timeslice of the interval.
    pub start_ts: u64,
    /// Last timeslice of the interval (inclusive).
    pub end_ts: u64,
    /// Start time in microseconds, in the receiver's clock.
    pub start_time_us: u64,
    /// Interval duration in microseconds.
    pub duration_us: u64,
}

impl IntervalMeta {
    /// Encode into `buf` at `offset`.
    pub fn encode_at(&self, buf: &mut [u8], offset: usize) {
        put_u64(buf, offset, self.interval_index);
        put_u64(buf, offset + 8, self.start_ts);
        put_u64(buf, offset + 16, self.end_ts);
        put_u64(buf, offset + 24, self.start_time_us);
        put_u64(buf, offset + 32, self.duration_us);
    }

    /// Decode from `buf` at `offset`.
    pub fn decode_at(buf: &[u8], offset: usize) -> Self {
        Self {
            interval_index: get_u64(buf, offset),
            start_ts: get_u64(buf, offset + 8),
            end_ts: get_u64(buf, offset + 16),
            start_time_us: get_u64(buf, offset + 24),
            duration_us: get_u64(buf, offset + 32),
        }
    }
}

/// Size of an encoded [`TimesliceComponent`] header in bytes.
pub const TIMESLICE_COMPONENT_SIZE: usize = 32;

/// Header preceding the descriptor and data bytes of one timeslice
/// contribution in the peer's data ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimesliceComponent {
    /// Timeslice index.
    pub timeslice: u64,
    /// Number of microslice descriptors that follow.
    pub desc_length: u64,
    /// Number of payload bytes that follow the descriptors.
    pub data_length: u64,
    /// Padding bytes consumed before this header to avoid a ring wrap.
    pub skip: u64,
}

impl TimesliceComponent {
    /// Encode into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; TIMESLICE_COMPONENT_SIZE] {
        let mut buf = [0u8; TIMESLICE_COMPONENT_SIZE];
        put_u64(&mut buf, 0, self.timeslice);
        put_u64(&mut buf, 8, self.desc_length);
        put_u64(&mut buf, 16, self.data_length);
        put_u64(&mut buf, 24, self.skip);
        buf
    }

    /// Decode from a byte slice.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(buf, TIMESLICE_COMPONENT_SIZE)?;
        Ok(Self {
            timeslice: get_u64(buf, 0),
            desc_length: get_u64(buf, 8),
            data_length: get_u64(buf, 16),
            skip: get_u64(buf, 24),
        })
    }
}

/// Size of an encoded [`TimesliceWorkItem`] in bytes.
pub const TIMESLICE_WORK_ITEM_SIZE: usize = 32;

/// Entry written into the peer's work-item ring, one per timeslice
/// contribution, pointing at the component in the peer's data ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimesliceWorkItem {
    /// Timeslice index.
    pub timeslice: u64,
    /// Virtual byte offset of the component header in the peer data ring.
    pub offset: u64,
    /// Total component size in bytes (header, descriptors and data).
    pub size: u64,
    /// Number of microslices in the component.
    pub num_microslices: u64,
}

impl TimesliceWorkItem {
    /// Encode into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; TIMESLICE_WORK_ITEM_SIZE] {
        let mut buf = [0u8; TIMESLICE_WORK_ITEM_SIZE];
        put_u64(&mut buf, 0, self.timeslice);
        put_u64(&mut buf, 8, self.offset);
        put_u64(&mut buf, 16, self.size);
        put_u64(&mut buf, 24, self.num_microslices);
        buf
    }

    /// Decode from a byte slice.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(buf, TIMESLICE_WORK_ITEM_SIZE)?;
        Ok(Self {
            timeslice: get_u64(buf, 0),
            offset: get_u64(buf, 8),
            size: get_u64(buf, 16),
            num_microslices: get_u64(buf, 24),
        })
    }
}

/// Size of an encoded [`InputStatusMessage`] in bytes.
pub const INPUT_STATUS_SIZE: usize = 59;

/// Status update sent from an input channel to a compute node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStatusMessage {
    /// Input-side write pointers (sent descriptors and data bytes).
    pub wp: DualIndex,
    /// Ask the peer to abort the run.
    pub request_abort: bool,
    /// No further timeslices will be sent.
    pub finalize: bool,
    /// Actual metadata of a finished interval, if one completed.
    pub actual_interval: Option<IntervalMeta>,
}

impl InputStatusMessage {
    /// Encode into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; INPUT_STATUS_SIZE] {
        let mut buf = [0u8; INPUT_STATUS_SIZE];
        put_u64(&mut buf, 0, self.wp.desc);
        put_u64(&mut buf, 8, self.wp.data);
        buf[16] = self.request_abort as u8;
        buf[17] = self.finalize as u8;
        if let Some(meta) = &self.actual_interval {
            buf[18] = 1;
            meta.encode_at(&mut buf, 19);
        }
        buf
    }

    /// Decode from a byte slice.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(buf, INPUT_STATUS_SIZE)?;
        let actual_interval = if buf[18] != 0 {
            Some(IntervalMeta::decode_at(buf, 19))
        } else {
            None
        };
        Ok(Self {
            wp: DualIndex::new(get_u64(buf, 0), get_u64(buf, 8)),
            request_abort: buf[16] != 0,
            finalize: buf[17] != 0,
            actual_interval,
        })
    }
}

/// Size of an encoded [`ComputeStatusMessage`] in bytes.
pub const COMPUTE_STATUS_SIZE: usize = 172;

/// Status update sent from a compute node to an input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputeStatusMessage {
    /// Acknowledged positions: work items and data bytes processed.
    pub ack: DualIndex,
    /// Ask the input to abort the run.
    pub request_abort: bool,
    /// Confirms the input's finalize; the connection may close.
    pub final_flag: bool,
    /// First message after establishment, `info` and `my_address` valid.
    pub connect: bool,
    /// Remote buffer geometry, valid when `connect` is set.
    pub info: ComputeBufferInfo,
    /// Peer address, valid when `connect` is set.
    pub my_address: [u8; 64],
    /// Pacing proposal for the next interval, if any.
    pub proposed_interval: Option<IntervalMeta>,
    /// Median write latency over all inputs of this compute node, in
    /// microseconds.
    pub overall_median_latency: u64,
}

impl Default for ComputeStatusMessage {
    fn default() -> Self {
        Self {
            ack: DualIndex::default(),
            request_abort: false,
            final_flag: false,
            connect: false,
            info: ComputeBufferInfo {
                data_addr: 0,
                data_rkey: 0,
                data_capacity: 0,
                desc_addr: 0,
                desc_rkey: 0,
                desc_capacity: 0,
            },
            my_address: [0; 64],
            proposed_interval: None,
            overall_median_latency: 0,
        }
    }
}

impl ComputeStatusMessage {
    /// Encode into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; COMPUTE_STATUS_SIZE] {
        let mut buf = [0u8; COMPUTE_STATUS_SIZE];
        put_u64(&mut buf, 0, self.ack.desc);
        put_u64(&mut buf, 8, self.ack.data);
        buf[16] = self.request_abort as u8;
        buf[17] = self.final_flag as u8;
        buf[18] = self.connect as u8;
        put_u64(&mut buf, 19, self.info.data_addr);
        put_u32(&mut buf, 27, self.info.data_rkey);
        put_u64(&mut buf, 31, self.info.data_capacity);
        put_u64(&mut buf, 39, self.info.desc_addr);
        put_u32(&mut buf, 47, self.info.desc_rkey);
        put_u64(&mut buf, 51, self.info.desc_capacity);
        buf[59..123].copy_from_slice(&self.my_address);
        if let Some(meta) = &self.proposed_interval {
            buf[123] = 1;
            meta.encode_at(&mut buf, 124);
        }
        put_u64(&mut buf, 164, self.overall_median_latency);
        buf
    }

    /// Decode from a byte slice.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(buf, COMPUTE_STATUS_SIZE)?;
        let mut my_address = [0u8; 64];
        my_address.copy_from_slice(&buf[59..123]);
        let proposed_interval = if buf[123] != 0 {
            Some(IntervalMeta::decode_at(buf, 124))
        } else {
            None
        };
        Ok(Self {
            ack: DualIndex::new(get_u64(buf, 0), get_u64(buf, 8)),
            request_abort: buf[16] != 0,
            final_flag: buf[17] != 0,
            connect: buf[18] != 0,
            info: ComputeBufferInfo {
                data_addr: get_u64(buf, 19),
                data_rkey: get_u32(buf, 27),
                data_capacity: get_u64(buf, 31),
                desc_addr: get_u64(buf, 39),
                desc_rkey: get_u32(buf, 47),
                desc_capacity: get_u64(buf, 51),
            },
            my_address,
            proposed_interval,
            overall_median_latency: get_u64(buf, 164),
        })
    }
}

/// Size of an encoded [`HeartbeatMessage`] in bytes.
pub const HEARTBEAT_SIZE: usize = 17;

/// Liveness marker exchanged on a dedicated tag.
///
/// Absence over a policy-defined window feeds the external failure
/// oracle; the transport core only moves these messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatMessage {
    /// Monotone message id.
    pub message_id: u64,
    /// Sender timestamp in microseconds.
    pub timestamp_us: u64,
    /// Liveness marker.
    pub alive: bool,
}

impl HeartbeatMessage {
    /// Encode into a fixed-size array.
    pub fn to_bytes(&self) -> [u8; HEARTBEAT_SIZE] {
        let mut buf = [0u8; HEARTBEAT_SIZE];
        put_u64(&mut buf, 0, self.message_id);
        put_u64(&mut buf, 8, self.timestamp_us);
        buf[16] = self.alive as u8;
        buf
    }

    /// Decode from a byte slice.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        check_len(buf, HEARTBEAT_SIZE)?;
        Ok(Self {
            message_id: get_u64(buf, 0),
            timestamp_us: get_u64(buf, 8),
            alive: buf[16] != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> IntervalMeta {
        IntervalMeta {
            interval_index: 7,
            start_ts: 2800,
            end_ts: 3199,
            start_time_us: 1_234_567,
            duration_us: 40_000,
        }
    }

    #[test]
    fn test_component_roundtrip() {
        let hdr = TimesliceComponent {
            timeslice: 42,
            desc_length: 101,
            data_length: 10_100,
            skip: 64,
        };
        let buf = hdr.to_bytes();
        assert_eq!(buf.len(), TIMESLICE_COMPONENT_SIZE);
        assert_eq!(TimesliceComponent::from_bytes(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_work_item_roundtrip() {
        let item = TimesliceWorkItem {
            timeslice: 9,
            offset: 0x1000,
            size: 13_364,
            num_microslices: 101,
        };
        let buf = item.to_bytes();
        assert_eq!(TimesliceWorkItem::from_bytes(&buf).unwrap(), item);
    }

    #[test]
    fn test_input_status_roundtrip() {
        let msg = InputStatusMessage {
            wp: DualIndex::new(505, 50_500),
            request_abort: false,
            finalize: true,
            actual_interval: Some(sample_meta()),
        };
        let buf = msg.to_bytes();
        assert_eq!(buf.len(), INPUT_STATUS_SIZE);
        assert_eq!(InputStatusMessage::from_bytes(&buf).unwrap(), msg);
    }

    #[test]
    fn test_input_status_without_interval() {
        let msg = InputStatusMessage {
            wp: DualIndex::new(1, 2),
            ..Default::default()
        };
        let decoded = InputStatusMessage::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(decoded.actual_interval, None);
        assert!(!decoded.finalize);
    }

    #[test]
    fn test_compute_status_roundtrip() {
        let mut my_address = [0u8; 64];
        my_address[..9].copy_from_slice(b"cn03:5711");
        let msg = ComputeStatusMessage {
            ack: DualIndex::new(17, 170_000),
            request_abort: false,
            final_flag: false,
            connect: true,
            info: ComputeBufferInfo {
                data_addr: 0xdead_0000,
                data_rkey: 5,
                data_capacity: 1 << 20,
                desc_addr: 0xbeef_0000,
                desc_rkey: 6,
                desc_capacity: 1 << 10,
            },
            my_address,
            proposed_interval: Some(sample_meta()),
            overall_median_latency: 815,
        };
        let buf = msg.to_bytes();
        assert_eq!(buf.len(), COMPUTE_STATUS_SIZE);
        assert_eq!(ComputeStatusMessage::from_bytes(&buf).unwrap(), msg);
    }

    #[test]
    fn test_heartbeat_roundtrip() {
        let hb = HeartbeatMessage {
            message_id: 3,
            timestamp_us: 999_999,
            alive: true,
        };
        assert_eq!(HeartbeatMessage::from_bytes(&hb.to_bytes()).unwrap(), hb);
    }

    #[test]
    fn test_truncated_message_rejected() {
        let msg = InputStatusMessage::default();
        let buf = msg.to_bytes();
        assert!(InputStatusMessage::from_bytes(&buf[..10]).is_err());
        assert!(ComputeStatusMessage::from_bytes(&buf).is_err());
    }
}
