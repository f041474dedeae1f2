//! tsbuild - timeslice building transport for distributed readout chains.
//!
//! Input nodes continuously fill large ring buffers with detector data;
//! compute nodes assemble cross-input timeslices. This crate is the
//! transport between them: it moves timeslice contributions from each
//! input node to the correct compute node over a one-sided,
//! registered-memory remote-write fabric, keeps both sides' ring buffers
//! coherent, paces transmissions so all contributions for a timeslice
//! arrive within a bounded window, and redistributes work when a compute
//! node fails.
//!
//! ```text
//!  input node i                                  compute node c
//! ┌───────────────────────────────┐             ┌──────────────────┐
//! │ producer → DualRingBuffer     │   RDMA      │ data ring        │
//! │            InputChannelSender ─┼── write ──▶ │ work-item ring   │
//! │  ┌──────────┬──────────────┐  │             │                  │
//! │  │ Timeslice│ Interval     │  │ ◀── status ─┼─ ComputePacer    │
//! │  │ Manager  │ Scheduler    │  │   messages  │  (proposals)     │
//! │  └──────────┴──────────────┘  │             └──────────────────┘
//! └───────────────────────────────┘
//! ```
//!
//! - One `InputChannelSender` per input node drives a single-threaded
//!   event loop over N compute connections; exactly one write pair may
//!   be in flight per timeslice.
//! - The `TimesliceManager` assigns timeslices to connections and
//!   reassigns unsent or in-flight work when a connection is declared
//!   failed by the external [`FailureOracle`].
//! - The `IntervalScheduler` executes each negotiated interval close to
//!   its proposed finish, speeding up on ack lag and slowing on lead.
//! - The `ComputePacer` runs on the compute side, measuring per-input
//!   arrival times and proposing the next interval's send times.
//!
//! The fabric itself is consumed behind [`RemoteWriteTransport`]; this
//! crate never calls fabric primitives directly.
//!
//! [`FailureOracle`]: failure::FailureOracle
//! [`RemoteWriteTransport`]: transport::RemoteWriteTransport

pub mod config;
pub mod connection;
pub mod error;
pub mod failure;
pub mod interval;
pub mod manager;
pub mod pacer;
pub mod scheduler;
pub mod sender;
pub mod timing;
pub mod transport;
pub mod wire;

pub use config::SenderConfig;
pub use connection::{ComputeNodeConnection, ConnectionState};
pub use error::{Error, Result};
pub use failure::{FailedNodeInfo, FailureBridge, FailureOracle, QueueOracle};
pub use interval::IntervalInfo;
pub use manager::{TimesliceInfo, TimesliceManager};
pub use pacer::{ComputePacer, DurationStats};
pub use scheduler::IntervalScheduler;
pub use sender::{InputChannelSender, SendBufferStatus};
pub use transport::{
    AccessFlags, Completion, CompletionStatus, ComputeBufferInfo, ConnectionEvent, MemoryRegion,
    RemoteWriteTransport, RequestKind, Segment,
};
pub use wire::{
    ComputeStatusMessage, HeartbeatMessage, InputStatusMessage, IntervalMeta, TimesliceComponent,
    TimesliceWorkItem,
};
