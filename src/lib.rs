//! # ringmark: a TCP receiver-engine benchmark
//!
//! ringmark measures the request-per-second and byte-per-second
//! throughput of two single-threaded TCP receiver designs under one wire
//! protocol:
//!
//! - the **ring engine** ([`engine::UringEngine`]): completion-driven
//!   over io_uring, with optional provided-buffer pools (classic or
//!   shared-ring), multishot recv, and direct descriptors;
//! - the **readiness engine** ([`engine::EpollEngine`]): edge-triggered
//!   epoll with nonblocking recv and a write-backpressure state machine.
//!
//! A request is an 8-byte little-endian header (`length`, `reply_size`)
//! followed by `length` payload bytes; the receiver answers with
//! `reply_size` arbitrary bytes once the full frame has arrived. The load
//! comes from an external peer speaking this protocol against the ports
//! the binary advertises at startup.
//!
//! Each receiver runs on its own thread, makes exactly one blocking
//! kernel entry per loop iteration, and reports throughput, idle time and
//! CPU accounting once a second through [`stats::RxStats`].
//!
//! Linux-only: both engines sit directly on kernel notification
//! interfaces.
//!
//! ```text
//! listen socket -> accept -> per-connection reader -> FrameParser
//!     -> workload hook -> reply send
//! ```

pub mod buffers;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod protocol;
pub mod socket;
pub mod stats;
pub mod workload;

pub use buffers::{ClassicPool, Provider, SharedRingPool};
pub use config::{parse_rx_spec, EpollRxConfig, IoUringRxConfig, ProviderKind, RxSpec};
pub use engine::{EpollEngine, Runner, UringEngine};
pub use error::{Result, RingmarkError};
pub use features::KernelCaps;
pub use protocol::{Consumed, FrameParser};
pub use stats::RxStats;
