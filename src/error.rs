//! Error types for ringmark engines and configuration.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, RingmarkError>;

/// Error type covering configuration rejection, engine setup failure and
/// the fatal runtime states of the receive loops.
///
/// Per-connection trouble (peer reset, EOF, a failed write to a dying
/// socket) is absorbed by the engines and never surfaces here; a
/// `RingmarkError` escaping an engine loop terminates that engine.
#[derive(Debug, Error)]
pub enum RingmarkError {
    /// Rejected before any engine started.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Ring creation failed even after dropping optional setup flags.
    #[error("io_uring setup failed")]
    RingSetup(#[source] std::io::Error),

    /// A capability the selected options require is missing on this kernel.
    #[error("kernel capability missing: {0}")]
    CapabilityMissing(&'static str),

    /// A recv completed with `-ENOBUFS`: the provided-buffer pool ran dry.
    ///
    /// This is fatal by design. Requeueing the read would spin the loop
    /// against an empty pool; the right fix is a larger pool or a lower
    /// publish watermark.
    #[error("receive buffer pool starved (ENOBUFS); {pending} buffers awaiting publish")]
    PoolStarvation { pending: usize },

    /// No free slot left in the registered fixed-file table at accept time.
    #[error("fixed file table exhausted")]
    FixedFilesExhausted,

    /// An accept completion failed while the engine was not stopping.
    #[error("accept failed")]
    Accept(#[source] std::io::Error),

    /// A completion arrived that no submission accounts for.
    #[error("unexpected completion: user_data={user_data:#x} res={res}")]
    UnexpectedCompletion { user_data: u64, res: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RingmarkError {
    /// Helper for building configuration errors from format strings.
    pub fn config(msg: impl Into<String>) -> Self {
        RingmarkError::Config(msg.into())
    }
}
