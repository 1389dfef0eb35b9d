//! Receive-buffer providers for the ring engine.
//!
//! Three strategies cover the recv path:
//!
//! - [`Provider::Inline`]: no kernel buffer selection; each connection
//!   reads into its own inline buffer.
//! - [`Provider::Classic`]: a [`ClassicPool`] republished to the kernel
//!   through `PROVIDE_BUFFERS` submissions.
//! - [`Provider::SharedRing`]: a [`SharedRingPool`] mapped once and
//!   refilled by advancing a shared tail index; the kernel pulls directly.
//!
//! Buffer ownership is exclusive at all times: a buffer id is either on
//! the provider's free side, held by the kernel, or carried by exactly one
//! in-flight completion.

mod classic;
mod shared;

pub use classic::{ClassicPool, Range};
pub use shared::SharedRingPool;

use io_uring::{squeue, Submitter};

use crate::config::{IoUringRxConfig, ProviderKind};
use crate::error::Result;

/// Buffer group id shared by both kernel-visible providers.
pub const BGID: u16 = 1;

/// All pool buffers are sized and laid out on this alignment.
pub const BUFFER_ALIGN: usize = 32;

/// Round a recv size up to the pool alignment.
pub fn aligned_buffer_size(n: usize) -> usize {
    n.div_ceil(BUFFER_ALIGN) * BUFFER_ALIGN
}

/// The receive strategy selected for one ring engine instance.
pub enum Provider {
    Inline,
    Classic(ClassicPool),
    SharedRing(SharedRingPool),
}

impl Provider {
    pub fn from_config(cfg: &IoUringRxConfig) -> Result<Self> {
        Ok(match cfg.provide_buffers {
            ProviderKind::None => Provider::Inline,
            ProviderKind::Classic => Provider::Classic(ClassicPool::new(
                cfg.provided_buffer_count,
                cfg.common.recv_size,
                cfg.effective_low_watermark(),
            )?),
            ProviderKind::SharedRing => Provider::SharedRing(SharedRingPool::new(
                cfg.provided_buffer_count,
                cfg.common.recv_size,
                cfg.huge_pages,
            )?),
        })
    }

    /// Whether recv submissions use kernel buffer selection.
    pub fn active(&self) -> bool {
        !matches!(self, Provider::Inline)
    }

    pub fn size_per_buffer(&self) -> usize {
        match self {
            Provider::Inline => 0,
            Provider::Classic(p) => p.size_per_buffer(),
            Provider::SharedRing(p) => p.size_per_buffer(),
        }
    }

    /// Payload of buffer `bid`, limited to `len` received bytes.
    pub fn get_data(&self, bid: u16, len: usize) -> &[u8] {
        match self {
            Provider::Inline => &[],
            Provider::Classic(p) => p.get_data(bid, len),
            Provider::SharedRing(p) => p.get_data(bid, len),
        }
    }

    /// Hand buffer `bid` back after its completion was consumed.
    pub fn return_index(&mut self, bid: u16) {
        match self {
            Provider::Inline => {}
            Provider::Classic(p) => p.return_index(bid),
            Provider::SharedRing(p) => p.return_index(bid),
        }
    }

    /// Whether enough buffers are pending to warrant publish submissions.
    /// Always false for the shared ring (the kernel pulls via the tail).
    pub fn needs_publish(&self) -> bool {
        match self {
            Provider::Classic(p) => p.needs_publish(),
            _ => false,
        }
    }

    pub fn can_publish(&self) -> bool {
        match self {
            Provider::Classic(p) => p.can_publish(),
            _ => false,
        }
    }

    pub fn compact(&mut self) {
        if let Provider::Classic(p) = self {
            p.compact();
        }
    }

    /// Pop one free range into a `PROVIDE_BUFFERS` submission.
    pub fn publish_one(&mut self) -> Option<squeue::Entry> {
        match self {
            Provider::Classic(p) => p.publish_one(),
            _ => None,
        }
    }

    /// One-time kernel registration at engine startup.
    pub fn register(&mut self, submitter: &Submitter<'_>) -> Result<()> {
        if let Provider::SharedRing(p) = self {
            p.register(submitter)?;
        }
        Ok(())
    }

    /// Buffers currently held on the user side, for diagnostics.
    pub fn pending_publish(&self) -> usize {
        match self {
            Provider::Inline => 0,
            Provider::Classic(p) => p.pending_publish(),
            Provider::SharedRing(p) => p.staged(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_buffer_size() {
        assert_eq!(aligned_buffer_size(1), 32);
        assert_eq!(aligned_buffer_size(32), 32);
        assert_eq!(aligned_buffer_size(33), 64);
        assert_eq!(aligned_buffer_size(4096), 4096);
    }

    #[test]
    fn test_inline_provider_is_inert() {
        let mut p = Provider::Inline;
        assert!(!p.active());
        assert!(!p.needs_publish());
        assert!(!p.can_publish());
        assert!(p.publish_one().is_none());
        p.return_index(3);
        assert_eq!(p.pending_publish(), 0);
    }
}
