//! Kernel capability probing for the ring engine.
//!
//! Capabilities are gathered once at startup into a struct of bools; the
//! engines branch on the struct, never on raw errno values deep in the
//! receive loop.

use io_uring::{opcode, IoUring, Probe};

use crate::error::Result;

/// io_uring capabilities relevant to the receive loop, probed once.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelCaps {
    /// `IORING_OP_PROVIDE_BUFFERS` is supported (classic provider).
    pub provide_buffers: bool,
    /// Registered buffer rings are supported (shared-ring provider).
    pub buf_ring: bool,
    /// Multishot recv is supported.
    pub recv_multishot: bool,
    /// Accept/close into fixed-file slots is supported.
    pub direct_descriptors: bool,
    /// Successful CQEs can be suppressed (`IORING_FEAT_CQE_SKIP`).
    pub skip_success: bool,
}

impl KernelCaps {
    /// Probe the running kernel with a throwaway ring.
    pub fn probe() -> Result<Self> {
        let ring = IoUring::new(2)?;
        let mut probe = Probe::new();
        ring.submitter().register_probe(&mut probe)?;

        // Buffer rings, multishot recv and direct accept are register/flag
        // features with no opcode of their own; SendZc landed in the same
        // kernel series and stands in as a conservative probe for all
        // three.
        let modern = probe.is_supported(opcode::SendZc::CODE);

        Ok(KernelCaps {
            provide_buffers: probe.is_supported(opcode::ProvideBuffers::CODE),
            buf_ring: modern,
            recv_multishot: modern,
            direct_descriptors: modern,
            skip_success: ring.params().is_feature_skip_cqe_on_success(),
        })
    }

    /// List the available capability names, for startup logging.
    pub fn available(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.provide_buffers {
            out.push("provide_buffers");
        }
        if self.buf_ring {
            out.push("buf_ring");
        }
        if self.recv_multishot {
            out.push("recv_multishot");
        }
        if self.direct_descriptors {
            out.push("direct_descriptors");
        }
        if self.skip_success {
            out.push("skip_success");
        }
        out
    }
}
