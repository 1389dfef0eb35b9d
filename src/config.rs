//! Receiver and run configuration.
//!
//! Engine options arrive as a single `--rx` string, the engine name
//! followed by `key=value` tokens such as
//! `--rx "io_uring provide_buffers=1 multishot_recv=0"`, parsed here into
//! typed config structs with validation before any engine starts.

use crate::error::{Result, RingmarkError};

/// Which receive-buffer strategy the ring engine runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderKind {
    /// Per-connection inline buffer; no kernel buffer selection.
    None,
    /// Classic `PROVIDE_BUFFERS` pool republished through submissions.
    Classic,
    /// Shared user/kernel buffer ring published by tail advance.
    #[default]
    SharedRing,
}

impl ProviderKind {
    fn from_int(v: u32) -> Result<Self> {
        match v {
            0 => Ok(ProviderKind::None),
            1 => Ok(ProviderKind::Classic),
            2 => Ok(ProviderKind::SharedRing),
            other => Err(RingmarkError::config(format!(
                "provide_buffers must be 0, 1 or 2, got {other}"
            ))),
        }
    }
}

/// Options common to both engines.
#[derive(Debug, Clone, PartialEq)]
pub struct RxCommon {
    pub backlog: i32,
    pub max_events: usize,
    pub recv_size: usize,
    pub recvmsg: bool,
    pub workload: usize,
    pub description: String,
}

impl Default for RxCommon {
    fn default() -> Self {
        Self {
            backlog: 100_000,
            max_events: 32,
            recv_size: 4096,
            recvmsg: false,
            workload: 0,
            description: String::new(),
        }
    }
}

/// Ring engine options.
#[derive(Debug, Clone, PartialEq)]
pub struct IoUringRxConfig {
    pub common: RxCommon,
    pub supports_nonblock_accept: bool,
    pub register_ring: bool,
    pub provide_buffers: ProviderKind,
    pub fixed_files: bool,
    pub sqe_count: u32,
    /// 0 means `128 * sqe_count`.
    pub cqe_count: u32,
    /// Cap on completions drained per loop iteration.
    pub max_cqe_loop: u32,
    pub provided_buffer_count: u32,
    pub fixed_file_count: u32,
    /// `None` means a quarter of `provided_buffer_count`.
    pub provided_buffer_low_watermark: Option<u32>,
    pub provided_buffer_compact: bool,
    pub huge_pages: bool,
    pub multishot_recv: bool,
    pub defer_taskrun: bool,
}

impl Default for IoUringRxConfig {
    fn default() -> Self {
        Self {
            common: RxCommon::default(),
            supports_nonblock_accept: false,
            register_ring: true,
            provide_buffers: ProviderKind::SharedRing,
            fixed_files: true,
            sqe_count: 64,
            cqe_count: 0,
            max_cqe_loop: 256 * 32,
            provided_buffer_count: 8000,
            fixed_file_count: 16_000,
            provided_buffer_low_watermark: None,
            provided_buffer_compact: true,
            huge_pages: false,
            multishot_recv: true,
            defer_taskrun: false,
        }
    }
}

impl IoUringRxConfig {
    /// Effective CQ size.
    pub fn effective_cqe_count(&self) -> u32 {
        if self.cqe_count == 0 {
            self.sqe_count.saturating_mul(128)
        } else {
            self.cqe_count
        }
    }

    /// Effective publish watermark: a quarter of the pool unless pinned.
    pub fn effective_low_watermark(&self) -> u32 {
        self.provided_buffer_low_watermark
            .unwrap_or(self.provided_buffer_count / 4)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sqe_count == 0 {
            return Err(RingmarkError::config("sqe_count must be greater than 0"));
        }
        if self.common.recv_size == 0 {
            return Err(RingmarkError::config("recv_size must be greater than 0"));
        }
        if self.max_cqe_loop == 0 {
            return Err(RingmarkError::config("max_cqe_loop must be greater than 0"));
        }
        if self.provide_buffers != ProviderKind::None {
            if self.provided_buffer_count == 0 {
                return Err(RingmarkError::config(
                    "provided_buffer_count must be greater than 0",
                ));
            }
            if self.provided_buffer_count >= u16::MAX as u32 {
                return Err(RingmarkError::config(format!(
                    "provided_buffer_count {} does not fit a 16-bit buffer id",
                    self.provided_buffer_count
                )));
            }
        }
        if self.fixed_files && self.fixed_file_count == 0 {
            return Err(RingmarkError::config(
                "fixed_file_count must be greater than 0 with fixed_files",
            ));
        }
        Ok(())
    }

    /// Short summary of the options that differ from the defaults, used to
    /// label result lines.
    pub fn summary(&self) -> String {
        let base = IoUringRxConfig::default();
        let mut out = summarize_common(&self.common);
        if self.fixed_files != base.fixed_files || self.fixed_file_count != base.fixed_file_count {
            if self.fixed_files {
                out.push_str(&format!(" fixed_files=1 (count={})", self.fixed_file_count));
            } else {
                out.push_str(" fixed_files=0");
            }
        }
        if self.provide_buffers != base.provide_buffers {
            out.push_str(&format!(
                " provide_buffers={}",
                match self.provide_buffers {
                    ProviderKind::None => 0,
                    ProviderKind::Classic => 1,
                    ProviderKind::SharedRing => 2,
                }
            ));
        }
        if self.provided_buffer_count != base.provided_buffer_count {
            out.push_str(&format!(
                " provided_buffer_count={}",
                self.provided_buffer_count
            ));
        }
        if self.sqe_count != base.sqe_count {
            out.push_str(&format!(" sqe_count={}", self.sqe_count));
        }
        if self.cqe_count != base.cqe_count {
            out.push_str(&format!(" cqe_count={}", self.cqe_count));
        }
        if self.huge_pages != base.huge_pages {
            out.push_str(&format!(" huge_pages={}", self.huge_pages as u8));
        }
        if self.defer_taskrun != base.defer_taskrun {
            out.push_str(&format!(" defer_taskrun={}", self.defer_taskrun as u8));
        }
        if self.multishot_recv != base.multishot_recv {
            out.push_str(&format!(" multishot_recv={}", self.multishot_recv as u8));
        }
        out
    }

    pub fn describe(&self) -> String {
        if self.common.description.is_empty() {
            self.summary()
        } else {
            self.common.description.clone()
        }
    }
}

/// Readiness engine options.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EpollRxConfig {
    pub common: RxCommon,
    /// Defer replies to a per-loop write queue drained after dispatch.
    pub batch_send: bool,
}

impl EpollRxConfig {
    pub fn validate(&self) -> Result<()> {
        if self.common.recv_size == 0 {
            return Err(RingmarkError::config("recv_size must be greater than 0"));
        }
        if self.common.max_events == 0 {
            return Err(RingmarkError::config("max_events must be greater than 0"));
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        let base = EpollRxConfig::default();
        let mut out = summarize_common(&self.common);
        if self.batch_send != base.batch_send {
            out.push_str(&format!(" batch_send={}", self.batch_send as u8));
        }
        out
    }

    pub fn describe(&self) -> String {
        if self.common.description.is_empty() {
            self.summary()
        } else {
            self.common.description.clone()
        }
    }
}

fn summarize_common(common: &RxCommon) -> String {
    let base = RxCommon::default();
    let mut out = String::new();
    if common.recvmsg != base.recvmsg {
        out.push_str(&format!(" recvmsg={}", common.recvmsg as u8));
    }
    if common.workload != base.workload {
        out.push_str(&format!(" workload={}", common.workload));
    }
    out
}

/// A parsed `--rx` specification.
#[derive(Debug, Clone, PartialEq)]
pub enum RxSpec {
    IoUring(Box<IoUringRxConfig>),
    Epoll(EpollRxConfig),
}

impl RxSpec {
    pub fn engine_name(&self) -> &'static str {
        match self {
            RxSpec::IoUring(_) => "io_uring",
            RxSpec::Epoll(_) => "epoll",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            RxSpec::IoUring(cfg) => cfg.validate(),
            RxSpec::Epoll(cfg) => cfg.validate(),
        }
    }
}

/// Parse an `--rx` string: engine name then `key=value` tokens.
pub fn parse_rx_spec(spec: &str) -> Result<RxSpec> {
    let mut tokens = spec.split_whitespace();
    let engine = tokens
        .next()
        .ok_or_else(|| RingmarkError::config("empty rx specification"))?;

    match engine {
        "io_uring" => {
            let mut cfg = IoUringRxConfig::default();
            for token in tokens {
                let (key, value) = split_option(token)?;
                if parse_common(&mut cfg.common, key, value)? {
                    continue;
                }
                match key {
                    "supports_nonblock_accept" => {
                        cfg.supports_nonblock_accept = parse_bool(key, value)?
                    }
                    "register_ring" => cfg.register_ring = parse_bool(key, value)?,
                    "provide_buffers" => {
                        cfg.provide_buffers = ProviderKind::from_int(parse_int(key, value)?)?
                    }
                    "fixed_files" => cfg.fixed_files = parse_bool(key, value)?,
                    "sqe_count" => cfg.sqe_count = parse_int(key, value)?,
                    "cqe_count" => cfg.cqe_count = parse_int(key, value)?,
                    "max_cqe_loop" => cfg.max_cqe_loop = parse_int(key, value)?,
                    "provided_buffer_count" => {
                        cfg.provided_buffer_count = parse_int(key, value)?
                    }
                    "fixed_file_count" => cfg.fixed_file_count = parse_int(key, value)?,
                    "provided_buffer_low_watermark" => {
                        cfg.provided_buffer_low_watermark = Some(parse_int(key, value)?)
                    }
                    "provided_buffer_compact" => {
                        cfg.provided_buffer_compact = parse_bool(key, value)?
                    }
                    "huge_pages" => cfg.huge_pages = parse_bool(key, value)?,
                    "multishot_recv" => cfg.multishot_recv = parse_bool(key, value)?,
                    "defer_taskrun" => cfg.defer_taskrun = parse_bool(key, value)?,
                    other => {
                        return Err(RingmarkError::config(format!(
                            "unknown io_uring option '{other}'"
                        )))
                    }
                }
            }
            let spec = RxSpec::IoUring(Box::new(cfg));
            spec.validate()?;
            Ok(spec)
        }
        "epoll" => {
            let mut cfg = EpollRxConfig::default();
            for token in tokens {
                let (key, value) = split_option(token)?;
                if parse_common(&mut cfg.common, key, value)? {
                    continue;
                }
                match key {
                    "batch_send" => cfg.batch_send = parse_bool(key, value)?,
                    other => {
                        return Err(RingmarkError::config(format!(
                            "unknown epoll option '{other}'"
                        )))
                    }
                }
            }
            let spec = RxSpec::Epoll(cfg);
            spec.validate()?;
            Ok(spec)
        }
        other => Err(RingmarkError::config(format!(
            "unknown rx engine '{other}' (expected 'epoll' or 'io_uring')"
        ))),
    }
}

/// Parse the options shared by both engines; returns true when consumed.
fn parse_common(common: &mut RxCommon, key: &str, value: &str) -> Result<bool> {
    match key {
        "backlog" => common.backlog = parse_int::<i32>(key, value)?,
        "max_events" => common.max_events = parse_int(key, value)?,
        "recv_size" => common.recv_size = parse_int(key, value)?,
        "recvmsg" => common.recvmsg = parse_bool(key, value)?,
        "workload" => common.workload = parse_int(key, value)?,
        "description" => common.description = value.to_string(),
        _ => return Ok(false),
    }
    Ok(true)
}

fn split_option(token: &str) -> Result<(&str, &str)> {
    token.split_once('=').ok_or_else(|| {
        RingmarkError::config(format!("expected key=value, got '{token}'"))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "on" => Ok(true),
        "0" | "false" | "off" => Ok(false),
        other => Err(RingmarkError::config(format!(
            "option '{key}' expects a boolean, got '{other}'"
        ))),
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        RingmarkError::config(format!("option '{key}' expects a number, got '{value}'"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(IoUringRxConfig::default().validate().is_ok());
        assert!(EpollRxConfig::default().validate().is_ok());
    }

    #[test]
    fn test_parse_bare_engines() {
        assert!(matches!(parse_rx_spec("io_uring").unwrap(), RxSpec::IoUring(_)));
        assert!(matches!(parse_rx_spec("epoll").unwrap(), RxSpec::Epoll(_)));
    }

    #[test]
    fn test_parse_io_uring_options() {
        let spec = parse_rx_spec(
            "io_uring provide_buffers=1 fixed_files=0 sqe_count=128 \
             provided_buffer_count=512 provided_buffer_low_watermark=16 \
             multishot_recv=0 recvmsg=1 workload=50",
        )
        .unwrap();
        let RxSpec::IoUring(cfg) = spec else { panic!("wrong engine") };
        assert_eq!(cfg.provide_buffers, ProviderKind::Classic);
        assert!(!cfg.fixed_files);
        assert_eq!(cfg.sqe_count, 128);
        assert_eq!(cfg.provided_buffer_count, 512);
        assert_eq!(cfg.effective_low_watermark(), 16);
        assert!(!cfg.multishot_recv);
        assert!(cfg.common.recvmsg);
        assert_eq!(cfg.common.workload, 50);
    }

    #[test]
    fn test_parse_epoll_options() {
        let spec = parse_rx_spec("epoll batch_send=1 recv_size=8192").unwrap();
        let RxSpec::Epoll(cfg) = spec else { panic!("wrong engine") };
        assert!(cfg.batch_send);
        assert_eq!(cfg.common.recv_size, 8192);
    }

    #[test]
    fn test_watermark_defaults_to_quarter() {
        let cfg = IoUringRxConfig::default();
        assert_eq!(cfg.effective_low_watermark(), cfg.provided_buffer_count / 4);
    }

    #[test]
    fn test_cqe_count_defaults_to_multiple() {
        let cfg = IoUringRxConfig::default();
        assert_eq!(cfg.effective_cqe_count(), 128 * cfg.sqe_count);
    }

    #[test]
    fn test_rejects_unknown_engine_and_options() {
        assert!(parse_rx_spec("kqueue").is_err());
        assert!(parse_rx_spec("io_uring frobnicate=1").is_err());
        assert!(parse_rx_spec("epoll provide_buffers=2").is_err());
        assert!(parse_rx_spec("io_uring sqe_count=zero").is_err());
        assert!(parse_rx_spec("io_uring sqe_count").is_err());
    }

    #[test]
    fn test_rejects_oversized_pool() {
        assert!(parse_rx_spec("io_uring provided_buffer_count=70000").is_err());
    }

    #[test]
    fn test_max_cqe_loop_bounds() {
        assert!(parse_rx_spec("io_uring max_cqe_loop=0").is_err());
        let RxSpec::IoUring(cfg) = parse_rx_spec("io_uring max_cqe_loop=128").unwrap() else {
            unreachable!()
        };
        assert_eq!(cfg.max_cqe_loop, 128);
    }

    #[test]
    fn test_summary_lists_only_non_defaults() {
        let RxSpec::IoUring(cfg) = parse_rx_spec("io_uring").unwrap() else { unreachable!() };
        assert!(cfg.summary().is_empty());
        let RxSpec::IoUring(cfg) =
            parse_rx_spec("io_uring provide_buffers=0 sqe_count=256").unwrap()
        else {
            unreachable!()
        };
        let s = cfg.summary();
        assert!(s.contains("provide_buffers=0"));
        assert!(s.contains("sqe_count=256"));
        assert!(!s.contains("fixed_files"));
    }
}
