//! Command-line surface and receiver construction.

use clap::Parser;
use tracing::info;

use crate::config::{parse_rx_spec, RxSpec};
use crate::engine::{EpollEngine, Runner, UringEngine};
use crate::error::{Result, RingmarkError};
use crate::socket::{mk_server_sock, ListenSock, PortPicker};

/// TCP receiver-engine benchmark: io_uring vs epoll under one wire
/// protocol, one thread per receiver.
#[derive(Parser, Debug)]
#[command(name = "ringmark", version, about)]
pub struct Cli {
    /// Receiver engine to run, with options (repeatable).
    /// E.g. "io_uring provide_buffers=1 multishot_recv=0" or "epoll batch_send=1".
    #[arg(long)]
    pub rx: Vec<String>,

    /// Sender scenario (repeatable). Senders are external to this tool;
    /// accepted for compatibility and rejected unless --server_only.
    #[arg(long)]
    pub tx: Vec<String>,

    /// Pin listen ports (receivers take them in order).
    #[arg(long = "use_port", num_args = 1..)]
    pub use_port: Vec<u16>,

    /// Control-plane port. The control plane is not part of this build.
    #[arg(long = "control_port")]
    pub control_port: Option<u16>,

    /// Only run receivers; any --tx scenarios are dropped.
    #[arg(long = "server_only")]
    pub server_only: bool,

    /// Only run senders. Unsupported: senders are external to this tool.
    #[arg(long = "client_only")]
    pub client_only: bool,

    /// Peer host for sender transport (external senders).
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Use IPv6 listeners.
    #[arg(long)]
    pub v6: bool,

    /// Sender run time in seconds (external senders).
    #[arg(long, default_value_t = 10)]
    pub time: u64,

    /// Repeat the receiver list this many times.
    #[arg(long, default_value_t = 1)]
    pub runs: u32,

    /// Emit per-second receiver stat lines.
    #[arg(long = "print_rx_stats", default_value_t = true, action = clap::ArgAction::Set)]
    pub print_rx_stats: bool,

    /// Include the reads-per-loop histogram in stat lines.
    #[arg(long = "print_read_stats", default_value_t = true, action = clap::ArgAction::Set)]
    pub print_read_stats: bool,

    /// Diagnostic logging.
    #[arg(long)]
    pub verbose: bool,
}

/// Validated run plan: every receiver spec, already multiplied by --runs.
#[derive(Debug)]
pub struct RunPlan {
    pub rx: Vec<RxSpec>,
    pub use_port: Vec<u16>,
    pub v6: bool,
    pub print_rx_stats: bool,
    pub print_read_stats: bool,
}

impl Cli {
    /// Validate the flags into a run plan.
    pub fn into_plan(mut self) -> Result<RunPlan> {
        if self.runs == 0 {
            return Err(RingmarkError::config("--runs must be at least 1"));
        }
        if self.server_only && self.client_only {
            return Err(RingmarkError::config(
                "--server_only and --client_only are mutually exclusive",
            ));
        }
        if self.server_only {
            self.tx.clear();
        }
        if self.client_only {
            return Err(RingmarkError::config(
                "--client_only needs the sender side, which is external to this \
                 tool; point an external load generator at a ringmark server instead",
            ));
        }
        if !self.tx.is_empty() {
            return Err(RingmarkError::config(
                "sender scenarios are external to this tool; drop --tx (or pass \
                 --server_only) and drive the advertised ports with an external \
                 load generator",
            ));
        }
        if self.control_port.is_some() {
            tracing::warn!("the control plane is not part of this build; --control_port ignored");
        }

        let rx_strings = if self.rx.is_empty() {
            vec!["io_uring".to_string(), "epoll".to_string()]
        } else {
            self.rx
        };
        let mut rx = Vec::new();
        for _ in 0..self.runs {
            for s in &rx_strings {
                rx.push(parse_rx_spec(s)?);
            }
        }

        Ok(RunPlan {
            rx,
            use_port: self.use_port,
            v6: self.v6,
            print_rx_stats: self.print_rx_stats,
            print_read_stats: self.print_read_stats,
        })
    }
}

/// A constructed receiver, ready to run on its own thread.
pub struct Receiver {
    pub runner: Box<dyn Runner>,
    pub port: u16,
    pub name: String,
    pub cfg_summary: String,
}

/// Build every receiver in the plan: pick a port, construct the engine,
/// bind and hand over the listening socket.
pub fn build_receivers(plan: &RunPlan) -> Result<Vec<Receiver>> {
    let mut picker = PortPicker::new(&plan.use_port);
    let mut receivers = Vec::with_capacity(plan.rx.len());
    for spec in &plan.rx {
        let port = picker.pick(plan.v6)?;
        let name = format!("{} port={}", spec.engine_name(), port);
        let (mut runner, backlog, sock_flags, summary): (Box<dyn Runner>, i32, i32, String) =
            match spec {
                RxSpec::IoUring(cfg) => {
                    // Accepting from io_uring wants a blocking listener
                    // unless the accept4 drain is in play.
                    let flags = if cfg.supports_nonblock_accept {
                        libc::SOCK_NONBLOCK
                    } else {
                        0
                    };
                    let engine = UringEngine::new(
                        (**cfg).clone(),
                        name.clone(),
                        plan.print_rx_stats,
                        plan.print_read_stats,
                    )?;
                    (Box::new(engine), cfg.common.backlog, flags, cfg.describe())
                }
                RxSpec::Epoll(cfg) => {
                    let engine = EpollEngine::new(
                        cfg.clone(),
                        name.clone(),
                        plan.print_rx_stats,
                        plan.print_read_stats,
                    )?;
                    (
                        Box::new(engine),
                        cfg.common.backlog,
                        libc::SOCK_NONBLOCK,
                        cfg.describe(),
                    )
                }
            };

        let fd = mk_server_sock(port, plan.v6, backlog, sock_flags)?;
        runner.add_listen_sock(ListenSock::new(fd, plan.v6))?;
        info!("{} rx_cfg={}", name, summary);
        receivers.push(Receiver {
            runner,
            port,
            name,
            cfg_summary: summary,
        });
    }
    Ok(receivers)
}
