use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ringmark::cli::{build_receivers, Cli};
use ringmark::engine::install_sigint_handler;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let plan = match cli.into_plan() {
        Ok(plan) => plan,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    install_sigint_handler();

    let receivers = match build_receivers(&plan) {
        Ok(r) => r,
        Err(e) => {
            error!("{e}");
            return 1;
        }
    };

    info!("using receivers:");
    for r in &receivers {
        info!("  {} rx_cfg={}", r.name, r.cfg_summary);
    }
    let ports: Vec<String> = receivers.iter().map(|r| r.port.to_string()).collect();
    info!(
        "drive ports [{}] with an external load generator speaking the frame protocol",
        ports.join(", ")
    );

    let mut threads = Vec::with_capacity(receivers.len());
    for receiver in receivers {
        // Each engine gets its own shutdown flag in addition to the
        // process-wide one the signal handler flips.
        let shutdown = Arc::new(AtomicBool::new(false));
        let name = receiver.name.clone();
        let mut runner = receiver.runner;
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name(format!("rcv {name}"))
            .spawn(move || runner.run(&flag));
        match handle {
            Ok(h) => threads.push((name, h)),
            Err(e) => {
                error!("failed to spawn receiver thread for {name}: {e}");
                return 1;
            }
        }
    }

    let mut code = 0;
    for (name, handle) in threads {
        match handle.join() {
            Ok(Ok(())) => info!("{name}: done"),
            Ok(Err(e)) => {
                error!("{name}: {e}");
                code = 1;
            }
            Err(_) => {
                error!("{name}: receiver thread panicked");
                code = 1;
            }
        }
    }
    code
}
