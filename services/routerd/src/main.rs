//! `plexusd` — the Plexus router daemon binary
//!
//! Runs one daemon on the calling thread until SIGINT/SIGTERM. All state
//! is in-memory; a restarted daemon relearns its registry from actor
//! birth and subscribe traffic.

use anyhow::Context;
use clap::Parser;
use config::RouterConfig;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use routerd::Daemon;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};
use tracing_subscriber::EnvFilter;

/// Plexus message router daemon
#[derive(Parser, Debug)]
#[command(name = "plexusd", disable_version_flag = true)]
struct Args {
    /// Routing domain name
    #[arg(short = 'd', value_name = "DOMAIN")]
    domain: Option<String>,

    /// Local listen address (e.g. unix:///tmp/plexusd.sock)
    #[arg(short = 'u', value_name = "LOCALURL")]
    local_url: Option<String>,
}

/// Termination pipe descriptor for the signal handler
static TERM_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_signal(_signo: i32) {
    // Only async-signal-safe work here: one write(2) to the pipe
    let fd = TERM_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let fd = unsafe { BorrowedFd::borrow_raw(fd as RawFd) };
        let _ = nix::unistd::write(fd, b"x");
    }
}

fn install_signal_handlers() -> anyhow::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let mut cfg = RouterConfig::default();
    if let Some(domain) = args.domain {
        cfg.domain = domain;
    }
    if let Some(url) = args.local_url {
        cfg.local_url = url;
    }

    let daemon = Daemon::new(cfg).context("starting router daemon")?;
    let handle = daemon.handle();
    TERM_FD.store(handle.raw_fd(), Ordering::SeqCst);
    install_signal_handlers()?;

    daemon.run();
    Ok(())
}
