//! Common library for the DFS failover regression tools
//!
//! Two binaries are built on top of this crate:
//!
//! - **dfsfw** - interactive firewall controller that cuts a DFS namespace server off the network
//!   and optionally brings it back on a timer
//! - **dfsreg** - regression runner that drives `dfsfw` through a matrix of failure scenarios and
//!   checks that SMB transactions succeed against every path the current topology can serve
//!
//! # Lab topology
//!
//! The set of namespace servers and the test cases are described by a [`lab::Lab`], loaded from a
//! TOML file or taken from the built-in lab. See the [`lab`] module.
//!
//! # Firewall control
//!
//! [`firewall::Firewall`] abstracts the host firewall (`iptables` or `ufw`) and
//! [`controller::Controller`] implements the line-oriented command loop that `dfsfw` exposes on
//! stdin/stdout. The regression runner talks to it through [`client::ControllerClient`].
//!
//! # Transcript
//!
//! Everything the runner does is appended to a single transcript file through [`log::LogWriter`].
//! Diagnostics go to stderr through `tracing` and are controlled by `-v` / `RUST_LOG`.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub mod auth;
pub mod client;
pub mod command;
pub mod config;
pub mod controller;
pub mod firewall;
pub mod lab;
pub mod log;
pub mod runner;
pub mod smb;
pub mod testfile;
pub mod version;

pub use config::{OutputConfig, RuntimeConfig};

fn init_tracing(output: &OutputConfig) {
    let filter = if std::env::var_os("RUST_LOG").is_some() && !output.quiet {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::default().add_directive(output.level().into())
    };
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    // a subscriber may already be installed when several runs share a process (tests)
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init();
}

fn build_runtime(runtime: &RuntimeConfig) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    Ok(builder.build()?)
}

/// Run `func` on a fresh tokio runtime with logging configured from `output`.
///
/// Returns `None` if the future failed; the error has been reported on stderr unless `quiet` is
/// set. On success the summary is printed to stdout when `print_summary` is set.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: Future<Output = Result<Summary>>,
{
    init_tracing(&output);
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            if !output.quiet {
                eprintln!("failed to start tokio runtime: {:#}", error);
            }
            return None;
        }
    };
    let res = runtime.block_on(func());
    match res {
        Ok(summary) => {
            if output.print_summary {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{:#}", error);
            }
            None
        }
    }
}
