use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dfsfw",
    version,
    about = "Take DFS namespace servers off the network for failover testing",
    long_about = "`dfsfw` reads commands from stdin, one per line, and adds or removes host firewall rules \
that drop traffic from the lab's domain controllers.

COMMANDS:
    quit                    reset the firewall and exit (also on end of input)
    reset                   allow every host and stop all toggling
    status                  print the firewall listing
    state                   print the host table
    help                    print the command list
    deny <host> [-toggle]   drop traffic from host, optionally flip it every --interval
    allow <host>            allow traffic from host and stop toggling it
    sync [token]            print `sync <token>` once every earlier command is done

EXAMPLE:
    # Interactive session against the built-in lab
    sudo dfsfw
    dfsfw: deny intuition -toggle

Note: firewall commands run through sudo unless --no-sudo is given."
)]
struct Args {
    // Lab
    /// Lab configuration file (TOML), defaults to the built-in lab
    #[arg(short = 'c', long, value_name = "PATH", help_heading = "Lab")]
    config: Option<std::path::PathBuf>,

    // Firewall
    /// Firewall backend, defaults to the one named in the lab configuration
    #[arg(long, value_name = "BACKEND", help_heading = "Firewall")]
    backend: Option<common::firewall::Backend>,

    /// Firewall program to run instead of `iptables`/`ufw`
    #[arg(long, value_name = "PATH", help_heading = "Firewall")]
    program: Option<String>,

    /// Do not prefix firewall commands with sudo
    #[arg(long, help_heading = "Firewall")]
    no_sudo: bool,

    /// Delay between state flips of hosts denied with -toggle
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "5s", "1min" etc.
    #[arg(
        long,
        default_value = "5s",
        value_name = "DELAY",
        help_heading = "Firewall"
    )]
    interval: String,

    // Progress & output
    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print the final host table on exit
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "1",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,
}

#[instrument]
async fn async_main(args: Args) -> Result<String> {
    let lab = common::lab::Lab::load_or_builtin(args.config.as_deref())?;
    let interval = humantime::parse_duration(&args.interval)
        .with_context(|| format!("invalid --interval '{}'", args.interval))?;
    if interval.is_zero() {
        anyhow::bail!("--interval must be greater than zero");
    }
    let backend = args.backend.unwrap_or(lab.firewall);
    tracing::info!(
        "controlling {} with {} (toggle every {:?})",
        lab.host_names().join(", "),
        backend,
        interval
    );
    let firewall = common::firewall::SystemFirewall::new(backend, args.program, !args.no_sudo);
    let mut controller =
        common::controller::Controller::new(firewall, &lab.hosts, tokio::io::stdout());
    if std::io::stdin().is_terminal() {
        controller = controller.with_prompt("dfsfw: ");
    }
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    controller.run(input, interval).await?;
    let table = controller
        .hosts()
        .iter()
        .map(|host| format!("{} {} {}", host.name, host.ip, host.state))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(table)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        // stdout carries the command protocol, so -v does not imply the summary here
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: 0,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
