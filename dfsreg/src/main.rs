use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "dfsreg",
    version,
    about = "DFS failover regression - run SMB transactions while namespace servers are offline",
    long_about = "`dfsreg` copies a test file to every remote directory in the lab's case table, copies \
it back, deletes it and lists the directory. Cases are only run when the domain controllers they \
need are reachable.

By default each firewall scenario (no host denied, then each host denied in turn) is set up by \
driving `dfsfw`, and every compatible case is run under it. With --online the firewall is left \
alone and cases are selected for the stated topology.

EXAMPLE:
    # Full matrix against the built-in lab, with a summary
    dfsreg --summary

    # Cloud lab, only spiritdcb is up (managed outside dfsreg)
    dfsreg --config labs/aws.toml --online spiritdcb

The transcript of every command run is written to --log. Exit status is 0 when every case that \
ran passed."
)]
struct Args {
    // Lab
    /// Lab configuration file (TOML), defaults to the built-in lab
    #[arg(short = 'c', long, value_name = "PATH", help_heading = "Lab")]
    config: Option<std::path::PathBuf>,

    /// Size of the generated test file, overrides the lab's `file_size`
    ///
    /// Accepts sizes with suffixes, e.g. "1KiB", "768KiB", "1MB".
    #[arg(long, value_name = "SIZE", help_heading = "Lab")]
    file_size: Option<String>,

    // Scenarios
    /// Do not drive the firewall, assume this topology: any | both | <host>
    #[arg(long, value_name = "TOPOLOGY", conflicts_with_all = ["scenario", "firewall_bin", "firewall_arg"], help_heading = "Scenarios")]
    online: Option<String>,

    /// Firewall scenario to run: none | <host> (can be specified multiple times)
    ///
    /// Defaults to `none` followed by every host of the lab.
    #[arg(long, value_name = "SCENARIO", action = clap::ArgAction::Append, help_heading = "Scenarios")]
    scenario: Vec<String>,

    /// Only run cases whose description contains this text (case-insensitive)
    #[arg(long = "case", value_name = "TEXT", help_heading = "Scenarios")]
    case_filter: Option<String>,

    /// Stop at the first failed case
    #[arg(short = 'e', long = "fail-early", help_heading = "Scenarios")]
    fail_early: bool,

    /// Compare the downloaded copy with the uploaded file
    #[arg(long, help_heading = "Scenarios")]
    verify: bool,

    // Firewall controller
    /// Firewall controller binary, defaults to `dfsfw` next to this executable or in PATH
    ///
    /// It is started with `--config` (when given) followed by every --firewall-arg.
    #[arg(long, value_name = "PATH", help_heading = "Firewall controller")]
    firewall_bin: Option<std::path::PathBuf>,

    /// Extra argument for the firewall controller (can be specified multiple times)
    #[arg(long, value_name = "ARG", action = clap::ArgAction::Append, allow_hyphen_values = true, help_heading = "Firewall controller")]
    firewall_arg: Vec<String>,

    /// How long to wait for the firewall controller to confirm a scenario's setup, and to exit
    /// after `quit`
    ///
    /// This option accepts a human readable duration, e.g. "500ms", "30s", "1min" etc.
    #[arg(
        long,
        default_value = "30s",
        value_name = "DELAY",
        help_heading = "Firewall controller"
    )]
    shutdown_timeout: String,

    // Progress & output
    /// Transcript file, truncated at start
    #[arg(
        short = 'l',
        long,
        default_value = "of_regression.log",
        value_name = "PATH",
        help_heading = "Progress & output"
    )]
    log: std::path::PathBuf,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,
}

fn build_mode(args: &Args, lab: &common::lab::Lab) -> Result<common::runner::Mode> {
    if let Some(online) = &args.online {
        return Ok(common::runner::Mode::Static {
            availability: lab.parse_online(online)?,
            label: online.clone(),
        });
    }
    let scenarios = if args.scenario.is_empty() {
        lab.default_scenarios()
    } else {
        args.scenario
            .iter()
            .map(|text| lab.parse_scenario(text))
            .collect::<Result<Vec<_>, _>>()?
    };
    let program = match &args.firewall_bin {
        Some(program) => program.clone(),
        None => common::client::find_controller_binary()?,
    };
    // the controller must see the same lab
    let mut controller_args = vec![];
    if let Some(config) = &args.config {
        controller_args.push("--config".to_string());
        controller_args.push(config.display().to_string());
    }
    controller_args.extend(args.firewall_arg.iter().cloned());
    let shutdown_timeout = humantime::parse_duration(&args.shutdown_timeout)
        .with_context(|| format!("invalid --shutdown-timeout '{}'", args.shutdown_timeout))?;
    Ok(common::runner::Mode::Matrix {
        scenarios,
        controller: common::runner::ControllerSettings {
            program,
            args: controller_args,
            shutdown_timeout,
        },
    })
}

#[instrument]
async fn async_main(args: Args) -> Result<common::runner::Summary> {
    let mut lab = common::lab::Lab::load_or_builtin(args.config.as_deref())?;
    if let Some(file_size) = &args.file_size {
        file_size
            .parse::<bytesize::ByteSize>()
            .map_err(|error| anyhow!("invalid --file-size '{}': {}", file_size, error))?;
        lab.file_size = file_size.clone();
    }
    let mode = build_mode(&args, &lab)?;
    let log = common::log::LogWriter::create(&args.log).await?;
    common::runner::write_header(&log, &mode).await?;
    common::auth::check_authenticated(&lab.tools.klist, &log).await?;
    let fixture = common::testfile::Fixture::setup(&lab.workdir, lab.file_size_bytes()?).await?;
    let settings = common::runner::Settings {
        fail_early: args.fail_early,
        case_filter: args.case_filter.clone(),
        echo: !args.quiet,
        smb: common::smb::Settings {
            verify: args.verify,
        },
    };
    let result = common::runner::run(&lab, &mode, &fixture, &log, &settings).await;
    if let Err(error) = fixture.cleanup().await {
        tracing::warn!("failed to remove test files: {:#}", error);
    }
    let summary = result?;
    log.write(&format!("\n{}\n", summary)).await?;
    log.flush().await?;
    if !summary.success() {
        if args.summary || args.verbose > 0 {
            return Err(anyhow!("dfsreg encountered failures\n\n{}", &summary));
        }
        return Err(anyhow!(
            "dfsreg encountered failures: {} of {} cases failed",
            summary.failed,
            summary.passed + summary.failed
        ));
    }
    Ok(summary)
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
        print_summary: args.summary || args.verbose > 0,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
