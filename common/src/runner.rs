//! Regression runner
//!
//! Runs the case table of a [`Lab`] either against a fixed availability (`--online`) or through a
//! matrix of firewall scenarios driven by the firewall controller.

use anyhow::Result;
use tracing::instrument;

use crate::client::ControllerClient;
use crate::lab::{Availability, Case, Lab, Scenario};
use crate::log::LogWriter;
use crate::testfile::Fixture;

/// How the firewall controller is started for each scenario.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub program: std::path::PathBuf,
    pub args: Vec<String>,
    pub shutdown_timeout: std::time::Duration,
}

#[derive(Debug, Clone)]
pub enum Mode {
    /// The topology is managed by someone else, `label` is what the user passed to `--online`.
    Static {
        availability: Availability,
        label: String,
    },
    Matrix {
        scenarios: Vec<Scenario>,
        controller: ControllerSettings,
    },
}

#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub fail_early: bool,
    /// Only run cases whose description contains this (case-insensitive)
    pub case_filter: Option<String>,
    /// Echo `Running`/`Skipping` lines to stdout
    pub echo: bool,
    pub smb: crate::smb::Settings,
}

#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub scenarios: usize,
    /// Scenarios whose firewall setup was rejected; their cases did not run
    pub scenarios_failed: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration: std::time::Duration,
    /// `<scenario>: <case>: <error>` for every failed case, `<scenario>: <error>` for failed setups
    pub failures: Vec<String>,
}

impl Summary {
    pub fn success(&self) -> bool {
        self.failed == 0 && self.scenarios_failed == 0
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(mut self, other: Self) -> Self {
        self.scenarios += other.scenarios;
        self.scenarios_failed += other.scenarios_failed;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.duration += other.duration;
        self.failures.extend(other.failures);
        self
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "scenarios run: {}", self.scenarios)?;
        writeln!(f, "scenarios failed: {}", self.scenarios_failed)?;
        writeln!(f, "cases passed: {}", self.passed)?;
        writeln!(f, "cases failed: {}", self.failed)?;
        writeln!(f, "cases skipped: {}", self.skipped)?;
        write!(f, "time spent in transactions: {:.2?}", self.duration)?;
        for failure in &self.failures {
            write!(f, "\n  FAILED {}", failure)?;
        }
        Ok(())
    }
}

fn selected<'a>(lab: &'a Lab, settings: &Settings) -> impl Iterator<Item = &'a Case> {
    let filter = settings.case_filter.as_ref().map(|f| f.to_lowercase());
    lab.cases.iter().filter(move |case| match &filter {
        Some(filter) => case.descr.to_lowercase().contains(filter),
        None => true,
    })
}

/// Run the cases `availability` can serve. Returns the summary and whether to stop early.
#[instrument(skip(lab, availability, fixture, log, settings))]
async fn run_cases(
    lab: &Lab,
    availability: &Availability,
    label: &str,
    fixture: &Fixture,
    log: &LogWriter,
    settings: &Settings,
) -> Result<(Summary, bool)> {
    let mut summary = Summary {
        scenarios: 1,
        ..Default::default()
    };
    for case in selected(lab, settings) {
        if !availability.satisfies(&case.requires) {
            let msg = format!("Skipping {}, not part of {}", case.descr, label);
            tracing::info!("{}", msg);
            if settings.echo {
                println!("{}", msg);
            }
            log.write(&format!("{}\n\n", msg)).await?;
            summary.skipped += 1;
            continue;
        }
        tracing::info!("Running {}", case.descr);
        if settings.echo {
            println!("Running {}", case.descr);
        }
        match crate::smb::transaction(case, fixture, &lab.tools, log, &settings.smb).await {
            Ok(timings) => {
                summary.passed += 1;
                summary.duration += timings.total();
            }
            Err(error) => {
                tracing::error!("{}: {:#}", case.descr, error);
                if settings.echo {
                    println!("{:#}", error);
                }
                log.write(&format!("FAILED {}: {:#}\n\n", case.descr, error))
                    .await?;
                log.flush().await?;
                summary.failed += 1;
                summary
                    .failures
                    .push(format!("{}: {}: {:#}", label, case.descr, error));
                if settings.fail_early {
                    return Ok((summary, true));
                }
            }
        }
    }
    Ok((summary, false))
}

async fn run_scenario(
    lab: &Lab,
    scenario: &Scenario,
    controller: &ControllerSettings,
    fixture: &Fixture,
    log: &LogWriter,
    settings: &Settings,
) -> Result<(Summary, bool)> {
    tracing::info!("scenario: deny {}", scenario);
    let label = format!("deny {}", scenario);
    let mut client = ControllerClient::spawn(&controller.program, &controller.args, log)?;
    if let Err(error) = client
        .setup(scenario, &lab.dfs_cache, controller.shutdown_timeout)
        .await
    {
        tracing::error!("{}: {:#}", label, error);
        if settings.echo {
            println!("{:#}", error);
        }
        log.write(&format!("\nFAILED {}: {:#}\n\n", label, error))
            .await?;
        client
            .teardown(scenario, controller.shutdown_timeout)
            .await?;
        let summary = Summary {
            scenarios: 1,
            scenarios_failed: 1,
            failures: vec![format!("{}: {:#}", label, error)],
            ..Default::default()
        };
        return Ok((summary, settings.fail_early));
    }
    let availability = scenario.availability(lab);
    // teardown must run even when the cases fail, so the firewall is never left closed
    let result = run_cases(lab, &availability, &label, fixture, log, settings).await;
    client
        .teardown(scenario, controller.shutdown_timeout)
        .await?;
    result
}

/// Write the transcript header for a run.
pub async fn write_header(log: &LogWriter, mode: &Mode) -> Result<()> {
    let target = match mode {
        Mode::Static { label, .. } => label.clone(),
        Mode::Matrix { scenarios, .. } => scenarios
            .iter()
            .map(|scenario| scenario.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    };
    log.write(&format!(
        "Openfiles Regression Results with {}\ndfsreg {}\n",
        target,
        crate::version::BuildVersion::current().display()
    ))
    .await?;
    log.flush().await
}

/// Run the lab's case table in `mode`.
///
/// Case failures and rejected firewall setups are counted in the summary, errors are only
/// returned when the harness itself cannot continue (transcript unwritable, controller cannot be
/// started).
pub async fn run(
    lab: &Lab,
    mode: &Mode,
    fixture: &Fixture,
    log: &LogWriter,
    settings: &Settings,
) -> Result<Summary> {
    match mode {
        Mode::Static {
            availability,
            label,
        } => {
            let (summary, _) = run_cases(lab, availability, label, fixture, log, settings).await?;
            Ok(summary)
        }
        Mode::Matrix {
            scenarios,
            controller,
        } => {
            let mut total = Summary::default();
            for scenario in scenarios {
                let (summary, stop) =
                    run_scenario(lab, scenario, controller, fixture, log, settings).await?;
                total = total + summary;
                if stop {
                    tracing::warn!("stopping after first failure");
                    break;
                }
            }
            Ok(total)
        }
    }
}
