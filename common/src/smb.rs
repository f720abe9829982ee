//! SMB transaction
//!
//! A transaction copies the input file to a remote directory, copies it back, deletes the remote
//! copy and lists the directory. The first three steps must succeed; the listing is only traced.

use anyhow::{Result, anyhow};
use tracing::instrument;

use crate::command::{CommandLine, run_command};
use crate::lab::{Case, Tools};
use crate::log::LogWriter;
use crate::testfile::Fixture;

#[derive(Debug, Clone, Copy, Default)]
pub struct Timings {
    pub copy_to: std::time::Duration,
    pub copy_from: std::time::Duration,
    pub remove: std::time::Duration,
    pub list: std::time::Duration,
}

impl Timings {
    pub fn total(&self) -> std::time::Duration {
        self.copy_to + self.copy_from + self.remove + self.list
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Settings {
    /// Compare the downloaded file with the input
    pub verify: bool,
}

async fn timed(command: CommandLine, log: &LogWriter) -> Result<(bool, std::time::Duration)> {
    let start = std::time::Instant::now();
    let outcome = run_command(&command, log).await?;
    Ok((outcome.success(), start.elapsed()))
}

#[instrument(skip_all, fields(case = %case.descr))]
pub async fn transaction(
    case: &Case,
    fixture: &Fixture,
    tools: &Tools,
    log: &LogWriter,
    settings: &Settings,
) -> Result<Timings> {
    let remote = fixture.remote_path(&case.dir);
    let input = fixture.input.display().to_string();
    let output = fixture.output.display().to_string();
    log.write(&format!("Running {}\n\n", case.descr)).await?;
    log.flush().await?;
    let mut timings = Timings::default();

    let (ok, elapsed) = timed(
        CommandLine::new(&tools.smbcp).args([input.as_str(), remote.as_str()]),
        log,
    )
    .await?;
    if !ok {
        return Err(anyhow!("Could not copy {} to {}", input, case.dir));
    }
    timings.copy_to = elapsed;

    let (ok, elapsed) = timed(
        CommandLine::new(&tools.smbcp).args([remote.as_str(), output.as_str()]),
        log,
    )
    .await?;
    if !ok {
        return Err(anyhow!(
            "Could not copy {} from {}",
            crate::testfile::INPUT_FILENAME,
            case.dir
        ));
    }
    timings.copy_from = elapsed;

    let (ok, elapsed) = timed(CommandLine::new(&tools.smbrm).arg(remote.as_str()), log).await?;
    if !ok {
        return Err(anyhow!(
            "Could not delete {} from {}",
            crate::testfile::INPUT_FILENAME,
            case.dir
        ));
    }
    timings.remove = elapsed;

    let (_, elapsed) = timed(CommandLine::new(&tools.smbls).arg(case.dir.as_str()), log).await?;
    timings.list = elapsed;

    if settings.verify {
        let sent = tokio::fs::read(&fixture.input).await?;
        let received = tokio::fs::read(&fixture.output).await?;
        if sent != received {
            return Err(anyhow!("Downloaded file differs from {}", input));
        }
    }

    log.write(&format!(
        "Test {} Completed in {:.2} seconds\n  Copy to {:.2} seconds\n  Copy from {:.2} seconds\n  Remove {:.2} seconds\n  List {:.2} seconds\n",
        case.descr,
        timings.total().as_secs_f64(),
        timings.copy_to.as_secs_f64(),
        timings.copy_from.as_secs_f64(),
        timings.remove.as_secs_f64(),
        timings.list.as_secs_f64(),
    ))
    .await?;
    log.flush().await?;
    Ok(timings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lab::Requirement;
    use std::os::unix::fs::PermissionsExt;

    fn case(dir: &std::path::Path) -> Case {
        Case {
            descr: "DFS Domain".to_string(),
            dir: dir.join("share").display().to_string(),
            requires: Requirement::Any,
        }
    }

    fn script(dir: &std::path::Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    /// Tools that operate on a local directory standing in for the share.
    fn local_tools() -> Tools {
        Tools {
            smbcp: "cp".to_string(),
            smbls: "ls".to_string(),
            smbrm: "rm".to_string(),
            klist: "true".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_transaction_is_traced_and_timed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("share"))?;
        let log = LogWriter::create(&dir.path().join("run.log")).await?;
        let fixture = Fixture::setup(dir.path(), 64).await?;
        let case = case(dir.path());
        transaction(
            &case,
            &fixture,
            &local_tools(),
            &log,
            &Settings { verify: true },
        )
        .await?;
        // remote copy was removed again, downloaded copy is present
        assert!(!dir.path().join("share").join("test_input_file.txt").exists());
        assert!(fixture.output.exists());
        let contents = tokio::fs::read_to_string(log.path()).await?;
        assert!(contents.starts_with("Running DFS Domain\n\n"));
        assert_eq!(contents.matches("result: 0\n").count(), 4);
        assert!(contents.contains("Test DFS Domain Completed in "));
        assert!(contents.contains("  Copy from "));
        assert!(contents.contains("  List "));
        Ok(())
    }

    #[tokio::test]
    async fn failing_copy_stops_transaction() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = LogWriter::create(&dir.path().join("run.log")).await?;
        let fixture = Fixture::setup(dir.path(), 64).await?;
        let case = case(dir.path());
        let tools = Tools {
            smbcp: script(dir.path(), "smbcp", "echo 'NT_STATUS_HOST_UNREACHABLE' >&2; exit 1"),
            smbls: "true".to_string(),
            smbrm: "true".to_string(),
            klist: "true".to_string(),
        };
        let error = transaction(&case, &fixture, &tools, &log, &Settings::default())
            .await
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            format!("Could not copy {} to {}", fixture.input.display(), case.dir)
        );
        let contents = tokio::fs::read_to_string(log.path()).await?;
        assert!(contents.contains("NT_STATUS_HOST_UNREACHABLE"));
        assert!(contents.contains("result: 1\n"));
        assert!(!contents.contains("Completed in"));
        Ok(())
    }

    #[tokio::test]
    async fn failing_remove_is_reported() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = LogWriter::create(&dir.path().join("run.log")).await?;
        let fixture = Fixture::setup(dir.path(), 64).await?;
        let case = case(dir.path());
        let tools = Tools {
            smbcp: "true".to_string(),
            smbls: "true".to_string(),
            smbrm: "false".to_string(),
            klist: "true".to_string(),
        };
        let error = transaction(&case, &fixture, &tools, &log, &Settings::default())
            .await
            .unwrap_err();
        assert_eq!(
            error.to_string(),
            format!("Could not delete test_input_file.txt from {}", case.dir)
        );
        Ok(())
    }

    #[tokio::test]
    async fn listing_failure_is_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = LogWriter::create(&dir.path().join("run.log")).await?;
        let fixture = Fixture::setup(dir.path(), 64).await?;
        let tools = Tools {
            smbcp: "true".to_string(),
            smbls: "false".to_string(),
            smbrm: "true".to_string(),
            klist: "true".to_string(),
        };
        transaction(&case(dir.path()), &fixture, &tools, &log, &Settings::default()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn verify_detects_corrupted_download() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir(dir.path().join("share"))?;
        let log = LogWriter::create(&dir.path().join("run.log")).await?;
        let fixture = Fixture::setup(dir.path(), 64).await?;
        // "download" writes different contents to the output path
        let tools = Tools {
            smbcp: script(dir.path(), "smbcp", "echo garbage > \"$2\""),
            smbls: "true".to_string(),
            smbrm: "true".to_string(),
            klist: "true".to_string(),
        };
        let error = transaction(
            &case(dir.path()),
            &fixture,
            &tools,
            &log,
            &Settings { verify: true },
        )
        .await
        .unwrap_err();
        assert!(error.to_string().starts_with("Downloaded file differs"));
        Ok(())
    }
}
