//! Driving the firewall controller from the regression runner
//!
//! The controller runs as a child process. Commands are written to its stdin one line at a time
//! and everything it prints is copied into the transcript by a background task as it arrives,
//! so the transcript shows firewall state changes interleaved with the transactions they affect.
//! The same lines are handed back to the client, which uses `sync` to wait until the controller
//! has applied a scenario and to see whether any command was rejected.

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::controller::{is_error_reply, sync_reply};
use crate::lab::Scenario;
use crate::log::LogWriter;

pub const DEFAULT_SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub const CONTROLLER_BINARY: &str = "dfsfw";

/// Locate the `dfsfw` binary: next to the running executable first (same build), then `PATH`.
pub fn find_controller_binary() -> Result<std::path::PathBuf> {
    let mut searched_paths = Vec::new();
    if let Ok(current_exe) = std::env::current_exe()
        && let Some(bin_dir) = current_exe.parent()
    {
        let path = bin_dir.join(CONTROLLER_BINARY);
        searched_paths.push(format!("Same directory: {}", path.display()));
        if path.is_file() {
            tracing::info!("Found {} at {}", CONTROLLER_BINARY, path.display());
            return Ok(path);
        }
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let path = dir.join(CONTROLLER_BINARY);
            if path.is_file() {
                tracing::info!("Found {} in PATH: {}", CONTROLLER_BINARY, path.display());
                return Ok(path);
            }
        }
        searched_paths.push(format!("PATH: {}", path_var.to_string_lossy()));
    }
    anyhow::bail!(
        "no {} binary found\n\nSearched:\n  {}\n\nUse --firewall-bin to point at it.",
        CONTROLLER_BINARY,
        searched_paths.join("\n  ")
    )
}

pub struct ControllerClient {
    child: tokio::process::Child,
    stdin: Option<tokio::process::ChildStdin>,
    drain: Option<tokio::task::JoinHandle<Result<()>>>,
    replies: tokio::sync::mpsc::UnboundedReceiver<String>,
    syncs: u64,
    log: LogWriter,
}

async fn drain_output(
    stdout: tokio::process::ChildStdout,
    log: LogWriter,
    replies: tokio::sync::mpsc::UnboundedSender<String>,
) -> Result<()> {
    let mut lines = tokio::io::BufReader::new(stdout).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("failed reading firewall controller output")?
    {
        tracing::debug!("controller: {}", line);
        log.writeln(&line).await?;
        log.flush().await?;
        // the client stops listening once teardown starts
        let _ = replies.send(line);
    }
    Ok(())
}

impl ControllerClient {
    pub fn spawn(program: &std::path::Path, args: &[String], log: &LogWriter) -> Result<Self> {
        tracing::info!("starting firewall controller {:?} {:?}", program, args);
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start firewall controller {:?}", program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("firewall controller stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("firewall controller stdout is not piped"))?;
        let (sender, replies) = tokio::sync::mpsc::unbounded_channel();
        let drain = tokio::spawn(drain_output(stdout, log.clone(), sender));
        Ok(Self {
            child,
            stdin: Some(stdin),
            drain: Some(drain),
            replies,
            syncs: 0,
            log: log.clone(),
        })
    }

    /// Send one command line.
    pub async fn send(&mut self, command: &str) -> Result<()> {
        tracing::debug!("-> controller: {}", command);
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("firewall controller input already closed"))?;
        stdin
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .with_context(|| format!("failed sending '{}' to firewall controller", command))?;
        stdin.flush().await?;
        Ok(())
    }

    /// Wait until the controller has processed everything sent so far.
    ///
    /// Returns the output lines that arrived before the `sync` answer.
    pub async fn sync(&mut self, timeout: std::time::Duration) -> Result<Vec<String>> {
        self.syncs += 1;
        let reply = sync_reply(&self.syncs.to_string());
        self.send(&reply).await?;
        let replies = &mut self.replies;
        let collect = async {
            let mut lines = vec![];
            while let Some(line) = replies.recv().await {
                if line.trim() == reply {
                    return Ok(lines);
                }
                lines.push(line);
            }
            Err(anyhow!(
                "firewall controller exited before answering '{}'",
                reply
            ))
        };
        tokio::time::timeout(timeout, collect).await.map_err(|_| {
            anyhow!(
                "firewall controller did not answer '{}' within {:?}",
                reply,
                timeout
            )
        })?
    }

    /// Put the firewall into `scenario`: everything allowed, then the denied host (if any) cut off.
    ///
    /// Returns once the controller has applied it, or an error if it rejected any command or did
    /// not answer within `timeout`.
    pub async fn setup(
        &mut self,
        scenario: &Scenario,
        dfs_cache: &std::path::Path,
        timeout: std::time::Duration,
    ) -> Result<()> {
        self.log.write("\nRemoving dfs_cache\n").await?;
        crate::testfile::remove_dfs_cache(dfs_cache).await?;
        self.log
            .write(&format!("\n\nSetup Firewall for Denying {}\n\n", scenario))
            .await?;
        self.log.flush().await?;
        self.send("reset").await?;
        if let Some(host) = scenario.denied() {
            self.send(&format!("deny {}", host)).await?;
            self.send("status").await?;
        }
        let errors: Vec<String> = self
            .sync(timeout)
            .await?
            .into_iter()
            .filter(|line| is_error_reply(line))
            .collect();
        if !errors.is_empty() {
            return Err(anyhow!(
                "firewall setup for deny {} failed: {}",
                scenario,
                errors.join("; ")
            ));
        }
        Ok(())
    }

    /// Restore the firewall, stop the controller and wait for its output to be logged.
    ///
    /// The controller is killed if it does not exit within `timeout`.
    pub async fn teardown(
        mut self,
        scenario: &Scenario,
        timeout: std::time::Duration,
    ) -> Result<std::process::ExitStatus> {
        self.log
            .write(&format!("\n\nTeardown Firewall for Denying {}\n\n", scenario))
            .await?;
        self.log.flush().await?;
        let commands: &[&str] = if scenario.denied().is_some() {
            &["reset", "status", "quit"]
        } else {
            &["quit"]
        };
        for command in commands {
            // a controller that already exited is still waited for and its output drained
            if let Err(error) = self.send(command).await {
                tracing::warn!("{:#}", error);
                break;
            }
        }
        // closing stdin lets a controller that missed `quit` see end of input
        self.stdin = None;
        let status = match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(status) => status.context("failed waiting for firewall controller")?,
            Err(_) => {
                tracing::error!(
                    "firewall controller did not exit within {:?}, killing it",
                    timeout
                );
                self.child
                    .kill()
                    .await
                    .context("failed killing firewall controller")?;
                self.child.wait().await?
            }
        };
        if let Some(drain) = self.drain.take() {
            drain.await??;
        }
        self.log.flush().await?;
        if !status.success() {
            tracing::warn!("firewall controller exited with {}", status);
        }
        Ok(status)
    }
}
