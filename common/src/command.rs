//! External command execution
//!
//! Every tool this harness drives (`smbcp`, `smbls`, `smbrm`, `klist`, `iptables`, `ufw`) is
//! run as a child process without a shell. Commands used by the regression runner are traced
//! into the transcript; firewall commands only go to `tracing`.

use anyhow::Result;
use tracing::instrument;

use crate::log::LogWriter;

/// Exit code reported when the program could not be started at all (mirrors the shell).
pub const SPAWN_FAILED: i32 = 127;

/// Exit code reported when the program was terminated by a signal.
pub const KILLED_BY_SIGNAL: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Prefix with `sudo` when requested.
    pub fn privileged(self, sudo: bool) -> Self {
        if !sudo {
            return self;
        }
        let mut args = vec![self.program];
        args.extend(self.args);
        Self {
            program: "sudo".to_string(),
            args,
        }
    }

    /// Run to completion capturing stdout and stderr.
    ///
    /// Failing to start the program is not an error: it is reported as exit code 127 with the
    /// reason on stderr, so a missing tool shows up as a failed step in the transcript.
    #[instrument]
    pub async fn output(&self) -> CommandOutcome {
        let start = std::time::Instant::now();
        let result = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;
        let elapsed = start.elapsed();
        match result {
            Ok(output) => {
                let code = output.status.code().unwrap_or(KILLED_BY_SIGNAL);
                tracing::debug!("{} exited with {}", self, code);
                CommandOutcome {
                    code,
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    elapsed,
                }
            }
            Err(error) => {
                tracing::warn!("failed to start {}: {}", self, error);
                CommandOutcome {
                    code: SPAWN_FAILED,
                    stdout: String::new(),
                    stderr: format!("{}: {}\n", self.program, error),
                    elapsed,
                }
            }
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: std::time::Duration,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run a command and trace it into the transcript.
pub async fn run_command(command: &CommandLine, log: &LogWriter) -> Result<CommandOutcome> {
    let outcome = command.output().await;
    let cmd = command.to_string();
    let result = format!("result: {}\n\n", outcome.code);
    log.write_all(&[
        "command: \n",
        &cmd,
        "\n\n",
        "stdout: \n",
        &outcome.stdout,
        "\n",
        "stderr: \n",
        &outcome.stderr,
        "\n",
        &result,
    ])
    .await?;
    log.flush().await?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let cmd = CommandLine::new("smbcp").args(["/tmp/in.txt", "//DOMAIN/air/in.txt"]);
        assert_eq!(cmd.to_string(), "smbcp /tmp/in.txt //DOMAIN/air/in.txt");
    }

    #[test]
    fn privileged_prefixes_sudo() {
        let cmd = CommandLine::new("iptables")
            .args(["-L", "INPUT"])
            .privileged(true);
        assert_eq!(cmd.to_string(), "sudo iptables -L INPUT");
        let cmd = CommandLine::new("iptables").privileged(false);
        assert_eq!(cmd.to_string(), "iptables");
    }

    #[tokio::test]
    async fn captures_output_and_code() {
        let outcome = CommandLine::new("sh")
            .args(["-c", "echo out; echo err >&2; exit 3"])
            .output()
            .await;
        assert_eq!(outcome.code, 3);
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn missing_program_is_reported_not_raised() {
        let outcome = CommandLine::new("/nonexistent/dfs-tool").output().await;
        assert_eq!(outcome.code, SPAWN_FAILED);
        assert!(outcome.stderr.starts_with("/nonexistent/dfs-tool: "));
    }

    #[tokio::test]
    async fn run_command_traces_to_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("trace.log");
        let log = LogWriter::create(&path).await?;
        let outcome = run_command(&CommandLine::new("echo").arg("hello"), &log).await?;
        assert!(outcome.success());
        let contents = tokio::fs::read_to_string(&path).await?;
        assert_eq!(
            contents,
            "command: \necho hello\n\nstdout: \nhello\n\nstderr: \n\nresult: 0\n\n"
        );
        Ok(())
    }
}
