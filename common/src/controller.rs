//! Firewall control loop
//!
//! The controller keeps one entry per domain controller: whether traffic from it is currently
//! allowed, and whether it should be flipped on every timer tick. Operator (or harness) commands
//! arrive one per line on the input stream. Line commands and timer ticks are handled on the same
//! task, so a toggle never runs in the middle of a command.
//!
//! Commands:
//!
//! ```text
//! quit                      reset the firewall and exit (also on end of input)
//! reset                     allow every host and stop all toggling
//! status                    print the firewall listing
//! state                     print the host table
//! help                      print the command list
//! deny <host> [-toggle]     drop traffic from host, optionally flip it on every tick
//! allow <host>              allow traffic from host and stop toggling it
//! sync [token]              print `sync <token>` once all earlier commands are done
//! ```

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

use crate::firewall::Firewall;
use crate::lab::Host;

pub const DEFAULT_TOGGLE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

const BAD_HOST: &str = "Bad host name";
const UNRECOGNIZED_OPTION: &str = "unrecognized option";
const REQUIRES_HOST: &str = "requires host";
const VALID_COMMANDS: &str = "Valid commands: quit, reset, status, state, help, deny, allow, sync";
const ERROR_PREFIX: &str = "Error ";

/// The line printed in answer to `sync <token>`.
pub fn sync_reply(token: &str) -> String {
    if token.is_empty() {
        "sync".to_string()
    } else {
        format!("sync {}", token)
    }
}

/// Whether a line of controller output reports a rejected command or a firewall failure.
pub fn is_error_reply(line: &str) -> bool {
    let line = line.trim();
    line.starts_with(ERROR_PREFIX)
        || line.starts_with(REQUIRES_HOST)
        || line.starts_with(VALID_COMMANDS)
        || line == BAD_HOST
        || line == UNRECOGNIZED_OPTION
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Enabled,
    Disabled,
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            HostState::Enabled => write!(f, "enabled"),
            HostState::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub name: String,
    pub ip: String,
    pub state: HostState,
    pub toggle: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Quit,
    Reset,
    Status,
    State,
    Help,
    Deny {
        host: String,
        toggle: bool,
        /// Trailing option that was not understood; the deny still happens.
        unknown_option: Option<String>,
    },
    Allow {
        host: String,
    },
    /// Echo the token back once every earlier command has been applied.
    Sync(String),
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("missing host name")]
    MissingHost,
    #[error("unknown command '{0}'")]
    Unknown(String),
}

impl std::str::FromStr for Command {
    type Err = CommandError;
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let verb = parts.next().ok_or(CommandError::Empty)?;
        match verb {
            "quit" => Ok(Command::Quit),
            "reset" => Ok(Command::Reset),
            "status" => Ok(Command::Status),
            "state" => Ok(Command::State),
            "help" => Ok(Command::Help),
            "deny" => {
                let host = parts.next().ok_or(CommandError::MissingHost)?.to_string();
                let (toggle, unknown_option) = match parts.next() {
                    None => (false, None),
                    Some("-toggle") => (true, None),
                    Some(other) => (false, Some(other.to_string())),
                };
                Ok(Command::Deny {
                    host,
                    toggle,
                    unknown_option,
                })
            }
            "allow" => {
                let host = parts.next().ok_or(CommandError::MissingHost)?.to_string();
                Ok(Command::Allow { host })
            }
            "sync" => Ok(Command::Sync(parts.collect::<Vec<_>>().join(" "))),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

pub struct Controller<F, W> {
    firewall: F,
    hosts: Vec<HostEntry>,
    out: W,
    prompt: Option<String>,
}

impl<F, W> Controller<F, W>
where
    F: Firewall + Send + Sync,
    W: tokio::io::AsyncWrite + Unpin + Send,
{
    /// All hosts start enabled with toggling off. No firewall command is issued until the first
    /// command arrives.
    pub fn new(firewall: F, hosts: &[Host], out: W) -> Self {
        Self {
            firewall,
            hosts: hosts
                .iter()
                .map(|host| HostEntry {
                    name: host.name.clone(),
                    ip: host.ip.clone(),
                    state: HostState::Enabled,
                    toggle: false,
                })
                .collect(),
            out,
            prompt: None,
        }
    }

    /// Print `prompt` before reading each command (interactive use).
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn hosts(&self) -> &[HostEntry] {
        &self.hosts
    }

    pub fn into_output(self) -> W {
        self.out
    }

    async fn say(&mut self, msg: &str) -> Result<()> {
        self.out.write_all(msg.as_bytes()).await?;
        if !msg.ends_with('\n') {
            self.out.write_all(b"\n").await?;
        }
        self.out.flush().await?;
        Ok(())
    }

    async fn report(&mut self, context: &str, error: anyhow::Error) -> Result<()> {
        tracing::error!("{}: {:#}", context, error);
        self.say(&format!("{}{}: {:#}", ERROR_PREFIX, context, error))
            .await
    }

    async fn show_prompt(&mut self) -> Result<()> {
        if let Some(prompt) = &self.prompt {
            self.out.write_all(prompt.as_bytes()).await?;
            self.out.flush().await?;
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.hosts
            .iter()
            .position(|host| host.name.eq_ignore_ascii_case(name))
    }

    fn host_list(&self) -> String {
        self.hosts
            .iter()
            .map(|host| host.name.as_str())
            .collect::<Vec<_>>()
            .join(" or ")
    }

    /// Allow every host, clear all toggles and (re)enable the firewall.
    pub async fn reset(&mut self) -> Result<()> {
        tracing::info!("resetting firewall");
        if let Err(error) = self.firewall.prepare().await {
            self.report("resetting firewall rules", error).await?;
        }
        let ips: Vec<String> = self.hosts.iter().map(|host| host.ip.clone()).collect();
        for ip in ips {
            if let Err(error) = self.firewall.allow(&ip).await {
                self.report(&format!("allowing {}", ip), error).await?;
            }
        }
        for host in &mut self.hosts {
            host.state = HostState::Enabled;
            host.toggle = false;
        }
        if let Err(error) = self.firewall.activate().await {
            self.report("enabling firewall", error).await?;
        }
        Ok(())
    }

    /// Apply `state` to one host. Returns whether the firewall accepted it; failures are reported
    /// and leave the recorded state unchanged.
    async fn set_state(&mut self, index: usize, state: HostState) -> Result<bool> {
        let ip = self.hosts[index].ip.clone();
        let result = match state {
            HostState::Enabled => self.firewall.allow(&ip).await,
            HostState::Disabled => self.firewall.deny(&ip).await,
        };
        match result {
            Ok(()) => {
                tracing::info!("{} ({}) is now {}", self.hosts[index].name, ip, state);
                self.hosts[index].state = state;
                Ok(true)
            }
            Err(error) => {
                let action = match state {
                    HostState::Enabled => "allowing",
                    HostState::Disabled => "denying",
                };
                self.report(&format!("{} {}", action, ip), error).await?;
                Ok(false)
            }
        }
    }

    /// One timer tick: flip every host that has toggling on.
    pub async fn tick(&mut self) -> Result<()> {
        for i in 0..self.hosts.len() {
            if !self.hosts[i].toggle {
                continue;
            }
            let next = match self.hosts[i].state {
                HostState::Enabled => HostState::Disabled,
                HostState::Disabled => HostState::Enabled,
            };
            self.set_state(i, next).await?;
        }
        Ok(())
    }

    async fn help(&mut self) -> Result<()> {
        let hosts = self
            .hosts
            .iter()
            .map(|host| host.name.as_str())
            .collect::<Vec<_>>()
            .join(" | ");
        let text = format!(
            "Valid Commands:
   quit: reset firewall and quit
   reset: reset firewall
   help: print this text
   status: print out status of firewall
   state: print out host states
   deny {hosts} [-toggle]:
       deny traffic from the host
       -toggle: periodically reenable and deny again
   allow {hosts}:
       allow traffic from the host and stop toggling
   sync [token]: print sync <token> once earlier commands are done"
        );
        self.say(&text).await
    }

    async fn print_state(&mut self) -> Result<()> {
        let mut text = String::new();
        for host in &self.hosts {
            text.push_str(&format!(
                "{} {} {} toggle {}\n",
                host.name,
                host.ip,
                host.state,
                if host.toggle { "on" } else { "off" }
            ));
        }
        self.say(&text).await
    }

    async fn execute(&mut self, command: Command) -> Result<Flow> {
        tracing::debug!("command: {:?}", command);
        match command {
            Command::Quit => {
                self.reset().await?;
                if let Err(error) = self.firewall.deactivate().await {
                    self.report("disabling firewall", error).await?;
                }
                return Ok(Flow::Quit);
            }
            Command::Reset => self.reset().await?,
            Command::Status => match self.firewall.status().await {
                Ok(listing) => self.say(&listing).await?,
                Err(error) => self.report("getting firewall status", error).await?,
            },
            Command::State => self.print_state().await?,
            Command::Help => self.help().await?,
            Command::Deny {
                host,
                toggle,
                unknown_option,
            } => {
                let Some(index) = self.find(&host) else {
                    self.say(BAD_HOST).await?;
                    return Ok(Flow::Continue);
                };
                if self.set_state(index, HostState::Disabled).await? && toggle {
                    self.hosts[index].toggle = true;
                }
                if unknown_option.is_some() {
                    self.say(UNRECOGNIZED_OPTION).await?;
                }
            }
            Command::Allow { host } => {
                let Some(index) = self.find(&host) else {
                    self.say(BAD_HOST).await?;
                    return Ok(Flow::Continue);
                };
                self.hosts[index].toggle = false;
                self.set_state(index, HostState::Enabled).await?;
            }
            Command::Sync(token) => self.say(&sync_reply(&token)).await?,
        }
        Ok(Flow::Continue)
    }

    async fn handle_line(&mut self, line: &str) -> Result<Flow> {
        match line.parse::<Command>() {
            Ok(command) => self.execute(command).await,
            Err(CommandError::Empty) => Ok(Flow::Continue),
            Err(CommandError::MissingHost) => {
                let msg = format!("{} {}", REQUIRES_HOST, self.host_list());
                self.say(&msg).await?;
                Ok(Flow::Continue)
            }
            Err(CommandError::Unknown(_)) => {
                self.say(VALID_COMMANDS).await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Process commands from `input` until `quit` or end of input, toggling hosts every
    /// `interval`.
    pub async fn run<R>(&mut self, input: R, interval: std::time::Duration) -> Result<()>
    where
        R: tokio::io::AsyncBufRead + Unpin + Send,
    {
        let mut lines = input.lines();
        let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        self.show_prompt().await?;
        loop {
            // CANCEL SAFETY: `next_line` is cancel safe, a tick never loses a partially read line
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if self.handle_line(&line).await? == Flow::Quit {
                                break;
                            }
                            self.show_prompt().await?;
                        }
                        None => {
                            tracing::info!("end of input, shutting down");
                            self.execute(Command::Quit).await?;
                            break;
                        }
                    }
                }
                _ = timer.tick() => self.tick().await?,
            }
        }
        Ok(())
    }
}
