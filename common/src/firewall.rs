//! Host firewall backends
//!
//! Outages are simulated by dropping traffic from a domain controller on the test client. Two
//! backends are supported: raw `iptables` (an `INPUT` DROP rule per denied host) and `ufw`
//! (allow/deny rules in both directions). Both are driven through `sudo` by default.

use anyhow::{Result, anyhow};

use crate::command::{CommandLine, CommandOutcome};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Iptables,
    Ufw,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Backend::Iptables => write!(f, "iptables"),
            Backend::Ufw => write!(f, "ufw"),
        }
    }
}

/// Operations the controller needs from a firewall.
///
/// A reset is `prepare`, `allow` for every host, then `activate`. `deactivate` runs once when
/// the controller exits.
pub trait Firewall {
    fn prepare(&self) -> impl Future<Output = Result<()>> + Send;
    fn allow(&self, ip: &str) -> impl Future<Output = Result<()>> + Send;
    fn deny(&self, ip: &str) -> impl Future<Output = Result<()>> + Send;
    fn activate(&self) -> impl Future<Output = Result<()>> + Send;
    fn deactivate(&self) -> impl Future<Output = Result<()>> + Send;
    fn status(&self) -> impl Future<Output = Result<String>> + Send;
}

fn check(outcome: CommandOutcome, what: &str) -> Result<CommandOutcome> {
    if outcome.success() {
        return Ok(outcome);
    }
    Err(anyhow!(
        "{} failed with exit code {}: {}",
        what,
        outcome.code,
        outcome.stderr.trim()
    ))
}

/// Upper bound on duplicate DROP rules removed by one `allow`.
const MAX_DROP_RULES: usize = 64;

#[derive(Debug, Clone)]
pub struct Iptables {
    program: String,
    sudo: bool,
}

impl Iptables {
    pub fn new(program: impl Into<String>, sudo: bool) -> Self {
        Self {
            program: program.into(),
            sudo,
        }
    }

    fn command(&self) -> CommandLine {
        CommandLine::new(self.program.clone())
    }

    fn drop_rule(&self, action: &str, ip: &str) -> CommandLine {
        self.command()
            .args([action, "INPUT", "-s", ip, "-j", "DROP"])
            .privileged(self.sudo)
    }
}

impl Firewall for Iptables {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn allow(&self, ip: &str) -> Result<()> {
        // every deny appends a rule, so delete until iptables reports none are left
        for _ in 0..MAX_DROP_RULES {
            let outcome = self.drop_rule("-D", ip).output().await;
            if !outcome.success() {
                tracing::debug!("no DROP rule left for {}: {}", ip, outcome.stderr.trim());
                return Ok(());
            }
        }
        Err(anyhow!(
            "more than {} DROP rules for {} in INPUT",
            MAX_DROP_RULES,
            ip
        ))
    }

    async fn deny(&self, ip: &str) -> Result<()> {
        check(
            self.drop_rule("-A", ip).output().await,
            &format!("adding iptables rule for {}", ip),
        )?;
        Ok(())
    }

    async fn activate(&self) -> Result<()> {
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        Ok(())
    }

    async fn status(&self) -> Result<String> {
        let outcome = check(
            self.command()
                .args(["-L", "INPUT"])
                .privileged(self.sudo)
                .output()
                .await,
            "getting iptables status",
        )?;
        Ok(outcome.stdout)
    }
}

#[derive(Debug, Clone)]
pub struct Ufw {
    program: String,
    sudo: bool,
}

/// Rule numbers from `ufw status numbered` whose line mentions `ip`, highest first.
///
/// Deleting a rule renumbers the ones after it, so deletions must run in this order.
pub fn numbered_rules_for(listing: &str, ip: &str) -> Vec<u32> {
    let mut numbers: Vec<u32> = listing
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let rest = line.strip_prefix('[')?;
            let (number, rule) = rest.split_once(']')?;
            let number = number.trim().parse::<u32>().ok()?;
            let mentions_ip = rule
                .split(|c: char| c.is_whitespace() || c == '(' || c == ')')
                .any(|word| word == ip);
            mentions_ip.then_some(number)
        })
        .collect();
    numbers.sort_unstable_by(|a, b| b.cmp(a));
    numbers.dedup();
    numbers
}

impl Ufw {
    pub fn new(program: impl Into<String>, sudo: bool) -> Self {
        Self {
            program: program.into(),
            sudo,
        }
    }

    fn command<I, S>(&self, args: I) -> CommandLine
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandLine::new(self.program.clone())
            .args(args)
            .privileged(self.sudo)
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutcome> {
        let command = self.command(args.iter().copied());
        let what = command.to_string();
        check(command.output().await, &what)
    }

    async fn remove_rules_for(&self, ip: &str) -> Result<()> {
        let listing = self.run(&["status", "numbered"]).await?.stdout;
        for number in numbered_rules_for(&listing, ip) {
            let number = number.to_string();
            if let Err(error) = self.run(&["--force", "delete", &number]).await {
                tracing::warn!("error deleting ufw rule {}: {:#}", number, error);
            }
        }
        Ok(())
    }

    async fn set_rules(&self, action: &str, ip: &str) -> Result<()> {
        self.remove_rules_for(ip).await?;
        self.run(&[action, "from", ip]).await?;
        self.run(&[action, "out", "to", ip]).await?;
        Ok(())
    }
}

impl Firewall for Ufw {
    async fn prepare(&self) -> Result<()> {
        self.run(&["--force", "reset"]).await?;
        self.run(&["allow", "from", "any", "to", "any"]).await?;
        Ok(())
    }

    async fn allow(&self, ip: &str) -> Result<()> {
        self.set_rules("allow", ip).await
    }

    async fn deny(&self, ip: &str) -> Result<()> {
        self.set_rules("deny", ip).await
    }

    async fn activate(&self) -> Result<()> {
        self.run(&["--force", "enable"]).await?;
        Ok(())
    }

    async fn deactivate(&self) -> Result<()> {
        self.run(&["disable"]).await?;
        Ok(())
    }

    async fn status(&self) -> Result<String> {
        Ok(self.run(&["status", "numbered"]).await?.stdout)
    }
}

/// Backend chosen at runtime.
#[derive(Debug, Clone)]
pub enum SystemFirewall {
    Iptables(Iptables),
    Ufw(Ufw),
}

impl SystemFirewall {
    /// `program` overrides the backend binary name (`iptables` or `ufw`).
    pub fn new(backend: Backend, program: Option<String>, sudo: bool) -> Self {
        match backend {
            Backend::Iptables => SystemFirewall::Iptables(Iptables::new(
                program.unwrap_or_else(|| "iptables".to_string()),
                sudo,
            )),
            Backend::Ufw => SystemFirewall::Ufw(Ufw::new(
                program.unwrap_or_else(|| "ufw".to_string()),
                sudo,
            )),
        }
    }
}

impl Firewall for SystemFirewall {
    async fn prepare(&self) -> Result<()> {
        match self {
            SystemFirewall::Iptables(fw) => fw.prepare().await,
            SystemFirewall::Ufw(fw) => fw.prepare().await,
        }
    }

    async fn allow(&self, ip: &str) -> Result<()> {
        match self {
            SystemFirewall::Iptables(fw) => fw.allow(ip).await,
            SystemFirewall::Ufw(fw) => fw.allow(ip).await,
        }
    }

    async fn deny(&self, ip: &str) -> Result<()> {
        match self {
            SystemFirewall::Iptables(fw) => fw.deny(ip).await,
            SystemFirewall::Ufw(fw) => fw.deny(ip).await,
        }
    }

    async fn activate(&self) -> Result<()> {
        match self {
            SystemFirewall::Iptables(fw) => fw.activate().await,
            SystemFirewall::Ufw(fw) => fw.activate().await,
        }
    }

    async fn deactivate(&self) -> Result<()> {
        match self {
            SystemFirewall::Iptables(fw) => fw.deactivate().await,
            SystemFirewall::Ufw(fw) => fw.deactivate().await,
        }
    }

    async fn status(&self) -> Result<String> {
        match self {
            SystemFirewall::Iptables(fw) => fw.status().await,
            SystemFirewall::Ufw(fw) => fw.status().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Fake backend binary that appends its arguments to `calls` and prints `stdout`.
    fn fake_tool(dir: &std::path::Path, stdout: &str, exit_code: i32) -> std::path::PathBuf {
        let script = dir.join("fake-fw");
        let calls = dir.join("calls");
        let listing = dir.join("listing");
        std::fs::write(&listing, stdout).unwrap();
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" >> {}\ncat {}\nexit {}\n",
                calls.display(),
                listing.display(),
                exit_code
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    fn calls(dir: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    const UFW_LISTING: &str = "Status: active

     To                         Action      From
     --                         ------      ----
[ 1] Anywhere                   ALLOW IN    Anywhere
[ 2] Anywhere                   DENY IN     10.0.0.1
[ 3] 10.0.0.1                   DENY OUT    Anywhere                   (out)
[ 4] Anywhere                   ALLOW IN    10.0.0.12
[10] Anywhere                   DENY IN     10.0.0.1
";

    #[test]
    fn numbered_rules_match_exact_address_highest_first() {
        assert_eq!(numbered_rules_for(UFW_LISTING, "10.0.0.1"), vec![10, 3, 2]);
        assert_eq!(numbered_rules_for(UFW_LISTING, "10.0.0.12"), vec![4]);
        assert!(numbered_rules_for("Status: inactive\n", "10.0.0.1").is_empty());
    }

    /// Fake `iptables` keeping one line per DROP rule in `rules`; `-D` fails when none match.
    fn stateful_iptables(dir: &std::path::Path) -> std::path::PathBuf {
        let script = dir.join("fake-iptables");
        let rules = dir.join("rules");
        std::fs::write(&rules, "").unwrap();
        std::fs::write(
            &script,
            format!(
                r#"#!/bin/sh
echo "$@" >> {calls}
case "$1" in
  -A) echo "$4" >> {rules} ;;
  -D)
    grep -qx "$4" {rules} || exit 1
    grep -vx "$4" {rules} > {rules}.new
    n=$(grep -cx "$4" {rules})
    i=1
    while [ $i -lt $n ]; do echo "$4" >> {rules}.new; i=$((i+1)); done
    mv {rules}.new {rules}
    ;;
  -L) cat {rules} ;;
esac
"#,
                calls = dir.join("calls").display(),
                rules = rules.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    #[tokio::test]
    async fn iptables_deny_and_allow_commands() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tool = stateful_iptables(dir.path());
        let fw = Iptables::new(tool.display().to_string(), false);
        fw.deny("10.0.0.1").await?;
        fw.allow("10.0.0.1").await?;
        fw.prepare().await?;
        fw.activate().await?;
        assert_eq!(
            calls(dir.path()),
            vec![
                "-A INPUT -s 10.0.0.1 -j DROP",
                "-D INPUT -s 10.0.0.1 -j DROP",
                "-D INPUT -s 10.0.0.1 -j DROP"
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn iptables_allow_removes_repeated_denies() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tool = stateful_iptables(dir.path());
        let fw = Iptables::new(tool.display().to_string(), false);
        fw.deny("10.0.0.1").await?;
        fw.deny("10.0.0.1").await?;
        fw.deny("10.0.0.2").await?;
        assert_eq!(fw.status().await?, "10.0.0.1\n10.0.0.1\n10.0.0.2\n");
        fw.allow("10.0.0.1").await?;
        assert_eq!(fw.status().await?, "10.0.0.2\n");
        Ok(())
    }

    #[tokio::test]
    async fn iptables_allow_is_bounded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // a tool that always succeeds would loop forever without the bound
        let tool = fake_tool(dir.path(), "", 0);
        let fw = Iptables::new(tool.display().to_string(), false);
        assert!(fw.allow("10.0.0.1").await.is_err());
        assert_eq!(calls(dir.path()).len(), MAX_DROP_RULES);
        Ok(())
    }

    #[tokio::test]
    async fn iptables_allow_tolerates_missing_rule_but_deny_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tool = fake_tool(dir.path(), "", 1);
        let fw = Iptables::new(tool.display().to_string(), false);
        fw.allow("10.0.0.1").await?;
        assert!(fw.deny("10.0.0.1").await.is_err());
        assert!(fw.status().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn ufw_deny_replaces_existing_rules() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tool = fake_tool(dir.path(), UFW_LISTING, 0);
        let fw = Ufw::new(tool.display().to_string(), false);
        fw.deny("10.0.0.1").await?;
        assert_eq!(
            calls(dir.path()),
            vec![
                "status numbered",
                "--force delete 10",
                "--force delete 3",
                "--force delete 2",
                "deny from 10.0.0.1",
                "deny out to 10.0.0.1",
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn ufw_reset_hooks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tool = fake_tool(dir.path(), "Status: inactive\n", 0);
        let fw = SystemFirewall::new(Backend::Ufw, Some(tool.display().to_string()), false);
        fw.prepare().await?;
        fw.activate().await?;
        fw.deactivate().await?;
        assert_eq!(fw.status().await?, "Status: inactive\n");
        assert_eq!(
            calls(dir.path()),
            vec![
                "--force reset",
                "allow from any to any",
                "--force enable",
                "disable",
                "status numbered",
            ]
        );
        Ok(())
    }

    #[test]
    fn system_firewall_defaults_program_names() {
        match SystemFirewall::new(Backend::Iptables, None, true) {
            SystemFirewall::Iptables(fw) => {
                assert_eq!(
                    fw.drop_rule("-A", "1.2.3.4").to_string(),
                    "sudo iptables -A INPUT -s 1.2.3.4 -j DROP"
                );
            }
            SystemFirewall::Ufw(_) => panic!("expected iptables backend"),
        }
    }
}
