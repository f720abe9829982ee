//! Runs `dfsreg` against the real `dfsfw`.
//!
//! iptables and the SMB tools are shell stand-ins sharing a rules file, so a copy can see whether
//! traffic from a host was being dropped while it ran.

use assert_cmd::Command;
use predicates::prelude::*;
use std::os::unix::fs::PermissionsExt;

struct Lab {
    dir: tempfile::TempDir,
}

impl Lab {
    /// `add_rule` is the iptables stand-in's action for `-A INPUT -s <ip> -j DROP`.
    fn new(add_rule: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let lab = Self { dir };
        std::fs::write(lab.rules(), "").unwrap();
        lab.script(
            "iptables",
            &format!(
                r#"case "$1" in
  -A) {add_rule} ;;
  -D)
    grep -qx "$4" {rules} || exit 1
    awk -v ip="$4" '$0 == ip && !done {{ done = 1; next }} {{ print }}' {rules} > {rules}.new
    mv {rules}.new {rules}
    ;;
  -L) cat {rules} ;;
esac
"#,
                rules = lab.rules().display()
            ),
        );
        // every copy records whether alpha's rule was in place
        lab.script(
            "smbcp",
            &format!(
                "if grep -qx 10.0.0.1 {rules}; then echo dropped; else echo open; fi >> {copies}\n",
                rules = lab.rules().display(),
                copies = lab.path("copies").display()
            ),
        );
        let config = format!(
            r#"
dfs_cache = "{cache}"
workdir = "{workdir}"
file_size = "1KiB"
firewall = "iptables"

[tools]
smbcp = "{smbcp}"
smbls = "true"
smbrm = "true"
klist = "true"

[[hosts]]
name = "alpha"
ip = "10.0.0.1"

[[hosts]]
name = "beta"
ip = "10.0.0.2"

[[cases]]
descr = "DFS Domain"
dir = "//LAB/root"
requires = "any"

[[cases]]
descr = "Beta Share"
dir = "//LAB/beta"
requires = "beta"

[[cases]]
descr = "Alpha Share"
dir = "//LAB/alpha"
requires = "alpha"
"#,
            cache = lab.path("dfs_cache.xml").display(),
            workdir = lab.dir.path().display(),
            smbcp = lab.path("smbcp").display(),
        );
        std::fs::write(lab.path("lab.toml"), config).unwrap();
        lab
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    fn rules(&self) -> std::path::PathBuf {
        self.path("rules")
    }

    fn script(&self, name: &str, body: &str) {
        let path = self.path(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn read(&self, name: &str) -> String {
        std::fs::read_to_string(self.path(name)).unwrap_or_default()
    }

    fn dfsreg(&self) -> Command {
        let mut cmd = Command::cargo_bin("dfsreg").unwrap();
        cmd.arg("--config")
            .arg(self.path("lab.toml"))
            .arg("--log")
            .arg(self.path("regression.log"))
            .arg("--firewall-arg=--no-sudo")
            .arg("--firewall-arg=--program")
            .arg(format!("--firewall-arg={}", self.path("iptables").display()))
            .arg("--summary");
        cmd
    }
}

#[test]
fn check_dfsfw_help() {
    let mut cmd = Command::cargo_bin("dfsfw").unwrap();
    cmd.arg("--help").assert().success();
}

#[test]
fn check_dfsreg_help() {
    let mut cmd = Command::cargo_bin("dfsreg").unwrap();
    cmd.arg("--help").assert().success();
}

#[test]
fn deny_is_in_place_before_first_transaction() {
    // a slow firewall: the rule lands well after the command was sent
    let lab = Lab::new(r#"sleep 0.5; echo "$4" >> "$(dirname "$0")/rules""#);
    lab.dfsreg()
        .args(["--scenario", "alpha"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cases passed: 2"))
        .stdout(predicate::str::contains("cases skipped: 1"));
    let copies = lab.read("copies");
    assert_eq!(copies, "dropped\n".repeat(4));
    // quit resets the firewall
    assert_eq!(lab.read("rules"), "");
    let transcript = lab.read("regression.log");
    let applied = transcript.find("\nsync 1\n").unwrap();
    let first_case = transcript.find("Test DFS Domain").unwrap();
    assert!(applied < first_case);
}

#[test]
fn explicit_controller_sees_the_same_lab() {
    let lab = Lab::new(r#"echo "$4" >> "$(dirname "$0")/rules""#);
    lab.dfsreg()
        .arg("--firewall-bin")
        .arg(assert_cmd::cargo::cargo_bin("dfsfw"))
        .assert()
        .success()
        .stdout(predicate::str::contains("scenarios run: 3"))
        .stdout(predicate::str::contains("scenarios failed: 0"));
    let transcript = lab.read("regression.log");
    assert!(!transcript.contains("Bad host name"));
    assert!(!transcript.contains("Error "));
    // `status` lists the rule each denied host left behind
    for ip in ["10.0.0.1", "10.0.0.2"] {
        assert!(transcript.lines().any(|line| line == ip));
    }
    assert_eq!(lab.read("rules"), "");
}

#[test]
fn rejected_deny_fails_the_scenario() {
    let lab = Lab::new("echo 'iptables: Permission denied' >&2; exit 1");
    lab.dfsreg()
        .args(["--scenario", "alpha"])
        .assert()
        .failure()
        .stdout(predicate::str::contains(
            "firewall setup for deny alpha failed: Error denying 10.0.0.1",
        ))
        .stderr(predicate::str::contains("scenarios failed: 1"));
    assert_eq!(lab.read("copies"), "");
    let transcript = lab.read("regression.log");
    assert!(transcript.contains("Teardown Firewall for Denying alpha"));
}
