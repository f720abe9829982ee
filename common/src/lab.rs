//! Lab topology and the regression test matrix
//!
//! A lab is a set of domain controllers plus a table of remote directories to exercise. Each
//! table row states which controllers must be reachable for the transaction to be expected to
//! succeed; firewall scenarios take controllers away and rows whose requirement is no longer met
//! are skipped.

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::firewall::Backend;

const BUILTIN_LAB: &str = include_str!("default_lab.toml");

/// Names with special meaning in requirement and scenario strings.
const RESERVED_NAMES: [&str; 3] = ["any", "both", "none"];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum LabError {
    #[error("lab must define at least one host")]
    NoHosts,
    #[error("host name must not be empty")]
    EmptyHostName,
    #[error("host name '{0}' is reserved")]
    ReservedHostName(String),
    #[error("host '{0}' is defined more than once")]
    DuplicateHost(String),
    #[error("case '{descr}' requires unknown host '{host}'")]
    UnknownRequirement { descr: String, host: String },
    #[error("unknown host '{0}'")]
    UnknownHost(String),
    #[error("invalid file size '{0}'")]
    InvalidFileSize(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Host {
    pub name: String,
    pub ip: String,
}

/// Which controllers a case needs online.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum Requirement {
    Any,
    Both,
    Host(String),
}

impl From<String> for Requirement {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("any") {
            Requirement::Any
        } else if value.eq_ignore_ascii_case("both") {
            Requirement::Both
        } else {
            Requirement::Host(value)
        }
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Requirement::Any => write!(f, "any"),
            Requirement::Both => write!(f, "both"),
            Requirement::Host(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Case {
    pub descr: String,
    pub dir: String,
    pub requires: Requirement,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Tools {
    pub smbcp: String,
    pub smbls: String,
    pub smbrm: String,
    pub klist: String,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            smbcp: "smbcp".to_string(),
            smbls: "smbls".to_string(),
            smbrm: "smbrm".to_string(),
            klist: "klist".to_string(),
        }
    }
}

fn default_dfs_cache() -> std::path::PathBuf {
    std::path::PathBuf::from("/tmp/dfs_cache.xml")
}

fn default_workdir() -> std::path::PathBuf {
    std::env::temp_dir()
}

fn default_file_size() -> String {
    "1KiB".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Lab {
    pub hosts: Vec<Host>,
    #[serde(default)]
    pub cases: Vec<Case>,
    #[serde(default)]
    pub tools: Tools,
    /// Client side DFS referral cache, removed before each scenario
    #[serde(default = "default_dfs_cache")]
    pub dfs_cache: std::path::PathBuf,
    /// Where the local input/output files of a transaction live
    #[serde(default = "default_workdir")]
    pub workdir: std::path::PathBuf,
    #[serde(default = "default_file_size")]
    pub file_size: String,
    #[serde(default)]
    pub firewall: Backend,
}

impl Lab {
    pub fn from_toml(text: &str) -> Result<Self> {
        let lab: Lab = toml::from_str(text).context("failed to parse lab configuration")?;
        lab.validate()?;
        Ok(lab)
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read lab configuration {:?}", path))?;
        Self::from_toml(&text).with_context(|| format!("invalid lab configuration {:?}", path))
    }

    /// The lab compiled into the tools, used when no configuration file is given.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_LAB)
    }

    /// Load `path` if given, otherwise fall back to the built-in lab.
    pub fn load_or_builtin(path: Option<&std::path::Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Self::builtin(),
        }
    }

    pub fn validate(&self) -> Result<(), LabError> {
        if self.hosts.is_empty() {
            return Err(LabError::NoHosts);
        }
        for (i, host) in self.hosts.iter().enumerate() {
            if host.name.is_empty() {
                return Err(LabError::EmptyHostName);
            }
            if RESERVED_NAMES
                .iter()
                .any(|reserved| host.name.eq_ignore_ascii_case(reserved))
            {
                return Err(LabError::ReservedHostName(host.name.clone()));
            }
            if self.hosts[..i]
                .iter()
                .any(|other| other.name.eq_ignore_ascii_case(&host.name))
            {
                return Err(LabError::DuplicateHost(host.name.clone()));
            }
        }
        for case in &self.cases {
            if let Requirement::Host(name) = &case.requires
                && self.host(name).is_none()
            {
                return Err(LabError::UnknownRequirement {
                    descr: case.descr.clone(),
                    host: name.clone(),
                });
            }
        }
        self.file_size_bytes()?;
        Ok(())
    }

    pub fn host(&self, name: &str) -> Option<&Host> {
        self.hosts
            .iter()
            .find(|host| host.name.eq_ignore_ascii_case(name))
    }

    pub fn host_names(&self) -> Vec<&str> {
        self.hosts.iter().map(|host| host.name.as_str()).collect()
    }

    pub fn file_size_bytes(&self) -> Result<u64, LabError> {
        self.file_size
            .parse::<bytesize::ByteSize>()
            .map(|size| size.as_u64())
            .map_err(|_| LabError::InvalidFileSize(self.file_size.clone()))
    }

    /// Parse `none` or a host name into a firewall scenario.
    pub fn parse_scenario(&self, text: &str) -> Result<Scenario, LabError> {
        if text.eq_ignore_ascii_case("none") {
            return Ok(Scenario::DenyNone);
        }
        self.host(text)
            .map(|host| Scenario::Deny(host.name.clone()))
            .ok_or_else(|| LabError::UnknownHost(text.to_string()))
    }

    /// Every single-host outage preceded by the all-online pass.
    pub fn default_scenarios(&self) -> Vec<Scenario> {
        std::iter::once(Scenario::DenyNone)
            .chain(
                self.hosts
                    .iter()
                    .map(|host| Scenario::Deny(host.name.clone())),
            )
            .collect()
    }

    /// Parse an `--online` value: `any` and `both` mean every host is up, a host name means
    /// only that host is up.
    pub fn parse_online(&self, text: &str) -> Result<Availability, LabError> {
        if text.eq_ignore_ascii_case("any") || text.eq_ignore_ascii_case("both") {
            return Ok(self.all_online());
        }
        let host = self
            .host(text)
            .ok_or_else(|| LabError::UnknownHost(text.to_string()))?;
        Ok(Availability {
            online: std::collections::BTreeSet::from([host.name.clone()]),
            total: self.hosts.len(),
        })
    }

    pub fn all_online(&self) -> Availability {
        Availability {
            online: self.hosts.iter().map(|host| host.name.clone()).collect(),
            total: self.hosts.len(),
        }
    }
}

/// Firewall configuration for one pass over the matrix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scenario {
    DenyNone,
    Deny(String),
}

impl Scenario {
    pub fn denied(&self) -> Option<&str> {
        match self {
            Scenario::DenyNone => None,
            Scenario::Deny(host) => Some(host),
        }
    }

    pub fn availability(&self, lab: &Lab) -> Availability {
        let mut availability = lab.all_online();
        if let Some(denied) = self.denied() {
            availability
                .online
                .retain(|name| !name.eq_ignore_ascii_case(denied));
        }
        availability
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Scenario::DenyNone => write!(f, "none"),
            Scenario::Deny(host) => write!(f, "{}", host),
        }
    }
}

/// The set of controllers currently reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Availability {
    online: std::collections::BTreeSet<String>,
    total: usize,
}

impl Availability {
    pub fn is_online(&self, host: &str) -> bool {
        self.online
            .iter()
            .any(|name| name.eq_ignore_ascii_case(host))
    }

    pub fn satisfies(&self, requirement: &Requirement) -> bool {
        match requirement {
            Requirement::Any => !self.online.is_empty(),
            Requirement::Both => self.online.len() == self.total,
            Requirement::Host(name) => self.is_online(name),
        }
    }
}
