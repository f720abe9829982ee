// build identification written at the top of every transcript

/// Version of the tools that produced a transcript
///
/// The semantic version always comes from Cargo.toml. Git information is captured by build.rs
/// when the crate is built from a checkout and is absent otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildVersion {
    /// Semantic version from Cargo.toml (e.g., "0.4.0")
    pub semantic: String,
    /// Git describe output (e.g., "v0.3.0-7-g644da27-dirty")
    pub git_describe: Option<String>,
    /// Full git commit hash
    pub git_hash: Option<String>,
}

impl BuildVersion {
    pub fn current() -> Self {
        Self {
            semantic: env!("CARGO_PKG_VERSION").to_string(),
            git_describe: option_env!("DFS_GIT_DESCRIBE").map(String::from),
            git_hash: option_env!("DFS_GIT_HASH").map(String::from),
        }
    }

    /// Semantic version, with git describe appended when known.
    ///
    /// # Examples
    ///
    /// ```
    /// use common::version::BuildVersion;
    ///
    /// let v = BuildVersion {
    ///     semantic: "0.4.0".to_string(),
    ///     git_describe: Some("v0.3.0-7-g644da27".to_string()),
    ///     git_hash: None,
    /// };
    ///
    /// assert_eq!(v.display(), "0.4.0 (v0.3.0-7-g644da27)");
    /// ```
    pub fn display(&self) -> String {
        if let Some(ref git_describe) = self.git_describe {
            format!("{} ({})", self.semantic, git_describe)
        } else {
            self.semantic.clone()
        }
    }
}
