//! Local files used by SMB transactions
//!
//! The input file is random data rendered as base64 text (76 character lines), the same shape
//! `dd if=/dev/urandom | base64` produces, so it survives any text-mode transfer untouched.

use anyhow::{Context, Result};
use base64::Engine;
use rand::Rng;
use tokio::io::AsyncWriteExt;

pub const INPUT_FILENAME: &str = "test_input_file.txt";
pub const OUTPUT_FILENAME: &str = "test_output_file.txt";

const LINE_WIDTH: usize = 76;

/// Write `size` random bytes, base64 encoded, to `path`.
pub async fn generate(path: &std::path::Path, size: u64) -> Result<()> {
    let size = usize::try_from(size).context("test file size does not fit in memory")?;
    let bytes = {
        // make sure rng falls out of scope before await
        let mut bytes = vec![0u8; size];
        rand::thread_rng().fill(&mut bytes[..]);
        bytes
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
    let mut text = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH + 1);
    for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
        // base64 output is ASCII
        text.push_str(&String::from_utf8_lossy(chunk));
        text.push('\n');
    }
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Error creating {:?}", path))?;
    file.write_all(text.as_bytes())
        .await
        .with_context(|| format!("Error writing to {:?}", path))?;
    file.flush().await?;
    Ok(())
}

async fn remove_if_exists(path: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("failed removing {:?}", path)),
    }
}

/// Input and output files of a regression run.
#[derive(Debug, Clone)]
pub struct Fixture {
    pub input: std::path::PathBuf,
    pub output: std::path::PathBuf,
}

impl Fixture {
    pub fn new(workdir: &std::path::Path) -> Self {
        Self {
            input: workdir.join(INPUT_FILENAME),
            output: workdir.join(OUTPUT_FILENAME),
        }
    }

    pub async fn setup(workdir: &std::path::Path, size: u64) -> Result<Self> {
        let fixture = Self::new(workdir);
        generate(&fixture.input, size).await?;
        tracing::info!("generated {:?} from {} random bytes", fixture.input, size);
        Ok(fixture)
    }

    /// Remote path the input file is copied to inside `dir`.
    pub fn remote_path(&self, dir: &str) -> String {
        format!("{}/{}", dir.trim_end_matches('/'), INPUT_FILENAME)
    }

    pub async fn cleanup(&self) -> Result<()> {
        remove_if_exists(&self.input).await?;
        remove_if_exists(&self.output).await?;
        Ok(())
    }
}

/// Remove the client's DFS referral cache so every scenario starts from the same state.
pub async fn remove_dfs_cache(path: &std::path::Path) -> Result<()> {
    remove_if_exists(path).await
}
