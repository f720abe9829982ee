use anyhow::{Result, anyhow};

use crate::command::CommandLine;
use crate::log::LogWriter;

/// Check that the user holds a Kerberos ticket by running `klist`.
///
/// The output is written to the transcript whether or not the check passes.
pub async fn check_authenticated(klist: &str, log: &LogWriter) -> Result<()> {
    let outcome = CommandLine::new(klist).output().await;
    log.write_all(&[
        "Authentication:\n",
        "stdout:\n",
        &outcome.stdout,
        "\n",
        "stderr:\n",
        &outcome.stderr,
    ])
    .await?;
    log.flush().await?;
    if !outcome.success() {
        return Err(anyhow!("Not currently logged into a domain"));
    }
    tracing::info!("kerberos credentials present");
    Ok(())
}
