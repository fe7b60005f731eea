//! Panel reload hook.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait ReloadTrigger: Send + Sync {
    async fn reload(&self) -> Result<()>;
}

/// Runs an external command, e.g. `sudo systemctl restart x-ui.service`.
#[derive(Clone, Debug)]
pub struct CommandReloadTrigger {
    argv: Vec<String>,
}

impl CommandReloadTrigger {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

#[async_trait]
impl ReloadTrigger for CommandReloadTrigger {
    async fn reload(&self) -> Result<()> {
        let Some((program, args)) = self.argv.split_first() else {
            bail!("reload command is empty");
        };

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("spawn reload command failed: {}", self.argv.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "reload command `{}` exited with {}: {}",
                self.argv.join(" "),
                output.status,
                stderr.trim()
            );
        }

        info!(command = %self.argv.join(" "), "panel reload triggered");
        Ok(())
    }
}
