use super::PlatformLauncher;
use anyhow::{anyhow, Context, Result};
use std::process::Command;

pub struct MacLauncher;

impl MacLauncher {
    pub const fn new() -> Self {
        Self
    }
}

impl PlatformLauncher for MacLauncher {
    fn open_url(&self, url: &str) -> Result<()> {
        let output = Command::new("open")
            .arg(url)
            .output()
            .with_context(|| format!("failed to run open for {url}"))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(anyhow!("open {} failed: {}", url, stderr.trim()))
    }
}
