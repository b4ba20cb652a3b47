use super::PlatformLauncher;
use anyhow::{anyhow, Context, Result};
use std::process::{Command, Stdio};

pub struct XdgLauncher;

impl XdgLauncher {
    pub const fn new() -> Self {
        Self
    }
}

impl PlatformLauncher for XdgLauncher {
    fn open_url(&self, url: &str) -> Result<()> {
        let status = Command::new("xdg-open")
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .context("failed to run xdg-open")?;
        if status.success() {
            Ok(())
        } else {
            Err(anyhow!("xdg-open exited with {}", status))
        }
    }
}
