use super::PlatformLauncher;
use anyhow::{anyhow, Result};
use std::process::Command;

pub struct WindowsLauncher;

impl WindowsLauncher {
    pub const fn new() -> Self {
        Self
    }
}

impl PlatformLauncher for WindowsLauncher {
    fn open_url(&self, url: &str) -> Result<()> {
        // `start` treats its first quoted argument as the window title.
        let status = Command::new("cmd").args(["/C", "start", "", url]).status();
        match status {
            Ok(code) if code.success() => Ok(()),
            Ok(code) => Err(anyhow!("start exited with {}", code)),
            Err(err) => Err(anyhow!(err)),
        }
    }
}
