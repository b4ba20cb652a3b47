//! Platform-specific adapters for launching external apps.

use anyhow::Result;

#[cfg(target_os = "macos")]
mod mac;
#[cfg(target_os = "windows")]
mod windows;
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
mod xdg;

#[cfg(target_os = "macos")]
use mac::MacLauncher as PlatformImpl;
#[cfg(target_os = "windows")]
use windows::WindowsLauncher as PlatformImpl;
#[cfg(not(any(target_os = "macos", target_os = "windows")))]
use xdg::XdgLauncher as PlatformImpl;

static ADAPTER: PlatformImpl = PlatformImpl::new();

pub trait PlatformLauncher: Sync + Send {
    /// Hand `url` to the desktop's default browser.
    fn open_url(&self, url: &str) -> Result<()>;
}

pub fn open_url(url: &str) -> Result<()> {
    ADAPTER.open_url(url)
}
