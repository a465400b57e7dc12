//! Read-only settings snapshot consumed by the orchestrator.
//!
//! The on-disk configuration format and its defaults belong to the shell
//! application; the engine only receives this snapshot, constructed once at
//! startup and passed by reference (no module-level singletons).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Engine-facing configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Maximum number of simultaneously downloading jobs.
    pub max_concurrent: usize,
    /// Target directory for finished files.
    pub download_dir: PathBuf,
    /// Path to the downloader binary; `None` means resolve from beside the
    /// executable or `$PATH`.
    pub downloader_path: Option<PathBuf>,
    /// Companion transcoder (ffmpeg) location handed to the downloader.
    pub ffmpeg_path: Option<PathBuf>,
    /// Proxy URL forwarded to the downloader.
    pub proxy_url: Option<String>,
    /// Browser to read cookies from (`--cookies-from-browser`).
    pub cookies_from_browser: Option<String>,
    /// Extra downloader config file (`--config-locations`).
    pub extra_config_path: Option<PathBuf>,
    /// Optional script-runtime override for extractor challenges.
    pub script_runtime_path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            download_dir: PathBuf::from("."),
            downloader_path: None,
            ffmpeg_path: None,
            proxy_url: None,
            cookies_from_browser: None,
            extra_config_path: None,
            script_runtime_path: None,
        }
    }
}

impl Settings {
    pub fn new(max_concurrent: usize, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            max_concurrent,
            download_dir: download_dir.into(),
            ..Self::default()
        }
    }

    /// Set the downloader binary path.
    pub fn with_downloader(mut self, path: impl Into<PathBuf>) -> Self {
        self.downloader_path = Some(path.into());
        self
    }

    /// Set the ffmpeg location.
    pub fn with_ffmpeg(mut self, path: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = Some(path.into());
        self
    }

    /// Set the proxy URL.
    pub fn with_proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    /// Set the cookie-source browser.
    pub fn with_cookies_from(mut self, browser: impl Into<String>) -> Self {
        self.cookies_from_browser = Some(browser.into());
        self
    }
}
