//! Downloader binary resolution.
//!
//! Resolution is asynchronous and memoized: the cache lock is held across
//! the whole lookup, so concurrent callers share one in-flight resolution
//! instead of probing the filesystem in parallel.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// Base name of the external downloader binary.
pub const DOWNLOADER_BINARY: &str = "yt-dlp";

fn binary_file_name() -> String {
    if cfg!(windows) {
        format!("{DOWNLOADER_BINARY}.exe")
    } else {
        DOWNLOADER_BINARY.to_string()
    }
}

/// Locates the downloader binary once and caches the answer.
pub struct BinaryResolver {
    /// Explicitly configured path, tried first.
    configured: Option<PathBuf>,
    cache: Mutex<Option<PathBuf>>,
}

impl BinaryResolver {
    pub fn new(configured: Option<PathBuf>) -> Self {
        Self {
            configured,
            cache: Mutex::new(None),
        }
    }

    /// Resolve the binary path: configured location, then beside the
    /// current executable, then `$PATH`.
    pub async fn resolve(&self) -> Result<PathBuf> {
        let mut cache = self.cache.lock().await;
        if let Some(path) = cache.as_ref() {
            return Ok(path.clone());
        }

        let path = self.locate().await?;
        info!(path = %path.display(), "resolved downloader binary");
        *cache = Some(path.clone());
        Ok(path)
    }

    /// Drop the memoized path, e.g. after a self-update replaced the file.
    pub async fn invalidate(&self) {
        self.cache.lock().await.take();
    }

    async fn locate(&self) -> Result<PathBuf> {
        if let Some(configured) = &self.configured {
            if is_file(configured).await {
                return Ok(configured.clone());
            }
            debug!(path = %configured.display(), "configured downloader path missing");
        }

        let name = binary_file_name();

        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            let candidate = dir.join(&name);
            if is_file(&candidate).await {
                return Ok(candidate);
            }
        }

        if let Some(path_var) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path_var) {
                let candidate = dir.join(&name);
                if is_file(&candidate).await {
                    return Ok(candidate);
                }
            }
        }

        Err(Error::spawn(format!(
            "{DOWNLOADER_BINARY} binary not found (configured path, executable directory, PATH)"
        )))
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
