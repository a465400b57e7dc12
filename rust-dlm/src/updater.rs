//! Downloader binary self-update.
//!
//! A plain HTTP fetch with three guard rails: a bounded redirect-follow
//! count, progress tracked against the `content-length` header, and a
//! stall timeout that resets on every received chunk and aborts the
//! transfer if no bytes arrive within the window.

use std::path::Path;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::{Error, Result};

/// Redirect-follow bound for release downloads.
const MAX_REDIRECTS: usize = 10;

/// Abort the transfer when no chunk arrives within this window.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes-received progress for an in-flight update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateProgress {
    pub received: u64,
    /// From the `content-length` header; absent for chunked responses.
    pub total: Option<u64>,
}

/// Download a new binary from `url` and atomically replace `dest`.
pub async fn download_binary(
    url: &str,
    dest: &Path,
    on_progress: impl FnMut(UpdateProgress),
) -> Result<()> {
    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .build()
        .map_err(|e| Error::Update(format!("failed to build http client: {e}")))?;

    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::Update(format!("update fetch failed: {e}")))?;

    let total = response.content_length();
    let tmp = dest.with_extension("update.part");
    let mut file = tokio::fs::File::create(&tmp).await?;

    let result = copy_with_stall_timeout(
        response.bytes_stream(),
        &mut file,
        total,
        STALL_TIMEOUT,
        on_progress,
    )
    .await;

    if let Err(e) = result {
        drop(file);
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }

    file.flush().await?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = tokio::fs::metadata(&tmp).await?.permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&tmp, perms).await?;
    }

    tokio::fs::rename(&tmp, dest).await?;
    info!(dest = %dest.display(), "downloader binary updated");
    Ok(())
}

/// Drain `stream` into `writer`, enforcing the per-chunk stall window.
async fn copy_with_stall_timeout<S, E, W>(
    mut stream: S,
    writer: &mut W,
    total: Option<u64>,
    stall: Duration,
    mut on_progress: impl FnMut(UpdateProgress),
) -> Result<()>
where
    S: Stream<Item = std::result::Result<bytes::Bytes, E>> + Unpin,
    E: std::fmt::Display,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut received = 0u64;
    loop {
        let chunk = match tokio::time::timeout(stall, stream.next()).await {
            Err(_) => {
                return Err(Error::Update(format!(
                    "transfer stalled: no data within {}s",
                    stall.as_secs()
                )));
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                return Err(Error::Update(format!("transfer interrupted: {e}")));
            }
            Ok(Some(Ok(chunk))) => chunk,
        };

        writer.write_all(&chunk).await?;
        received += chunk.len() as u64;
        on_progress(UpdateProgress { received, total });
    }
    Ok(())
}
