//! Metadata lookups via the downloader's single-document mode.
//!
//! The binary is invoked with playlist expansion, warnings, and the actual
//! download suppressed, forcing IPv4 and requesting exactly one JSON
//! document on stdout.

use tracing::debug;

use crate::parser::JsonDocBuffer;
use crate::resolver::BinaryResolver;
use crate::{Error, Result};

/// Flags for single-document metadata mode.
const METADATA_FLAGS: [&str; 5] = [
    "--no-playlist",
    "--no-warnings",
    "--skip-download",
    "--force-ipv4",
    "--dump-single-json",
];

/// Fetch the media metadata document for `url`.
pub async fn fetch(resolver: &BinaryResolver, url: &str) -> Result<serde_json::Value> {
    let binary = resolver.resolve().await?;
    debug!(binary = %binary.display(), url, "fetching metadata");

    let output = process_utils::tokio_command(&binary)
        .args(METADATA_FLAGS)
        .arg(url)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| Error::spawn(format!("failed to spawn {}: {e}", binary.display())))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::ProcessExit(format!(
            "metadata fetch failed: {}",
            stderr.trim()
        )));
    }

    let mut buffer = JsonDocBuffer::new();
    buffer.push(&output.stdout);
    buffer.finish()
}
