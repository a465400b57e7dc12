//! Downloader command-line construction.
//!
//! Arguments are passed as discrete argv entries via `tokio::process`, so
//! no shell quoting layer exists; file names are sanitized instead.

use std::path::PathBuf;

use crate::config::Settings;
use crate::job::{DownloadPayload, FormatSelection, MediaKind};

/// Audio codecs an mp4 container cannot hold.
const MP4_INCOMPATIBLE_AUDIO: [&str; 2] = ["opus", "vorbis"];

/// Pick the output container for the payload's format selection.
///
/// The requested container usually wins, but some track pairings force a
/// different one: an mp4 video track paired with an opus-only audio track
/// must fall back to matroska.
pub fn resolve_container(format: &FormatSelection) -> String {
    if format.container == "mp4"
        && let Some(codec) = &format.audio_codec
        && MP4_INCOMPATIBLE_AUDIO.contains(&codec.as_str())
    {
        return "mkv".to_string();
    }
    format.container.clone()
}

/// Replace path separators and reserved characters in a display title.
pub fn sanitize_file_name(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Final output file name for a job: the previously resolved name when
/// present, otherwise sanitized title + compatible container extension.
pub fn output_file_name(payload: &DownloadPayload) -> String {
    if let Some(name) = &payload.output_name {
        return name.clone();
    }
    format!(
        "{}.{}",
        sanitize_file_name(&payload.title),
        resolve_container(&payload.format)
    )
}

/// The `-f` selector: `video+audio`, or a bare audio id for audio jobs.
fn format_selector(payload: &DownloadPayload) -> Option<String> {
    let format = &payload.format;
    match payload.kind {
        MediaKind::Video => match (&format.video_format_id, &format.audio_format_id) {
            (Some(video), Some(audio)) => Some(format!("{video}+{audio}")),
            (Some(video), None) => Some(video.clone()),
            _ => None,
        },
        MediaKind::Audio => format.audio_format_id.clone(),
    }
}

/// Build the full argument vector for one job.
pub fn build_args(payload: &DownloadPayload, settings: &Settings, resume: bool) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(selector) = format_selector(payload) {
        args.extend(["-f".to_string(), selector]);
    }

    let output_path: PathBuf = settings.download_dir.join(output_file_name(payload));
    args.extend(["-o".to_string(), output_path.to_string_lossy().to_string()]);

    if let Some(section) = &payload.section {
        args.extend(["--download-sections".to_string(), section.clone()]);
    }

    if let Some(langs) = &payload.subtitle_langs {
        args.extend([
            "--write-subs".to_string(),
            "--sub-langs".to_string(),
            langs.clone(),
        ]);
    }

    if let Some(browser) = &settings.cookies_from_browser {
        args.extend(["--cookies-from-browser".to_string(), browser.clone()]);
    }

    if let Some(proxy) = &settings.proxy_url {
        args.extend(["--proxy".to_string(), proxy.clone()]);
    }

    if let Some(config) = &settings.extra_config_path {
        args.extend([
            "--config-locations".to_string(),
            config.to_string_lossy().to_string(),
        ]);
    }

    if let Some(ffmpeg) = &settings.ffmpeg_path {
        args.extend([
            "--ffmpeg-location".to_string(),
            ffmpeg.to_string_lossy().to_string(),
        ]);
    }

    if let Some(runtime) = &settings.script_runtime_path {
        args.extend([
            "--js-runtime".to_string(),
            runtime.to_string_lossy().to_string(),
        ]);
    }

    if resume {
        // Best-effort continuation: the tool owns partial-file handling.
        args.extend(["--continue".to_string(), "--no-overwrites".to_string()]);
    }

    args.push(payload.url.clone());
    args
}
