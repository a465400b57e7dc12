//! Job model: the central entity tracked by the store and orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Created but not yet admitted by the queue controller.
    Pending,
    /// Waiting for a concurrency slot.
    Queued,
    /// A downloader process is (or is about to be) running.
    Downloading,
    /// Stopped by the user; resumable.
    Paused,
    /// Finished successfully.
    Completed,
    /// The downloader exited abnormally.
    Failed,
    /// Stopped by the user; not resumable.
    Canceled,
    /// Soft-deleted: kept in the store, hidden from active views.
    Deleted,
}

impl JobStatus {
    /// Statuses from which no further automatic transition occurs.
    pub const TERMINAL: [JobStatus; 4] = [
        Self::Completed,
        Self::Failed,
        Self::Canceled,
        Self::Deleted,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Whether the lifecycle edge `self -> to` is part of the state machine.
    ///
    /// Soft deletion is reachable from every status, since removal is a
    /// user-driven operation that must always succeed.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        if to == Self::Deleted {
            return self != Self::Deleted;
        }
        match self {
            Self::Pending => matches!(to, Self::Queued | Self::Downloading | Self::Canceled),
            Self::Queued => matches!(to, Self::Downloading | Self::Canceled),
            Self::Downloading => matches!(
                to,
                Self::Paused | Self::Completed | Self::Failed | Self::Canceled
            ),
            // A resumed job re-runs admission and may land back in the queue.
            Self::Paused => matches!(to, Self::Downloading | Self::Queued | Self::Canceled),
            Self::Completed | Self::Failed | Self::Canceled | Self::Deleted => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of media track the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

/// Snapshot of the user's format/quality choices at submission time.
///
/// Captured on the payload so later settings changes do not retroactively
/// alter an in-flight job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatSelection {
    /// Selected video format id (absent for audio-only jobs).
    pub video_format_id: Option<String>,
    /// Selected audio format id.
    pub audio_format_id: Option<String>,
    /// Requested output container, e.g. "mp4" or "m4a".
    pub container: String,
    /// Codec of the selected audio track, when known. Drives the container
    /// compatibility table (mp4 cannot hold opus).
    pub audio_codec: Option<String>,
}

/// Immutable download specification carried by a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPayload {
    pub kind: MediaKind,
    /// Source media URL.
    pub url: String,
    /// Display title.
    pub title: String,
    /// Thumbnail reference for the UI.
    #[serde(default)]
    pub thumbnail: Option<String>,
    /// Resolved output file name, filled in once the supervisor computes it.
    #[serde(default)]
    pub output_name: Option<String>,
    /// Optional `--download-sections` range fragment.
    #[serde(default)]
    pub section: Option<String>,
    /// Subtitle languages to embed; `None` disables subtitle flags.
    #[serde(default)]
    pub subtitle_langs: Option<String>,
    pub format: FormatSelection,
}

/// A single user-requested download with its mutable lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,
    /// Percentage 0-100; only meaningful while downloading.
    pub progress: f64,
    /// Human-readable failure reason; cleared on re-entering `downloading`.
    #[serde(default)]
    pub error: Option<String>,
    /// Output file size in bytes, resolved from disk after completion.
    #[serde(default)]
    pub size_bytes: Option<u64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    pub payload: DownloadPayload,
}

impl Job {
    /// Create a job with a freshly assigned id.
    pub fn new(payload: DownloadPayload, status: JobStatus) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status,
            progress: 0.0,
            error: None,
            size_bytes: None,
            created_at: now,
            updated_at: now,
            payload,
        }
    }

    /// Refresh the modification timestamp. Call after every mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Apply a status change, clearing stale errors when the job goes back
    /// to `downloading`.
    pub fn set_status(&mut self, status: JobStatus) {
        if status == JobStatus::Downloading {
            self.error = None;
        }
        self.status = status;
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> DownloadPayload {
        DownloadPayload {
            kind: MediaKind::Video,
            url: "https://example.com/watch?v=abc".to_string(),
            title: "example".to_string(),
            thumbnail: None,
            output_name: None,
            section: None,
            subtitle_langs: None,
            format: FormatSelection {
                video_format_id: Some("137".to_string()),
                audio_format_id: Some("140".to_string()),
                container: "mp4".to_string(),
                audio_codec: Some("aac".to_string()),
            },
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Deleted.is_terminal());
        assert!(!JobStatus::Downloading.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
    }

    #[test]
    fn transition_edges() {
        use JobStatus::*;
        assert!(Queued.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Queued));
        assert!(Downloading.can_transition_to(Deleted));
        assert!(!Completed.can_transition_to(Downloading));
        assert!(!Deleted.can_transition_to(Deleted));
    }

    #[test]
    fn set_status_clears_error_on_downloading() {
        let mut job = Job::new(payload(), JobStatus::Paused);
        job.error = Some("network unreachable".to_string());
        job.set_status(JobStatus::Downloading);
        assert!(job.error.is_none());

        job.error = Some("boom".to_string());
        job.set_status(JobStatus::Paused);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn serde_round_trip_uses_millisecond_timestamps() {
        let job = Job::new(payload(), JobStatus::Queued);
        let value = serde_json::to_value(&job).unwrap();
        assert!(value["created_at"].is_i64());
        assert_eq!(value["status"], "queued");

        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.payload, job.payload);
    }
}
