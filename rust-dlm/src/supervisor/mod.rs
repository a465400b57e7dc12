//! Process supervisor: owns the mapping from job id to a running OS
//! process and its cancellation token.
//!
//! Lifecycle notifications flow through a broadcast channel installed once
//! by the orchestrator: progress updates, resolved file names, generic
//! tagged output lines, and a final done event with the exit
//! classification. A user-initiated [`stop`](Supervise::stop) suppresses
//! the done event entirely; the explicit status transition already
//! recorded the outcome.

pub mod args;

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::io::AsyncReadExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::job::Job;
use crate::parser::{self, LineSplitter, ProgressInfo};
use crate::resolver::BinaryResolver;

/// Channel capacity for supervisor events.
const EVENT_CHANNEL_CAPACITY: usize = 512;

/// How many trailing stdout lines to keep for failure messages.
const STDOUT_TAIL_LINES: usize = 20;

/// Lifecycle events emitted for running jobs.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// A progress line was decoded.
    Progress { id: Uuid, progress: ProgressInfo },
    /// The output file name was resolved (computed up front, and again if
    /// the tool reports a different destination).
    FileName { id: Uuid, name: String },
    /// A bracketed output line that is not a progress update.
    Output { id: Uuid, tag: String, rest: String },
    /// The process finished. Never emitted for a user-stopped job.
    Done {
        id: Uuid,
        ok: bool,
        error: Option<String>,
    },
}

/// Supervision seam so the orchestrator can be tested with a stub.
#[async_trait]
pub trait Supervise: Send + Sync {
    /// Start a process for the job. No-op when one is already running (or
    /// starting) for this id. Failures surface as a `Done` event, never as
    /// a return value.
    async fn start(&self, job: &Job, resume: bool);

    /// Stop the job's process: mark the id user-cancelled, signal the
    /// token, and force-kill the process subtree as a fallback.
    async fn stop(&self, id: Uuid);

    fn is_running(&self, id: Uuid) -> bool;

    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent>;
}

/// Bookkeeping for one supervised process.
struct ActiveProcess {
    token: CancellationToken,
    /// `None` while the binary is still being resolved.
    pid: Option<u32>,
}

/// Spawns and supervises the external downloader binary.
pub struct ProcessSupervisor {
    settings: Arc<Settings>,
    resolver: Arc<BinaryResolver>,
    active: Arc<DashMap<Uuid, ActiveProcess>>,
    /// Ids stopped by the user; their exits are never classified as failures.
    cancelled: Arc<DashMap<Uuid, ()>>,
    event_tx: broadcast::Sender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new(settings: Arc<Settings>, resolver: Arc<BinaryResolver>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            resolver,
            active: Arc::new(DashMap::new()),
            cancelled: Arc::new(DashMap::new()),
            event_tx,
        }
    }

    fn emit(&self, event: SupervisorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn fail_start(&self, id: Uuid, message: String) {
        warn!(%id, error = %message, "downloader failed to start");
        self.active.remove(&id);
        self.emit(SupervisorEvent::Done {
            id,
            ok: false,
            error: Some(message),
        });
    }
}

#[async_trait]
impl Supervise for ProcessSupervisor {
    async fn start(&self, job: &Job, resume: bool) {
        let id = job.id;

        // Register bookkeeping before the async binary resolution so a
        // second start issued during that window sees the id as running
        // and backs off (closes the duplicate-spawn race).
        let token = CancellationToken::new();
        match self.active.entry(id) {
            Entry::Occupied(_) => {
                debug!(%id, "start ignored, process already active");
                return;
            }
            Entry::Vacant(slot) => {
                slot.insert(ActiveProcess {
                    token: token.clone(),
                    pid: None,
                });
            }
        }

        // A fresh start clears any stale user-cancellation mark.
        self.cancelled.remove(&id);

        let binary = match self.resolver.resolve().await {
            Ok(path) => path,
            Err(e) => {
                self.fail_start(id, e.to_string());
                return;
            }
        };

        let output_name = args::output_file_name(&job.payload);
        self.emit(SupervisorEvent::FileName {
            id,
            name: output_name,
        });

        let argv = args::build_args(&job.payload, &self.settings, resume);
        info!(%id, binary = %binary.display(), "starting download process");
        debug!(%id, ?argv, "downloader arguments");

        let mut command = process_utils::tokio_command(&binary);
        command
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.fail_start(id, format!("failed to spawn {}: {e}", binary.display()));
                return;
            }
        };

        let pid = child.id();
        if let Some(mut entry) = self.active.get_mut(&id) {
            entry.pid = pid;
        }

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let event_tx = self.event_tx.clone();

        // Stdout: chunked reads through the line splitter, emitting
        // progress / filename / generic tagged events. Returns a tail of
        // recent lines for failure-message fallback.
        let stdout_task = tokio::spawn(async move {
            let mut tail: Vec<String> = Vec::new();
            let Some(stdout) = stdout.as_mut() else {
                return tail;
            };

            let mut splitter = LineSplitter::new();
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in splitter.push(&buf[..n]) {
                            handle_stdout_line(&event_tx, id, &line, &mut tail);
                        }
                    }
                    Err(e) => {
                        error!(%id, error = %e, "error reading downloader stdout");
                        break;
                    }
                }
            }
            if let Some(line) = splitter.finish() {
                handle_stdout_line(&event_tx, id, &line, &mut tail);
            }
            tail
        });

        // Stderr: captured whole for exit classification.
        let stderr_task = tokio::spawn(async move {
            let mut captured = String::new();
            if let Some(stderr) = stderr.as_mut()
                && let Err(e) = stderr.read_to_string(&mut captured).await
            {
                error!(%id, error = %e, "error reading downloader stderr");
            }
            captured
        });

        // Waiter: supervises the child until exit or cancellation, then
        // classifies the outcome.
        let active = self.active.clone();
        let cancelled = self.cancelled.clone();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    debug!(%id, "stop requested, killing process tree");
                    // The downloader forks a transcoding child; kill the
                    // whole subtree, not just the root pid.
                    if let Some(pid) = pid {
                        process_utils::kill_tree(pid);
                    }
                    let _ = child.kill().await;
                    child.wait().await
                }
            };

            let stdout_tail = stdout_task.await.unwrap_or_default();
            let captured_stderr = stderr_task.await.unwrap_or_default();

            active.remove(&id);

            if cancelled.remove(&id).is_some() {
                // User-initiated stop: the explicit status transition
                // already recorded the outcome, so no done event fires.
                debug!(%id, "process closed after user stop");
                return;
            }

            match status {
                Ok(status) if status.success() => {
                    info!(%id, "download process completed");
                    let _ = event_tx.send(SupervisorEvent::Done {
                        id,
                        ok: true,
                        error: None,
                    });
                }
                Ok(status) => {
                    let message =
                        failure_message(&captured_stderr, &stdout_tail.join("\n"), &status);
                    warn!(%id, error = %message, "download process failed");
                    let _ = event_tx.send(SupervisorEvent::Done {
                        id,
                        ok: false,
                        error: Some(message),
                    });
                }
                Err(e) => {
                    let _ = event_tx.send(SupervisorEvent::Done {
                        id,
                        ok: false,
                        error: Some(format!("failed to await downloader: {e}")),
                    });
                }
            }
        });
    }

    async fn stop(&self, id: Uuid) {
        let Some(entry) = self.active.get(&id) else {
            debug!(%id, "stop ignored, no active process");
            return;
        };

        // Mark first so the waiter can never classify this exit as a
        // failure, then signal, then force-kill as a fallback.
        self.cancelled.insert(id, ());
        entry.token.cancel();
        let pid = entry.pid;
        drop(entry);

        if let Some(pid) = pid {
            process_utils::kill_tree(pid);
        }
        info!(%id, "stop requested");
    }

    fn is_running(&self, id: Uuid) -> bool {
        self.active.contains_key(&id)
    }

    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }
}

fn handle_stdout_line(
    event_tx: &broadcast::Sender<SupervisorEvent>,
    id: Uuid,
    line: &str,
    tail: &mut Vec<String>,
) {
    if tail.len() == STDOUT_TAIL_LINES {
        tail.remove(0);
    }
    tail.push(line.to_string());

    let Some(event) = parser::parse_line(line) else {
        return;
    };

    if let Some(progress) = event.progress {
        let _ = event_tx.send(SupervisorEvent::Progress { id, progress });
        return;
    }

    if let Some(destination) = parser::parse_destination(&event.rest) {
        let name = std::path::Path::new(destination)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| destination.to_string());
        let _ = event_tx.send(SupervisorEvent::FileName { id, name });
    }

    let _ = event_tx.send(SupervisorEvent::Output {
        id,
        tag: event.tag,
        rest: event.rest,
    });
}

/// Build a failure message: warning lines stripped from stderr, falling
/// back to raw stderr then stdout, with the exit reason appended.
fn failure_message(stderr: &str, stdout: &str, status: &std::process::ExitStatus) -> String {
    let stripped: String = stderr
        .lines()
        .filter(|line| !line.trim_start().starts_with("WARNING:"))
        .collect::<Vec<_>>()
        .join("\n");

    let body = if !stripped.trim().is_empty() {
        stripped.trim().to_string()
    } else if !stderr.trim().is_empty() {
        stderr.trim().to_string()
    } else {
        stdout.trim().to_string()
    };

    let reason = exit_reason(status);
    if body.is_empty() {
        reason
    } else {
        format!("{body} ({reason})")
    }
}

fn exit_reason(status: &std::process::ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal {signal}");
        }
    }

    "unknown exit status".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DownloadPayload, FormatSelection, JobStatus, MediaKind};
    use std::time::Duration;

    fn job() -> Job {
        Job::new(
            DownloadPayload {
                kind: MediaKind::Video,
                url: "https://example.com/watch?v=abc".to_string(),
                title: "clip".to_string(),
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
            },
            JobStatus::Downloading,
        )
    }

    #[cfg(unix)]
    async fn fake_downloader(dir: &tempfile::TempDir, script: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("yt-dlp");
        tokio::fs::write(&path, format!("#!/bin/sh\n{script}\n"))
            .await
            .unwrap();
        let mut perms = tokio::fs::metadata(&path).await.unwrap().permissions();
        perms.set_mode(0o755);
        tokio::fs::set_permissions(&path, perms).await.unwrap();
        path
    }

    fn supervisor_with(binary: std::path::PathBuf) -> ProcessSupervisor {
        let settings = Arc::new(Settings::new(3, std::env::temp_dir()));
        let resolver = Arc::new(BinaryResolver::new(Some(binary)));
        ProcessSupervisor::new(settings, resolver)
    }

    async fn next_done(
        rx: &mut broadcast::Receiver<SupervisorEvent>,
    ) -> Option<(bool, Option<String>)> {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .ok()?
                .ok()?;
            if let SupervisorEvent::Done { ok, error, .. } = event {
                return Some((ok, error));
            }
        }
    }

    #[tokio::test]
    async fn unresolvable_binary_reports_done_failure() {
        let supervisor = supervisor_with(std::path::PathBuf::from("/nonexistent/yt-dlp"));
        let mut rx = supervisor.subscribe();

        let job = job();
        supervisor.start(&job, false).await;

        let (ok, error) = next_done(&mut rx).await.unwrap();
        assert!(!ok);
        assert!(error.is_some());
        assert!(!supervisor.is_running(job.id));
    }

    #[tokio::test]
    async fn stop_without_process_is_a_noop() {
        let supervisor = supervisor_with(std::path::PathBuf::from("/nonexistent/yt-dlp"));
        supervisor.stop(Uuid::new_v4()).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_exit_emits_done_ok() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_downloader(&dir, "echo '[download] 100% of 1.00MiB'").await;
        let supervisor = supervisor_with(binary);
        let mut rx = supervisor.subscribe();

        let job = job();
        supervisor.start(&job, false).await;

        let (ok, error) = next_done(&mut rx).await.unwrap();
        assert!(ok);
        assert!(error.is_none());
        assert!(!supervisor.is_running(job.id));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failure_message_strips_warnings_and_appends_exit_reason() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_downloader(
            &dir,
            "echo 'WARNING: noise' >&2; echo 'ERROR: unavailable' >&2; exit 3",
        )
        .await;
        let supervisor = supervisor_with(binary);
        let mut rx = supervisor.subscribe();

        supervisor.start(&job(), false).await;

        let (ok, error) = next_done(&mut rx).await.unwrap();
        assert!(!ok);
        let message = error.unwrap();
        assert!(message.contains("ERROR: unavailable"), "{message}");
        assert!(message.contains("exit code 3"), "{message}");
        assert!(!message.contains("WARNING"), "{message}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn user_stop_suppresses_done_even_on_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        // Exits 1 when killed or when the sleep ends; neither may surface.
        let binary = fake_downloader(&dir, "sleep 30; exit 1").await;
        let supervisor = supervisor_with(binary);
        let mut rx = supervisor.subscribe();

        let job = job();
        supervisor.start(&job, false).await;
        assert!(supervisor.is_running(job.id));

        supervisor.stop(job.id).await;

        // No Done event within the grace window, and the process is gone.
        let got = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                match rx.recv().await {
                    Ok(SupervisorEvent::Done { .. }) => break true,
                    Ok(_) => continue,
                    Err(_) => break false,
                }
            }
        })
        .await;
        assert!(matches!(got, Err(_) | Ok(false)), "done event leaked");
        assert!(!supervisor.is_running(job.id));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_start_for_same_id_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_downloader(&dir, "sleep 30").await;
        let supervisor = supervisor_with(binary);
        let mut rx = supervisor.subscribe();

        let job = job();
        supervisor.start(&job, false).await;
        supervisor.start(&job, false).await;

        // Exactly one FileName event: the duplicate start backed off before
        // resolving anything.
        let mut filename_events = 0;
        while let Ok(Ok(event)) =
            tokio::time::timeout(Duration::from_millis(500), rx.recv()).await
        {
            if matches!(event, SupervisorEvent::FileName { .. }) {
                filename_events += 1;
            }
        }
        assert_eq!(filename_events, 1);

        supervisor.stop(job.id).await;
    }

    #[cfg(unix)]
    #[test]
    fn exit_reason_formats_code_and_signal() {
        use std::os::unix::process::ExitStatusExt;
        use std::process::ExitStatus;

        assert_eq!(exit_reason(&ExitStatus::from_raw(3 << 8)), "exit code 3");
        assert_eq!(exit_reason(&ExitStatus::from_raw(9)), "signal 9");
    }

    #[test]
    fn failure_message_fallbacks() {
        let ok_status = fake_status();

        // Only warnings in stderr: fall back to raw stderr.
        let msg = failure_message("WARNING: a\nWARNING: b", "", &ok_status);
        assert!(msg.contains("WARNING: a"));

        // Nothing anywhere: just the exit reason.
        let msg = failure_message("", "", &ok_status);
        assert_eq!(msg, exit_reason(&ok_status));

        // Empty stderr falls back to stdout.
        let msg = failure_message("", "[download] last line", &ok_status);
        assert!(msg.contains("last line"));
    }

    fn fake_status() -> std::process::ExitStatus {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            std::process::ExitStatus::from_raw(1 << 8)
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::ExitStatusExt;
            std::process::ExitStatus::from_raw(1)
        }
    }
}
