//! History projection: a read-only view over terminal-status jobs.
//!
//! The projector shares the job store with the orchestrator but only ever
//! sees `{completed, failed, canceled, deleted}` records; hard removal of
//! job records happens here and nowhere else.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::events::{EventBroadcaster, HistoryEvent};
use crate::job::{Job, JobStatus, MediaKind};
use crate::store::JobStore;
use crate::{Error, Result};

/// Sort key for history listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Created,
    Updated,
    Title,
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Query parameters for [`HistoryProjector::list`].
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Restrict to these terminal statuses; `None` means all four.
    pub statuses: Option<Vec<JobStatus>>,
    pub kind: Option<MediaKind>,
    /// Case-insensitive substring match over title and URL.
    pub search: Option<String>,
    pub sort_by: SortField,
    pub order: SortOrder,
    /// 1-based page number; 0 is treated as 1.
    pub page: u32,
    pub page_size: u32,
}

/// One page of history entries.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub items: Vec<Job>,
    pub next_page: Option<u32>,
}

/// Aggregate statistics over terminal jobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HistoryStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub deleted: usize,
    /// Known byte totals across all terminal jobs.
    pub total_bytes: u64,
    /// Known byte totals across completed jobs.
    pub completed_bytes: u64,
}

/// Read-only filtered/sorted/paginated projection plus the only hard-delete
/// path in the engine.
pub struct HistoryProjector {
    store: Arc<JobStore>,
    settings: Arc<Settings>,
    events: EventBroadcaster<HistoryEvent>,
}

impl HistoryProjector {
    pub fn new(store: Arc<JobStore>, settings: Arc<Settings>) -> Self {
        Self {
            store,
            settings,
            events: EventBroadcaster::new(),
        }
    }

    /// Subscribe to history-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    /// List terminal jobs matching the query.
    pub async fn list(&self, query: HistoryQuery) -> Result<HistoryPage> {
        let statuses = query
            .statuses
            .clone()
            .unwrap_or_else(|| JobStatus::TERMINAL.to_vec());

        let mut items: Vec<Job> = self
            .store
            .get_all()
            .await?
            .into_iter()
            .filter(|j| j.status.is_terminal() && statuses.contains(&j.status))
            .filter(|j| query.kind.is_none_or(|k| j.payload.kind == k))
            .filter(|j| match &query.search {
                Some(needle) => {
                    let needle = needle.to_lowercase();
                    j.payload.title.to_lowercase().contains(&needle)
                        || j.payload.url.to_lowercase().contains(&needle)
                }
                None => true,
            })
            .collect();

        items.sort_by(|a, b| {
            let ordering = match query.sort_by {
                SortField::Created => a.created_at.cmp(&b.created_at),
                SortField::Updated => a.updated_at.cmp(&b.updated_at),
                SortField::Title => cmp_ci(&a.payload.title, &b.payload.title),
                SortField::Url => cmp_ci(&a.payload.url, &b.payload.url),
            };
            match query.order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });

        let page = query.page.max(1);
        if query.page_size == 0 {
            return Ok(HistoryPage {
                items,
                next_page: None,
            });
        }

        let start = ((page - 1) as usize).saturating_mul(query.page_size as usize);
        let has_more = items.len() > start + query.page_size as usize;
        let items: Vec<Job> = items
            .into_iter()
            .skip(start)
            .take(query.page_size as usize)
            .collect();

        Ok(HistoryPage {
            items,
            next_page: has_more.then(|| page + 1),
        })
    }

    /// Counts per terminal status plus byte totals.
    ///
    /// Completed jobs without a recorded size get their output file stat-ed
    /// the first time they are observed here, and the result is persisted.
    pub async fn stats(&self) -> Result<HistoryStats> {
        self.resolve_missing_sizes().await?;

        let jobs = self.store.get_all().await?;
        let mut stats = HistoryStats::default();
        for job in jobs.iter().filter(|j| j.status.is_terminal()) {
            stats.total += 1;
            match job.status {
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Canceled => stats.canceled += 1,
                JobStatus::Deleted => stats.deleted += 1,
                _ => unreachable!(),
            }
            if let Some(size) = job.size_bytes {
                stats.total_bytes += size;
                if job.status == JobStatus::Completed {
                    stats.completed_bytes += size;
                }
            }
        }
        Ok(stats)
    }

    /// Hard-remove one job. Rejected unless its status is terminal.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.store
            .mutate(|jobs| {
                let index = jobs
                    .iter()
                    .position(|j| j.id == id)
                    .ok_or_else(|| Error::not_found("job", id.to_string()))?;
                if !jobs[index].status.is_terminal() {
                    return Err(Error::validation(format!(
                        "cannot delete job in status {}",
                        jobs[index].status
                    )));
                }
                jobs.remove(index);
                Ok(())
            })
            .await??;

        info!(%id, "history entry deleted");
        self.events.publish(HistoryEvent::Deleted { id });
        Ok(())
    }

    /// Hard-remove every terminal job, returning how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self
            .store
            .mutate(|jobs| {
                let before = jobs.len();
                jobs.retain(|j| !j.status.is_terminal());
                before - jobs.len()
            })
            .await?;

        info!(removed, "history cleared");
        if removed > 0 {
            self.events.publish(HistoryEvent::Cleared);
        }
        Ok(removed)
    }

    /// Stat completed output files whose size has not been recorded yet.
    async fn resolve_missing_sizes(&self) -> Result<()> {
        let jobs = self.store.get_all().await?;
        let mut resolved = Vec::new();
        for job in jobs.iter().filter(|j| {
            j.status == JobStatus::Completed
                && j.size_bytes.is_none()
                && j.payload.output_name.is_some()
        }) {
            let name = job.payload.output_name.as_deref().unwrap_or_default();
            let path = self.settings.download_dir.join(name);
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                debug!(id = %job.id, size = meta.len(), "resolved output file size");
                resolved.push((job.id, meta.len()));
            }
        }

        if resolved.is_empty() {
            return Ok(());
        }

        self.store
            .mutate(|jobs| {
                for (id, size) in &resolved {
                    if let Some(job) = jobs.iter_mut().find(|j| j.id == *id) {
                        job.size_bytes = Some(*size);
                        job.touch();
                    }
                }
            })
            .await
    }
}

fn cmp_ci(a: &str, b: &str) -> Ordering {
    a.to_lowercase().cmp(&b.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DownloadPayload, FormatSelection};

    fn job(title: &str, status: JobStatus) -> Job {
        Job::new(
            DownloadPayload {
                kind: MediaKind::Video,
                url: format!("https://example.com/{title}"),
                title: title.to_string(),
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
            status,
        )
    }

    async fn projector(
        jobs: Vec<Job>,
    ) -> (HistoryProjector, Arc<JobStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")));
        store.save_all(&jobs).await.unwrap();
        let settings = Arc::new(Settings::new(3, dir.path()));
        let projector = HistoryProjector::new(store.clone(), settings);
        (projector, store, dir)
    }

    #[tokio::test]
    async fn list_is_restricted_to_terminal_statuses() {
        let (projector, _store, _dir) = projector(vec![
            job("active", JobStatus::Downloading),
            job("done", JobStatus::Completed),
            job("gone", JobStatus::Deleted),
        ])
        .await;

        let page = projector.list(HistoryQuery::default()).await.unwrap();
        let titles: Vec<_> = page.items.iter().map(|j| j.payload.title.as_str()).collect();
        assert!(!titles.contains(&"active"));
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn search_matches_title_and_url_case_insensitively() {
        let (projector, _store, _dir) = projector(vec![
            job("My Mixtape", JobStatus::Completed),
            job("other", JobStatus::Failed),
        ])
        .await;

        let page = projector
            .list(HistoryQuery {
                search: Some("MIXTAPE".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);

        // URL substring also matches.
        let page = projector
            .list(HistoryQuery {
                search: Some("example.com/other".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].payload.title, "other");
    }

    #[tokio::test]
    async fn sorts_by_title_ascending() {
        let (projector, _store, _dir) = projector(vec![
            job("banana", JobStatus::Completed),
            job("Apple", JobStatus::Completed),
            job("cherry", JobStatus::Failed),
        ])
        .await;

        let page = projector
            .list(HistoryQuery {
                sort_by: SortField::Title,
                order: SortOrder::Asc,
                ..Default::default()
            })
            .await
            .unwrap();
        let titles: Vec<_> = page.items.iter().map(|j| j.payload.title.as_str()).collect();
        assert_eq!(titles, vec!["Apple", "banana", "cherry"]);
    }

    #[tokio::test]
    async fn pagination_cursor_exhausts() {
        let terminal: Vec<Job> = (0..5)
            .map(|i| job(&format!("j{i}"), JobStatus::Completed))
            .collect();
        let (projector, _store, _dir) = projector(terminal).await;

        let page = projector
            .list(HistoryQuery {
                page: 2,
                page_size: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_page, Some(3));

        let page = projector
            .list(HistoryQuery {
                page: 3,
                page_size: 2,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.next_page, None);
    }

    #[tokio::test]
    async fn delete_rejects_active_jobs() {
        let active = job("active", JobStatus::Downloading);
        let id = active.id;
        let (projector, store, _dir) = projector(vec![active]).await;

        let err = projector.delete(id).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_removes_terminal_job_and_broadcasts() {
        let failed = job("failed", JobStatus::Failed);
        let id = failed.id;
        let (projector, store, _dir) = projector(vec![failed]).await;
        let mut rx = projector.subscribe();

        projector.delete(id).await.unwrap();
        assert!(store.get_all().await.unwrap().is_empty());
        assert!(matches!(
            rx.recv().await.unwrap(),
            HistoryEvent::Deleted { id: got } if got == id
        ));
    }

    #[tokio::test]
    async fn clear_keeps_active_jobs() {
        let (projector, store, _dir) = projector(vec![
            job("running", JobStatus::Downloading),
            job("queued", JobStatus::Queued),
            job("done", JobStatus::Completed),
            job("failed", JobStatus::Failed),
        ])
        .await;
        let mut rx = projector.subscribe();

        let removed = projector.clear().await.unwrap();
        assert_eq!(removed, 2);

        let remaining = store.get_all().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|j| !j.status.is_terminal()));
        assert!(matches!(rx.recv().await.unwrap(), HistoryEvent::Cleared));
    }

    #[tokio::test]
    async fn stats_counts_and_resolves_completed_sizes() {
        let mut done = job("done", JobStatus::Completed);
        done.payload.output_name = Some("done.mp4".to_string());
        let done_id = done.id;

        let mut sized = job("sized", JobStatus::Completed);
        sized.size_bytes = Some(100);

        let (projector, store, dir) = projector(vec![
            done,
            sized,
            job("failed", JobStatus::Failed),
            job("running", JobStatus::Downloading),
        ])
        .await;

        // The output file appears on disk; stats must pick its size up.
        tokio::fs::write(dir.path().join("done.mp4"), vec![0u8; 2048])
            .await
            .unwrap();

        let stats = projector.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed_bytes, 2148);
        assert_eq!(stats.total_bytes, 2148);

        // The resolved size was persisted back to the store.
        let jobs = store.get_all().await.unwrap();
        let done = jobs.iter().find(|j| j.id == done_id).unwrap();
        assert_eq!(done.size_bytes, Some(2048));
    }
}
