//! Job service: the orchestrator exposed to the UI boundary.
//!
//! Wires queue-controller decisions to supervisor calls and store writes,
//! and fans out job-changed events. Engine-level failures are recorded on
//! the job record and broadcast; they never cross this boundary as errors.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::events::{EventBroadcaster, JobEvent};
use crate::job::{DownloadPayload, Job, JobStatus};
use crate::queue;
use crate::store::JobStore;
use crate::supervisor::{Supervise, SupervisorEvent};
use crate::{Error, Result};

/// Query parameters for [`JobService::list`].
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// Restrict to these statuses; `None` means all.
    pub statuses: Option<Vec<JobStatus>>,
    /// 1-based page number; 0 is treated as 1.
    pub page: u32,
    pub page_size: u32,
}

/// One page of jobs plus a cursor for the next.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub items: Vec<Job>,
    /// `None` when the listing is exhausted.
    pub next_page: Option<u32>,
}

/// Orchestrator over store, queue decisions, and the process supervisor.
pub struct JobService {
    store: Arc<JobStore>,
    supervisor: Arc<dyn Supervise>,
    settings: Arc<Settings>,
    events: EventBroadcaster<JobEvent>,
}

impl JobService {
    pub fn new(
        store: Arc<JobStore>,
        supervisor: Arc<dyn Supervise>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            supervisor,
            settings,
            events: EventBroadcaster::new(),
        })
    }

    /// Subscribe to job-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Install the supervisor event dispatch loop. Call once at startup.
    pub fn start_dispatch(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        let mut rx = service.supervisor.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => service.handle_supervisor_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "supervisor event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Admit a new job: id allocation, queue decision, persist, broadcast,
    /// and start the process when a slot was free.
    pub async fn add(&self, payload: DownloadPayload) -> Result<Job> {
        let max = self.settings.max_concurrent;
        let job = self
            .store
            .mutate(|jobs| {
                let status = queue::decide_initial_status(jobs, max);
                let job = Job::new(payload, status);
                // New jobs go to the front of the collection; promotion
                // scans from the front, so this biases toward recency.
                jobs.insert(0, job.clone());
                job
            })
            .await?;

        info!(id = %job.id, status = %job.status, title = %job.payload.title, "job added");
        self.events.publish(JobEvent::Added { job: job.clone() });

        if job.status == JobStatus::Downloading {
            self.supervisor.start(&job, false).await;
        }
        Ok(job)
    }

    /// Persist an explicit status transition and run its side effects.
    pub async fn update_status(&self, id: Uuid, status: JobStatus) -> Result<Job> {
        let job = self.set_status(id, status).await?;
        self.events.publish(JobEvent::Updated { job: job.clone() });

        match status {
            JobStatus::Downloading => {
                self.supervisor.start(&job, false).await;
            }
            JobStatus::Paused | JobStatus::Canceled => {
                self.supervisor.stop(id).await;
            }
            _ => {}
        }

        if matches!(
            status,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled | JobStatus::Paused
        ) {
            self.promote_next().await?;
        }
        Ok(job)
    }

    /// Pause a downloading job. Pausing an already-paused job is a no-op:
    /// no state change, no broadcast.
    pub async fn pause(&self, id: Uuid) -> Result<Job> {
        let current = self.get(id).await?;
        match current.status {
            JobStatus::Paused => return Ok(current),
            JobStatus::Downloading => {}
            other => return Err(Error::invalid_transition(other, JobStatus::Paused)),
        }

        let job = self.set_status(id, JobStatus::Paused).await?;
        self.events.publish(JobEvent::Updated { job: job.clone() });
        self.supervisor.stop(id).await;
        self.promote_next().await?;
        Ok(job)
    }

    /// Resume a paused job. Admission is re-run, so a resumed job lands in
    /// `queued` when the slots have been taken in the meantime.
    pub async fn resume(&self, id: Uuid) -> Result<Job> {
        let max = self.settings.max_concurrent;
        let job = self
            .store
            .mutate(|jobs| {
                let status = queue::decide_initial_status(jobs, max);
                let job = jobs.iter_mut().find(|j| j.id == id)?;
                if job.status != JobStatus::Paused {
                    return Some(Err(Error::invalid_transition(job.status, status)));
                }
                job.set_status(status);
                Some(Ok(job.clone()))
            })
            .await?
            .ok_or_else(|| Error::not_found("job", id.to_string()))??;

        info!(id = %job.id, status = %job.status, "job resumed");
        self.events.publish(JobEvent::Updated { job: job.clone() });

        if job.status == JobStatus::Downloading {
            self.supervisor.start(&job, true).await;
        }
        Ok(job)
    }

    /// Soft-delete a job: the record stays in the store with status
    /// `deleted`; hard removal belongs to the history projector.
    pub async fn remove(&self, id: Uuid) -> Result<Job> {
        let was_running = self.supervisor.is_running(id);
        let job = self.set_status(id, JobStatus::Deleted).await?;
        if was_running {
            self.supervisor.stop(id).await;
        }
        self.events.publish(JobEvent::Removed { job: job.clone() });
        self.promote_next().await?;
        Ok(job)
    }

    /// Filtered, paginated listing in store order.
    pub async fn list(&self, params: ListParams) -> Result<JobPage> {
        let jobs = self.store.get_all().await?;
        let filtered: Vec<Job> = jobs
            .into_iter()
            .filter(|j| match &params.statuses {
                Some(statuses) => statuses.contains(&j.status),
                None => j.status != JobStatus::Deleted,
            })
            .collect();

        Ok(paginate(filtered, params.page, params.page_size))
    }

    pub async fn get(&self, id: Uuid) -> Result<Job> {
        self.store
            .get_all()
            .await?
            .into_iter()
            .find(|j| j.id == id)
            .ok_or_else(|| Error::not_found("job", id.to_string()))
    }

    /// React to one supervisor event. Public for the dispatch loop and for
    /// deterministic tests.
    pub async fn handle_supervisor_event(&self, event: SupervisorEvent) {
        let result = match event {
            SupervisorEvent::Progress { id, progress } => {
                self.apply_progress(id, progress.percent).await
            }
            SupervisorEvent::FileName { id, name } => self.apply_filename(id, name).await,
            SupervisorEvent::Output { id, tag, rest } => {
                trace!(%id, tag, rest, "downloader output");
                Ok(())
            }
            SupervisorEvent::Done { id, ok, error } => self.apply_done(id, ok, error).await,
        };

        if let Err(e) = result {
            warn!(error = %e, "failed to apply supervisor event");
        }
    }

    async fn apply_progress(&self, id: Uuid, percent: f64) -> Result<()> {
        let updated = self
            .store
            .mutate(|jobs| {
                let job = jobs
                    .iter_mut()
                    .find(|j| j.id == id && j.status == JobStatus::Downloading)?;
                job.progress = percent.clamp(0.0, 100.0);
                job.touch();
                Some(job.clone())
            })
            .await?;

        if let Some(job) = updated {
            self.events.publish(JobEvent::Updated { job });
        }
        Ok(())
    }

    async fn apply_filename(&self, id: Uuid, name: String) -> Result<()> {
        let updated = self
            .store
            .mutate(|jobs| {
                let job = jobs.iter_mut().find(|j| j.id == id)?;
                if job.payload.output_name.as_deref() == Some(name.as_str()) {
                    return None;
                }
                job.payload.output_name = Some(name);
                job.touch();
                Some(job.clone())
            })
            .await?;

        if let Some(job) = updated {
            self.events.publish(JobEvent::Updated { job });
        }
        Ok(())
    }

    async fn apply_done(&self, id: Uuid, ok: bool, error: Option<String>) -> Result<()> {
        let updated = self
            .store
            .mutate(|jobs| {
                let job = jobs.iter_mut().find(|j| j.id == id)?;
                // A job the user already paused or canceled keeps that
                // status even if its process exited non-zero during
                // teardown; only a still-downloading job takes the exit
                // outcome.
                if job.status != JobStatus::Downloading {
                    return None;
                }
                if ok {
                    job.progress = 100.0;
                    job.set_status(JobStatus::Completed);
                } else {
                    job.error = error;
                    job.set_status(JobStatus::Failed);
                }
                Some(job.clone())
            })
            .await?;

        let Some(job) = updated else {
            debug!(%id, "ignoring process exit for non-downloading job");
            return Ok(());
        };

        info!(id = %job.id, status = %job.status, "job finished");
        self.events.publish(JobEvent::Updated { job });
        self.promote_next().await
    }

    /// Promote one queued job if a slot freed up and start its process.
    async fn promote_next(&self) -> Result<()> {
        let max = self.settings.max_concurrent;
        let promoted = self
            .store
            .mutate(|jobs| {
                let id = queue::enqueue_next_if_possible(jobs, max)?;
                jobs.iter().find(|j| j.id == id).cloned()
            })
            .await?;

        if let Some(job) = promoted {
            info!(id = %job.id, "promoted queued job");
            self.events.publish(JobEvent::Updated { job: job.clone() });
            self.supervisor.start(&job, false).await;
        }
        Ok(())
    }

    async fn set_status(&self, id: Uuid, status: JobStatus) -> Result<Job> {
        self.store
            .mutate(|jobs| {
                let job = jobs.iter_mut().find(|j| j.id == id)?;
                job.set_status(status);
                Some(job.clone())
            })
            .await?
            .ok_or_else(|| Error::not_found("job", id.to_string()))
    }
}

fn paginate(items: Vec<Job>, page: u32, page_size: u32) -> JobPage {
    let page = page.max(1);
    if page_size == 0 {
        return JobPage {
            items,
            next_page: None,
        };
    }

    let start = ((page - 1) as usize).saturating_mul(page_size as usize);
    let has_more = items.len() > start + page_size as usize;
    let items: Vec<Job> = items
        .into_iter()
        .skip(start)
        .take(page_size as usize)
        .collect();

    JobPage {
        items,
        next_page: has_more.then(|| page + 1),
    }
}
