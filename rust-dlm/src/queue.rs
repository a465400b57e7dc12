//! Queue controller: pure admission and promotion decisions.
//!
//! These functions only look at the collection and the concurrency limit;
//! starting processes and persisting the outcome is the orchestrator's job.

use uuid::Uuid;

use crate::job::{Job, JobStatus};

/// Number of jobs currently holding a concurrency slot.
pub fn downloading_count(jobs: &[Job]) -> usize {
    jobs.iter()
        .filter(|j| j.status == JobStatus::Downloading)
        .count()
}

/// Status a newly admitted job should start in.
pub fn decide_initial_status(jobs: &[Job], max_concurrent: usize) -> JobStatus {
    if downloading_count(jobs) < max_concurrent {
        JobStatus::Downloading
    } else {
        JobStatus::Queued
    }
}

/// Promote one queued job if a slot is free, returning its id.
///
/// The scan runs in store order. New jobs are inserted at the front of the
/// collection, so the most recently queued job is promoted before older
/// ones. This bias is intentional product behavior and pinned by tests;
/// do not "fix" it to FIFO.
pub fn enqueue_next_if_possible(jobs: &mut [Job], max_concurrent: usize) -> Option<Uuid> {
    if downloading_count(jobs) >= max_concurrent {
        return None;
    }

    let next = jobs.iter_mut().find(|j| j.status == JobStatus::Queued)?;
    next.set_status(JobStatus::Downloading);
    Some(next.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{DownloadPayload, FormatSelection, MediaKind};

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

    #[test]
    fn initial_status_respects_concurrency_limit() {
        let jobs = vec![
            job("a", JobStatus::Downloading),
            job("b", JobStatus::Downloading),
        ];
        assert_eq!(decide_initial_status(&jobs, 3), JobStatus::Downloading);
        assert_eq!(decide_initial_status(&jobs, 2), JobStatus::Queued);
    }

    #[test]
    fn no_promotion_at_capacity() {
        let mut jobs = vec![
            job("a", JobStatus::Downloading),
            job("b", JobStatus::Downloading),
            job("c", JobStatus::Queued),
        ];
        assert_eq!(enqueue_next_if_possible(&mut jobs, 2), None);
        assert_eq!(jobs[2].status, JobStatus::Queued);
    }

    #[test]
    fn promotion_takes_first_queued_in_store_order() {
        // Front-inserted collection: "newest" is at index 0.
        let mut jobs = vec![
            job("newest", JobStatus::Queued),
            job("older", JobStatus::Queued),
            job("running", JobStatus::Downloading),
        ];

        let promoted = enqueue_next_if_possible(&mut jobs, 2).unwrap();
        assert_eq!(promoted, jobs[0].id);
        assert_eq!(jobs[0].status, JobStatus::Downloading);
        // The older queued job keeps waiting: LIFO-leaning bias.
        assert_eq!(jobs[1].status, JobStatus::Queued);
    }

    #[test]
    fn promotion_skip_when_nothing_queued() {
        let mut jobs = vec![job("a", JobStatus::Completed)];
        assert_eq!(enqueue_next_if_possible(&mut jobs, 2), None);
    }

    #[test]
    fn downloading_never_exceeds_limit_across_promotions() {
        let mut jobs = vec![
            job("a", JobStatus::Queued),
            job("b", JobStatus::Queued),
            job("c", JobStatus::Queued),
        ];

        let max = 2;
        while enqueue_next_if_possible(&mut jobs, max).is_some() {}
        assert_eq!(downloading_count(&jobs), max);
    }
}
