#![forbid(unsafe_code)]

//! Background format listings ("probe jobs").
//!
//! Some listings take long enough that a browser would rather poll than hold a
//! request open, and some need an uploaded cookie file. A job is created
//! synchronously, runs on a tokio task, and is kept in memory until the
//! janitor expires it. A job's cookie file lives exactly as long as the job.
//! At most `max_running` listings run at once; the rest stay `pending`.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    extractor::Extractor, formats::MediaInfo, lister, video_url::VideoUrl, workspace::CookieJar,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
        }
    }
}

/// What `GET /api/job/{id}` returns.
#[derive(Clone, Debug, Serialize)]
pub struct JobSnapshot {
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub result: Option<MediaInfo>,
    pub error: Option<String>,
}

struct ProbeJob {
    status: JobStatus,
    created: Instant,
    created_at: DateTime<Utc>,
    result: Option<MediaInfo>,
    error: Option<String>,
    cookies: Option<Arc<CookieJar>>,
}

pub const DEFAULT_MAX_RUNNING: usize = 4;

#[derive(Clone)]
pub struct JobStore {
    inner: Arc<Mutex<HashMap<String, ProbeJob>>>,
    permits: Arc<Semaphore>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RUNNING)
    }
}

impl JobStore {
    /// `max_running` bounds how many extractor processes jobs may start at
    /// once. Zero is treated as one.
    pub fn new(max_running: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(max_running.max(1))),
        }
    }

    /// Registers a job and starts listing `url` in the background. Must be
    /// called from within a tokio runtime.
    pub fn submit(
        &self,
        extractor: Arc<dyn Extractor>,
        url: VideoUrl,
        cookies: Option<CookieJar>,
    ) -> String {
        let job_id = Uuid::new_v4().to_string();
        let cookies = cookies.map(Arc::new);
        self.inner.lock().insert(
            job_id.clone(),
            ProbeJob {
                status: JobStatus::Pending,
                created: Instant::now(),
                created_at: Utc::now(),
                result: None,
                error: None,
                cookies: cookies.clone(),
            },
        );

        let store = self.clone();
        let job_id_clone = job_id.clone();
        tokio::spawn(async move {
            let Ok(_permit) = store.permits.clone().acquire_owned().await else {
                store.update(&job_id_clone, |job| {
                    job.status = JobStatus::Error;
                    job.error = Some("job queue closed".to_string());
                });
                return;
            };
            store.update(&job_id_clone, |job| job.status = JobStatus::Running);
            let cookie_path = cookies.as_deref().map(CookieJar::path);
            match lister::list_formats_for(extractor.as_ref(), &url, cookie_path).await {
                Ok(info) => store.update(&job_id_clone, |job| {
                    job.status = JobStatus::Done;
                    job.result = Some(info);
                }),
                Err(err) => {
                    warn!(job_id = %job_id_clone, %url, "probe job failed: {err}");
                    store.update(&job_id_clone, |job| {
                        job.status = JobStatus::Error;
                        job.error = Some(err.to_string());
                    });
                }
            }
        });

        job_id
    }

    pub fn status(&self, job_id: &str) -> Option<JobSnapshot> {
        let jobs = self.inner.lock();
        let job = jobs.get(job_id)?;
        Some(JobSnapshot {
            status: job.status,
            created_at: job.created_at,
            result: job.result.clone(),
            error: job.error.clone(),
        })
    }

    /// Cookie file uploaded with the job, if any. The returned handle keeps
    /// the file alive even if the job expires mid-download.
    pub fn cookies(&self, job_id: &str) -> Option<Arc<CookieJar>> {
        self.inner.lock().get(job_id)?.cookies.clone()
    }

    /// Drops jobs older than `ttl`. Returns how many were removed. Cookie
    /// files are deleted after the table lock is released; blocking, so run
    /// it off the async workers.
    pub fn expire(&self, ttl: Duration) -> usize {
        let (expired, remaining) = {
            let mut jobs = self.inner.lock();
            let stale: Vec<String> = jobs
                .iter()
                .filter(|(_, job)| job.created.elapsed() >= ttl)
                .map(|(id, _)| id.clone())
                .collect();
            let expired: Vec<ProbeJob> = stale.iter().filter_map(|id| jobs.remove(id)).collect();
            (expired, jobs.len())
        };
        let removed = expired.len();
        drop(expired);
        if removed > 0 {
            debug!(removed, remaining, "expired probe jobs");
        }
        removed
    }

    /// Number of listings that may start right now.
    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, job_id: &str, apply: impl FnOnce(&mut ProbeJob)) {
        if let Some(job) = self.inner.lock().get_mut(job_id) {
            apply(job);
        }
    }
}
