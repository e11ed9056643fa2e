//! Periodic billing jobs
//!
//! - processing sweep over `PENDING` events (fixed interval)
//! - daily reconciliation over the trailing window (cron)
//! - daily raw event retention (cron)
//!
//! Job bodies live on [`SchedulerJobs`] as plain async functions so they can
//! be run and tested without a running scheduler.

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use billsync_billing::{EventProcessor, ReconciliationEngine};

use crate::config::SchedulerConfig;
use crate::housekeeping;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler error: {0}")]
    Job(#[from] JobSchedulerError),
}

/// The work each scheduled job performs
#[derive(Clone)]
pub struct SchedulerJobs {
    processor: EventProcessor,
    reconciliation: ReconciliationEngine,
    config: SchedulerConfig,
}

impl SchedulerJobs {
    pub fn new(processor: EventProcessor, config: SchedulerConfig) -> Self {
        Self {
            reconciliation: ReconciliationEngine::new(processor.clone()),
            processor,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub async fn run_sweep(&self) {
        if let Err(e) = self
            .processor
            .sweep_pending(self.config.sweep_batch_size)
            .await
        {
            error!(error = %e, "Processing sweep failed");
        }
    }

    pub async fn run_reconciliation(&self) {
        info!(
            window_days = self.config.reconciliation_window_days,
            "Running scheduled reconciliation"
        );
        if let Err(e) = self
            .reconciliation
            .run_scheduled(self.config.reconciliation_window_days)
            .await
        {
            error!(error = %e, "Scheduled reconciliation failed");
        }
    }

    pub async fn run_housekeeping(&self) {
        info!("Running raw event housekeeping");
        let stores = self.processor.stores();
        if let Err(e) = housekeeping::compact_processed_events(
            stores.events.as_ref(),
            self.processor.audit_logger(),
            self.config.raw_event_retention_days,
        )
        .await
        {
            error!(error = %e, "Raw event housekeeping failed");
        }
    }
}

/// Owns the cron scheduler while it runs
pub struct Scheduler {
    jobs: Arc<SchedulerJobs>,
    running: Option<JobScheduler>,
    job_ids: Vec<Uuid>,
}

impl Scheduler {
    pub fn new(jobs: SchedulerJobs) -> Self {
        Self {
            jobs: Arc::new(jobs),
            running: None,
            job_ids: Vec::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Register the three jobs and start ticking
    pub async fn start(&mut self) -> Result<(), SchedulerError> {
        if self.running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let scheduler = JobScheduler::new().await?;
        let config = self.jobs.config().clone();
        let mut job_ids = Vec::with_capacity(3);

        let sweep_jobs = self.jobs.clone();
        job_ids.push(
            scheduler
                .add(Job::new_repeated_async(
                    config.sweep_interval,
                    move |_uuid, _l| {
                        let jobs = sweep_jobs.clone();
                        Box::pin(async move {
                            jobs.run_sweep().await;
                        })
                    },
                )?)
                .await?,
        );
        info!(
            interval_secs = config.sweep_interval.as_secs(),
            "Scheduled: processing sweep"
        );

        let reconciliation_jobs = self.jobs.clone();
        job_ids.push(
            scheduler
                .add(Job::new_async(
                    config.reconciliation_cron.as_str(),
                    move |_uuid, _l| {
                        let jobs = reconciliation_jobs.clone();
                        Box::pin(async move {
                            jobs.run_reconciliation().await;
                        })
                    },
                )?)
                .await?,
        );
        info!(cron = %config.reconciliation_cron, "Scheduled: reconciliation");

        let housekeeping_jobs = self.jobs.clone();
        job_ids.push(
            scheduler
                .add(Job::new_async(
                    config.housekeeping_cron.as_str(),
                    move |_uuid, _l| {
                        let jobs = housekeeping_jobs.clone();
                        Box::pin(async move {
                            jobs.run_housekeeping().await;
                        })
                    },
                )?)
                .await?,
        );
        info!(cron = %config.housekeeping_cron, "Scheduled: raw event housekeeping");

        scheduler.start().await?;
        info!(jobs = job_ids.len(), "Billing scheduler started");

        self.running = Some(scheduler);
        self.job_ids = job_ids;
        Ok(())
    }

    /// Remove all jobs and shut the scheduler down. No-op when not running.
    pub async fn stop(&mut self) -> Result<(), SchedulerError> {
        let Some(mut scheduler) = self.running.take() else {
            return Ok(());
        };

        for id in self.job_ids.drain(..) {
            scheduler.remove(&id).await?;
        }
        scheduler.shutdown().await?;
        info!("Billing scheduler stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use billsync_billing::{MemoryStore, ProcessorConfig, Stores};
    use billsync_shared::{IdentitySource, NewRawEvent, ProcessingStatus};
    use time::OffsetDateTime;

    fn jobs(store: Arc<MemoryStore>, config: SchedulerConfig) -> SchedulerJobs {
        let processor = EventProcessor::new(Stores::memory(store), ProcessorConfig::default());
        SchedulerJobs::new(processor, config)
    }

    #[tokio::test]
    async fn test_sweep_processes_pending_events() {
        let store = Arc::new(MemoryStore::new());
        store.insert_event(
            NewRawEvent {
                provider_event_id: "evt-1".into(),
                event_type: "some_unrelated_notice".into(),
                payload: serde_json::json!({"event_id": "evt-1", "event": "some_unrelated_notice"}),
                headers: serde_json::json!({}),
                signature: None,
                identity_source: IdentitySource::EventId,
                transaction_ref: Some("evt-1".into()),
                received_at: OffsetDateTime::now_utc(),
            }
            .into_pending(),
        );

        jobs(store.clone(), SchedulerConfig::default())
            .run_sweep()
            .await;

        let event = store.events().pop().unwrap();
        assert_eq!(event.processing_status, ProcessingStatus::Processed);
    }

    #[tokio::test]
    async fn test_reconciliation_job_writes_audit() {
        let store = Arc::new(MemoryStore::new());
        jobs(store.clone(), SchedulerConfig::default())
            .run_reconciliation()
            .await;
        assert_eq!(store.audit_actions("RECONCILIATION_COMPLETED").len(), 1);
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let mut scheduler = Scheduler::new(jobs(store, SchedulerConfig::default()));

        scheduler.start().await.unwrap();
        assert!(scheduler.is_running());
        assert!(matches!(
            scheduler.start().await,
            Err(SchedulerError::AlreadyRunning)
        ));

        scheduler.stop().await.unwrap();
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_invalid_cron_fails_start() {
        let store = Arc::new(MemoryStore::new());
        let config = SchedulerConfig {
            reconciliation_cron: "every day please".into(),
            ..SchedulerConfig::default()
        };
        let mut scheduler = Scheduler::new(jobs(store, config));

        assert!(matches!(scheduler.start().await, Err(SchedulerError::Job(_))));
        assert!(!scheduler.is_running());
    }
}
