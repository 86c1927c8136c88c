//! Runs the work plan: one spawned task per job, at most `P` in flight.
//!
//! A job loops `fetch -> validate -> write -> checkpoint` from its resume point
//! until its cursor reaches the end of the range. The write of a batch and the
//! checkpoint that follows it are never interrupted; cancellation is observed
//! only before a fetch or while one (including its backoff) is pending.

use std::{collections::HashMap, num::NonZeroU32, num::NonZeroUsize, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use market_data_ingestor::{
    bucket::next_bucket_start,
    errors::IngestionError,
    models::request_params::{BarsRequestParams, ProviderParams},
    rate_limit::RateGovernor,
};
use storage_service::PartitionWriter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    checkpoint::CheckpointStore,
    config::OrchestratorSettings,
    job::{IngestionJob, JobState, Lifecycle},
    plan::resume_point,
    spec::ProviderId,
    summary::{JobReport, RunSummary},
    validate::{ValidationPolicy, validate_batch},
};

/// Knobs for one run.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorConfig {
    /// Jobs in flight at once.
    pub max_concurrent_jobs: NonZeroUsize,
    /// Bars requested per fetch.
    pub batch_limit: NonZeroU32,
    /// What to do with bad bars.
    pub validation: ValidationPolicy,
}

impl From<&OrchestratorSettings> for OrchestratorConfig {
    fn from(s: &OrchestratorSettings) -> Self {
        Self {
            max_concurrent_jobs: s.max_concurrent_jobs,
            batch_limit: s.batch_limit,
            validation: s.validation,
        }
    }
}

/// How a job's batch loop ended.
enum Outcome {
    Done(JobState),
    Stopped(JobState, String),
}

/// Drives ingestion jobs against shared governors, writer and checkpoint store.
#[derive(Clone)]
pub struct Orchestrator {
    governors: Arc<HashMap<ProviderId, Arc<RateGovernor>>>,
    request_params: Arc<HashMap<ProviderId, ProviderParams>>,
    writer: Arc<PartitionWriter>,
    checkpoints: CheckpointStore,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Orchestrator over one governor per configured provider.
    pub fn new(
        governors: HashMap<ProviderId, Arc<RateGovernor>>,
        writer: Arc<PartitionWriter>,
        checkpoints: CheckpointStore,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            governors: Arc::new(governors),
            request_params: Arc::default(),
            writer,
            checkpoints,
            config,
        }
    }

    /// Send `params` with every request made to `provider`.
    pub fn with_request_params(mut self, provider: ProviderId, params: ProviderParams) -> Self {
        Arc::make_mut(&mut self.request_params).insert(provider, params);
        self
    }

    /// Run every job to a terminal state.
    ///
    /// Only a failure to read the checkpoint table aborts the run; everything
    /// else is reported per job in the returned [`RunSummary`].
    pub async fn run(
        &self,
        jobs: Vec<IngestionJob>,
        cancel: CancellationToken,
    ) -> anyhow::Result<RunSummary> {
        let started = Instant::now();
        let committed = self.checkpoints.load_all().await?;

        let tasks = jobs.into_iter().map(|job| {
            let this = self.clone();
            let cancel = cancel.clone();
            let resume = committed.get(&job.key).and_then(|c| c.committed);
            async move {
                let handle = tokio::spawn({
                    let this = this.clone();
                    let job = job.clone();
                    async move { this.run_job(&job, resume, cancel).await }
                });
                match handle.await {
                    Ok(report) => report,
                    Err(join) => this.panicked(&job, resume, join.to_string()).await,
                }
            }
        });

        let mut reports: Vec<JobReport> = stream::iter(tasks)
            .buffer_unordered(self.config.max_concurrent_jobs.get())
            .collect()
            .await;
        reports.sort_by_key(|r| r.job);

        let summary = RunSummary {
            jobs: reports,
            elapsed: started.elapsed(),
        };
        summary.log();
        Ok(summary)
    }

    async fn panicked(
        &self,
        job: &IngestionJob,
        resume: Option<DateTime<Utc>>,
        message: String,
    ) -> JobReport {
        error!(target: "audit", job = job.id, key = %job.key, %message, "job task panicked");
        let mut report = JobReport::new(job, resume);
        report.state = JobState::Failed;
        report.error = Some(format!("job task panicked: {message}"));
        if let Some(committed) = self.checkpoints.load(&job.key).await.ok().flatten() {
            report.committed = committed.committed;
        }
        self.record(job, JobState::Failed, report.error.clone()).await;
        report
    }

    async fn record(&self, job: &IngestionJob, state: JobState, error: Option<String>) {
        if let Err(e) = self
            .checkpoints
            .record_state(&job.key, job.provider, state, error)
            .await
        {
            warn!(job = job.id, key = %job.key, state = %state, error = %e, "could not record job state");
        }
    }

    /// One job from its resume point to a terminal state.
    pub async fn run_job(
        &self,
        job: &IngestionJob,
        committed: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> JobReport {
        let mut life = Lifecycle::new(job);
        let mut report = JobReport::new(job, committed);

        if cancel.is_cancelled() {
            life.transition(JobState::Cancelled, committed);
            report.state = JobState::Cancelled;
            return report;
        }

        life.transition(JobState::Running, committed);
        self.record(job, JobState::Running, None).await;

        let outcome = match self.governors.get(&job.provider) {
            Some(governor) => self.batches(job, governor, &mut report, &cancel).await,
            None => Outcome::Stopped(
                JobState::Failed,
                format!("no provider configured for {}", job.provider),
            ),
        };

        let (state, error) = match outcome {
            Outcome::Done(state) => (state, None),
            Outcome::Stopped(state, message) => (state, Some(message)),
        };
        life.transition(state, report.committed);
        self.record(job, state, error.clone()).await;
        report.state = state;
        report.error = error;
        report
    }

    async fn batches(
        &self,
        job: &IngestionJob,
        governor: &RateGovernor,
        report: &mut JobReport,
        cancel: &CancellationToken,
    ) -> Outcome {
        let tf = job.key.timeframe;
        let mut cursor = resume_point(job, report.committed);

        loop {
            if cursor >= job.end {
                return Outcome::Done(JobState::Completed);
            }
            if cancel.is_cancelled() {
                return Outcome::Done(JobState::Cancelled);
            }

            let params = BarsRequestParams {
                symbol: job.key.symbol.clone(),
                timeframe: tf,
                since: cursor,
                until: Some(job.end),
                limit: self.config.batch_limit,
                asset_class: job.asset_class,
                provider_specific: self
                    .request_params
                    .get(&job.provider)
                    .cloned()
                    .unwrap_or_default(),
            };
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Outcome::Done(JobState::Cancelled),
                res = governor.fetch_bars(&params) => res,
            };

            let mut series = match fetched {
                Ok(series) => series,
                Err(e) => {
                    let state = match e {
                        IngestionError::RetryExhausted { .. } if report.batches > 0 => {
                            JobState::PartiallyCompleted
                        }
                        _ => JobState::Failed,
                    };
                    return Outcome::Stopped(state, e.to_string());
                }
            };
            if series.is_empty() {
                debug!(job = job.id, key = %job.key, %cursor, "upstream has nothing more");
                return Outcome::Done(JobState::Completed);
            }

            // providers honour `until`, this guards the ones that do not
            series.bars.retain(|b| b.timestamp < job.end);
            if series.is_empty() {
                return Outcome::Done(JobState::Completed);
            }
            let fetched_up_to = series.last_timestamp().unwrap_or(cursor).max(cursor);

            let validated = match validate_batch(job, cursor, series, self.config.validation) {
                Ok(v) => v,
                Err(e) => return Outcome::Stopped(JobState::Failed, e.to_string()),
            };
            report.rows_dropped += validated.dropped;

            if validated.series.is_empty() {
                cursor = next_bucket_start(fetched_up_to, tf);
                continue;
            }

            let written = match self.writer.write_series(&validated.series).await {
                Ok(w) => w,
                Err(e) => return Outcome::Stopped(JobState::Failed, format!("write failed: {e}")),
            };
            let Some(last) = written.last_timestamp() else {
                return Outcome::Stopped(
                    JobState::Failed,
                    "writer committed no partition for a non-empty batch".into(),
                );
            };
            let stored = match self.checkpoints.advance(&job.key, job.provider, last).await {
                Ok(ts) => ts,
                Err(e) => {
                    return Outcome::Stopped(JobState::Failed, format!("checkpoint failed: {e:#}"));
                }
            };

            report.committed = Some(stored);
            report.batches += 1;
            report.bars_written += validated.series.len();
            debug!(
                job = job.id,
                key = %job.key,
                bars = validated.series.len(),
                inserted = written.rows_inserted(),
                committed = %stored,
                "batch persisted"
            );
            cursor = next_bucket_start(fetched_up_to.max(last), tf);
        }
    }
}
