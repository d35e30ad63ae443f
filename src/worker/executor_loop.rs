use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::reconcile::{record_failure, record_success, ReconcileConfig};
use crate::chain::KeySource;
use crate::error::StoreError;
use crate::execution::TransferExecutor;
use crate::fees::FeeEstimator;
use crate::jobs::claim::{claim, ClaimOutcome};
use crate::jobs::models::{JobStatus, ScheduledJob};
use crate::jobs::store::JobStore;

#[derive(Debug, Clone)]
pub struct ExecutorLoopConfig {
    pub claimant_id: String,
    pub poll_interval: Duration,
    /// Jobs due up to this far in the future are claimed early
    pub due_tolerance: chrono::Duration,
    /// Upper bound on candidates fetched and executed per cycle
    pub batch_size: usize,
    /// Processing claims older than this are reported
    pub stale_claim_after: chrono::Duration,
    pub reconcile: ReconcileConfig,
}

impl Default for ExecutorLoopConfig {
    fn default() -> Self {
        Self {
            claimant_id: Self::claimant_id("executor", 0),
            poll_interval: Duration::from_secs(60),
            due_tolerance: chrono::Duration::minutes(5),
            batch_size: 10,
            stale_claim_after: chrono::Duration::minutes(30),
            reconcile: ReconcileConfig::default(),
        }
    }
}

impl ExecutorLoopConfig {
    /// `<prefix>-<index>-<uuid8>`, unique per process start
    pub fn claimant_id(prefix: &str, index: usize) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", prefix, index, &suffix[..8])
    }
}

/// What happened to one candidate in a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Claim was not won; nothing else happened
    Skipped(ClaimOutcome),
    /// Store error while claiming; the job is untouched
    ClaimError { error: String },
    Executed { tx_hash: String, status: JobStatus },
    Failed { error: String },
    /// Transfer confirmed but the job record could not be updated
    ReconciliationFailed { tx_hash: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates: usize,
    pub skipped: usize,
    pub executed: usize,
    pub failed: usize,
    pub reconciliation_failures: usize,
    pub stale_claims: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Skipped(_) | JobOutcome::ClaimError { .. } => self.skipped += 1,
            JobOutcome::Executed { .. } => self.executed += 1,
            JobOutcome::Failed { .. } => self.failed += 1,
            JobOutcome::ReconciliationFailed { .. } => self.reconciliation_failures += 1,
        }
    }
}

/// Polling executor. Any number of instances may share one store; the claim
/// protocol keeps them from running the same job twice.
pub struct ExecutorLoop {
    config: ExecutorLoopConfig,
    store: Arc<dyn JobStore>,
    estimator: Arc<FeeEstimator>,
    executor: Arc<TransferExecutor>,
    keys: Arc<dyn KeySource>,
}

impl ExecutorLoop {
    pub fn new(
        config: ExecutorLoopConfig,
        store: Arc<dyn JobStore>,
        estimator: Arc<FeeEstimator>,
        executor: Arc<TransferExecutor>,
        keys: Arc<dyn KeySource>,
    ) -> Self {
        Self {
            config,
            store,
            estimator,
            executor,
            keys,
        }
    }

    pub fn claimant_id(&self) -> &str {
        &self.config.claimant_id
    }

    /// Start the loop in the background; it exits once `shutdown` turns true
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "🚀 Executor {} started (poll every {:?})",
            self.config.claimant_id, self.config.poll_interval
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle(Utc::now()).await {
                        Ok(report) if report.candidates > 0 => info!(
                            "Cycle done: {} candidates, {} executed, {} failed, {} skipped",
                            report.candidates, report.executed, report.failed, report.skipped
                        ),
                        Ok(_) => debug!("No due jobs"),
                        Err(e) => error!("❌ Executor cycle aborted: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Executor {} stopped", self.config.claimant_id);
    }

    /// One poll: fetch due jobs, claim them, execute the ones won
    #[instrument(skip(self), fields(claimant = %self.config.claimant_id))]
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        let mut report = CycleReport {
            stale_claims: self.report_stale_claims(now).await,
            ..Default::default()
        };

        let candidates = self
            .store
            .find_due(now, self.config.due_tolerance, self.config.batch_size)
            .await?;
        report.candidates = candidates.len();

        let outcomes = join_all(
            candidates
                .into_iter()
                .map(|job| self.claim_and_process(job.schedule_id, now)),
        )
        .await;

        for outcome in &outcomes {
            report.record(outcome);
        }
        Ok(report)
    }

    async fn claim_and_process(&self, schedule_id: String, now: DateTime<Utc>) -> JobOutcome {
        let outcome = match claim(
            self.store.as_ref(),
            &schedule_id,
            &self.config.claimant_id,
            now,
            self.config.due_tolerance,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Claim of {} failed: {}", schedule_id, e);
                return JobOutcome::ClaimError {
                    error: e.to_string(),
                };
            }
        };

        match outcome {
            ClaimOutcome::Claimed(job) => self.process_claimed(job).await,
            other => {
                debug!("Skipping {}: {:?}", schedule_id, other);
                JobOutcome::Skipped(other)
            }
        }
    }

    /// Execute a job this instance owns and write back the result
    async fn process_claimed(&self, job: ScheduledJob) -> JobOutcome {
        let execution_index = job.execution_count;
        info!(
            "Executing {} #{} : {} {} -> {} (tag {})",
            job.schedule_id,
            execution_index,
            job.amount,
            job.asset.symbol,
            job.recipient_address,
            job.idempotency_tag_hex(execution_index)
        );

        let quote = self
            .estimator
            .estimate(&job.asset, &job.owner_address, &job.recipient_address, job.amount)
            .await;

        let result = match self.keys.signer_for(&job.owner_address).await {
            Ok(signer) => {
                self.executor
                    .execute(
                        &job.asset,
                        &job.owner_address,
                        &job.recipient_address,
                        job.amount,
                        signer.as_ref(),
                        &quote,
                        Some(job.idempotency_tag(execution_index)),
                    )
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(receipt) => {
                match record_success(self.store.as_ref(), &job, &receipt, &self.config.reconcile).await {
                    Ok(outcome) => JobOutcome::Executed {
                        tx_hash: receipt.tx_hash,
                        status: outcome.status,
                    },
                    Err(_) => JobOutcome::ReconciliationFailed {
                        tx_hash: receipt.tx_hash,
                    },
                }
            }
            Err(e) => {
                let message = e.to_string();
                if let Err(store_err) =
                    record_failure(self.store.as_ref(), &job.schedule_id, &message, Utc::now()).await
                {
                    error!(
                        "Could not mark {} failed ({}): {}",
                        job.schedule_id, message, store_err
                    );
                }
                JobOutcome::Failed { error: message }
            }
        }
    }

    async fn report_stale_claims(&self, now: DateTime<Utc>) -> usize {
        match self
            .store
            .find_stale_processing(now - self.config.stale_claim_after)
            .await
        {
            Ok(stale) => {
                for job in &stale {
                    warn!(
                        "⚠️  Job {} stuck in processing since {:?} (claimed by {:?}); manual resolution required",
                        job.schedule_id, job.processing_started, job.processing_by
                    );
                }
                stale.len()
            }
            Err(e) => {
                warn!("Stale claim check failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::TransferConfig;
    use crate::fees::FeeConfig;
    use crate::jobs::memory::MemoryJobStore;
    use crate::jobs::models::{Frequency, JobPatch};
    use crate::testing::{job_service, sample_job, MockKeySource, MockLedger, StaticOracle};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct Harness {
        store: Arc<MemoryJobStore>,
        ledger: Arc<MockLedger>,
        executor_loop: ExecutorLoop,
    }

    fn harness(claimant: &str, store: Arc<MemoryJobStore>, ledger: Arc<MockLedger>) -> Harness {
        let oracle = Arc::new(StaticOracle::new(Some(dec!(2000))));
        let executor = Arc::new(TransferExecutor::new(TransferConfig::default(), ledger.clone(), oracle));
        harness_sharing(claimant, store, ledger, executor)
    }

    /// Loop over a transfer executor shared with other loops, as in one process
    fn harness_sharing(
        claimant: &str,
        store: Arc<MemoryJobStore>,
        ledger: Arc<MockLedger>,
        executor: Arc<TransferExecutor>,
    ) -> Harness {
        let oracle = Arc::new(StaticOracle::new(Some(dec!(2000))));
        let config = ExecutorLoopConfig {
            claimant_id: claimant.to_string(),
            reconcile: ReconcileConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                ..Default::default()
            },
            ..Default::default()
        };
        let executor_loop = ExecutorLoop::new(
            config,
            store.clone(),
            Arc::new(FeeEstimator::new(FeeConfig::default(), ledger.clone(), oracle)),
            executor,
            Arc::new(MockKeySource::new()),
        );
        Harness {
            store,
            ledger,
            executor_loop,
        }
    }

    fn fresh() -> Harness {
        harness(
            "executor-0-test",
            Arc::new(MemoryJobStore::new()),
            Arc::new(MockLedger::new()),
        )
    }

    fn job_with(id: &str, frequency: Frequency, max_executions: u32) -> ScheduledJob {
        let mut job = sample_job(id);
        job.frequency = frequency;
        job.max_executions = max_executions;
        job
    }

    #[tokio::test]
    async fn test_once_job_completes_after_one_execution() {
        let h = fresh();
        let job = job_with("sched_once", Frequency::Once, 1);
        let t0 = job.scheduled_for;
        h.store.insert(&job).await.unwrap();

        let report = h.executor_loop.run_cycle(t0).await.unwrap();
        assert_eq!(report.executed, 1);

        let stored = h.store.get("sched_once").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.execution_count, 1);
        assert!(stored.next_execution.is_none());
        assert!(stored.check_invariants().is_ok());

        let report = h.executor_loop.run_cycle(t0 + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(h.ledger.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_daily_job_progression() {
        let h = fresh();
        let job = job_with("sched_daily", Frequency::Daily, 3);
        let t0 = job.scheduled_for;
        h.store.insert(&job).await.unwrap();

        for day in 0..3 {
            let now = t0 + chrono::Duration::days(day);
            let report = h.executor_loop.run_cycle(now).await.unwrap();
            assert_eq!(report.executed, 1, "day {}", day);

            let stored = h.store.get("sched_daily").await.unwrap().unwrap();
            assert_eq!(stored.execution_count, (day + 1) as u32);
            if day < 2 {
                assert_eq!(stored.status, JobStatus::Active);
                assert_eq!(stored.next_execution, Some(t0 + chrono::Duration::days(day + 1)));
            } else {
                assert_eq!(stored.status, JobStatus::Completed);
                assert!(stored.next_execution.is_none());
            }
        }
    }

    #[tokio::test]
    async fn test_not_yet_due_job_is_left_alone() {
        let h = fresh();
        let job = sample_job("sched_later");
        let t0 = job.scheduled_for;
        h.store.insert(&job).await.unwrap();

        let report = h.executor_loop.run_cycle(t0 - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert_eq!(h.ledger.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_jobs_are_never_selected() {
        let h = fresh();
        let job = sample_job("sched_failed");
        let t0 = job.scheduled_for;
        h.store.insert(&job).await.unwrap();
        h.store
            .force_update("sched_failed", &JobPatch::failed("insufficient funds", t0))
            .await
            .unwrap();

        for days in [0, 7, 30, 365] {
            let report = h
                .executor_loop
                .run_cycle(t0 + chrono::Duration::days(days))
                .await
                .unwrap();
            assert_eq!(report.candidates, 0);
        }
        assert_eq!(h.ledger.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_weekly_job_fails_permanently_on_broadcast_error() {
        let h = fresh();
        let job = sample_job("sched_weekly");
        let t0 = job.scheduled_for;
        h.store.insert(&job).await.unwrap();

        h.executor_loop.run_cycle(t0).await.unwrap();
        let stored = h.store.get("sched_weekly").await.unwrap().unwrap();
        assert_eq!(stored.execution_count, 1);
        assert_eq!(stored.next_execution, Some(t0 + chrono::Duration::days(7)));

        h.ledger.fail_broadcasts("replacement transaction underpriced");
        let report = h
            .executor_loop
            .run_cycle(t0 + chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let stored = h.store.get("sched_weekly").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.execution_count, 1);
        assert!(stored.next_execution.is_none());
        assert!(stored.last_error.as_deref().unwrap_or_default().contains("underpriced"));
        assert!(stored.failed_at.is_some());

        h.ledger.clear_broadcast_failure();
        let report = h
            .executor_loop
            .run_cycle(t0 + chrono::Duration::days(14))
            .await
            .unwrap();
        assert_eq!(report.candidates, 0);
        assert_eq!(h.ledger.broadcast_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_signer_fails_job() {
        let store = Arc::new(MemoryJobStore::new());
        let mut h = harness("executor-0-test", store, Arc::new(MockLedger::new()));
        h.executor_loop.keys = Arc::new(MockKeySource::without_keys());

        let job = sample_job("sched_nokey");
        h.store.insert(&job).await.unwrap();
        h.executor_loop.run_cycle(job.scheduled_for).await.unwrap();

        let stored = h.store.get("sched_nokey").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(h.ledger.broadcast_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_claim_wins() {
        let h = fresh();
        let service = job_service(h.store.clone());
        let job = sample_job("sched_cancel");
        let t0 = job.scheduled_for;
        h.store.insert(&job).await.unwrap();

        service.cancel_job("sched_cancel").await.unwrap();
        let report = h.executor_loop.run_cycle(t0).await.unwrap();
        assert_eq!(report.candidates, 0);

        // Claim racing against a cancel that already landed
        let outcome = claim(h.store.as_ref(), "sched_cancel", "late", t0, chrono::Duration::zero())
            .await
            .unwrap();
        assert_eq!(outcome, ClaimOutcome::AlreadyClaimed);

        let stored = h.store.get("sched_cancel").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert!(stored.cancelled_at.is_some());
        assert_eq!(h.ledger.broadcast_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_competing_executors_run_each_job_once() {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MockLedger::new());
        let oracle = Arc::new(StaticOracle::new(Some(dec!(2000))));
        let executor = Arc::new(TransferExecutor::new(TransferConfig::default(), ledger.clone(), oracle));
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        for i in 0..6 {
            store.insert(&sample_job(&format!("sched_{}", i))).await.unwrap();
        }

        let loops: Vec<_> = (0..3)
            .map(|i| {
                let h = harness_sharing(&format!("executor-{}", i), store.clone(), ledger.clone(), executor.clone());
                Arc::new(h.executor_loop)
            })
            .collect();
        let handles: Vec<_> = loops
            .iter()
            .cloned()
            .map(|l| tokio::spawn(async move { l.run_cycle(t0).await.unwrap() }))
            .collect();

        let mut executed = 0;
        let mut failed = 0;
        for handle in handles {
            let report = handle.await.unwrap();
            executed += report.executed;
            failed += report.failed;
        }
        assert_eq!(executed, 6);
        assert_eq!(failed, 0);
        assert_eq!(ledger.broadcast_count(), 6);
    }

    #[tokio::test]
    async fn test_same_owner_jobs_due_together_all_execute() {
        let h = fresh();
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        for id in ["sched_a", "sched_b", "sched_c"] {
            h.store.insert(&sample_job(id)).await.unwrap();
        }

        let report = h.executor_loop.run_cycle(t0).await.unwrap();
        assert_eq!(report.executed, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(h.ledger.broadcast_count(), 3);

        for id in ["sched_a", "sched_b", "sched_c"] {
            let stored = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(stored.status, JobStatus::Active);
            assert_eq!(stored.execution_count, 1);
            assert!(stored.last_error.is_none());
        }
    }

    #[tokio::test]
    async fn test_stale_claims_are_reported_not_reclaimed() {
        let h = fresh();
        let job = sample_job("sched_stale");
        let t0 = job.scheduled_for;
        h.store.insert(&job).await.unwrap();
        h.store
            .force_update("sched_stale", &JobPatch::claim("crashed-executor", t0))
            .await
            .unwrap();

        let report = h
            .executor_loop
            .run_cycle(t0 + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.stale_claims, 1);
        assert_eq!(report.candidates, 0);

        let stored = h.store.get("sched_stale").await.unwrap().unwrap();
        assert_eq!(stored.processing_by.as_deref(), Some("crashed-executor"));
    }

    #[tokio::test]
    async fn test_spawned_loop_stops_on_shutdown() {
        let h = fresh();
        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(h.executor_loop).spawn(rx);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_claimant_id_format() {
        let id = ExecutorLoopConfig::claimant_id("executor", 2);
        assert!(id.starts_with("executor-2-"));
        assert_eq!(id.len(), "executor-2-".len() + 8);
    }
}
