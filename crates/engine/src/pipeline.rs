//! The worker-facing pipeline: intake batches through coalescing, then
//! materialization tasks through projection.

use std::ops::AddAssign;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use meridian_core::{Clock, IntakeId, PipelineConfig, Snapshot, SystemClock, Timestamp};
use meridian_storage::{IntakeRecord, IntakeStatus, MaterializationTask, Store};

use crate::admin::AdminService;
use crate::coalesce::{CoalescingDecision, CoalescingEngine};
use crate::error::EngineError;
use crate::materialize::MaterializationEngine;
use crate::policy::PolicyRegistry;
use crate::projection::{ProjectionBuilder, ProjectionRenderer};
use crate::query::QueryService;
use crate::retry::Backoff;

/// Counters for one pass over the intake queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub dequeued: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: usize,
    pub retried: usize,
    pub parked: usize,
    /// Handed back untouched because the batch deadline passed.
    pub requeued: usize,
}

impl IntakeReport {
    fn progressed(&self) -> bool {
        self.dequeued > self.requeued
    }
}

impl AddAssign for IntakeReport {
    fn add_assign(&mut self, rhs: Self) {
        self.dequeued += rhs.dequeued;
        self.created += rhs.created;
        self.updated += rhs.updated;
        self.unchanged += rhs.unchanged;
        self.rejected += rhs.rejected;
        self.retried += rhs.retried;
        self.parked += rhs.parked;
        self.requeued += rhs.requeued;
    }
}

/// Counters for one pass over the materialization queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializationReport {
    pub dequeued: usize,
    pub built: usize,
    /// Tasks whose view was already at or past the task version.
    pub skipped: usize,
    pub released: usize,
    pub failed: usize,
}

impl MaterializationReport {
    fn progressed(&self) -> bool {
        self.dequeued > self.released
    }
}

impl AddAssign for MaterializationReport {
    fn add_assign(&mut self, rhs: Self) {
        self.dequeued += rhs.dequeued;
        self.built += rhs.built;
        self.skipped += rhs.skipped;
        self.released += rhs.released;
        self.failed += rhs.failed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds: usize,
    pub intake: IntakeReport,
    pub materialization: MaterializationReport,
}

impl AddAssign for RunSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.rounds += rhs.rounds;
        self.intake += rhs.intake;
        self.materialization += rhs.materialization;
    }
}

pub struct PipelineBuilder {
    store: Arc<dyn Store>,
    config: Arc<PipelineConfig>,
    policies: PolicyRegistry,
    projections: ProjectionBuilder,
    clock: Option<Arc<dyn Clock>>,
}

impl PipelineBuilder {
    pub fn policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    pub fn renderer(mut self, renderer: Arc<dyn ProjectionRenderer>) -> Self {
        self.projections.register(renderer);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Pipeline, EngineError> {
        self.config.validate()?;
        Ok(Pipeline {
            coalescer: CoalescingEngine::new(Arc::clone(&self.config)),
            materializer: MaterializationEngine::new(&self.config, &self.policies),
            backoff: Backoff::new(&self.config.retry),
            projections: self.projections,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock::new())),
            store: self.store,
            config: self.config,
        })
    }
}

pub struct Pipeline {
    store: Arc<dyn Store>,
    config: Arc<PipelineConfig>,
    coalescer: CoalescingEngine,
    materializer: MaterializationEngine,
    projections: ProjectionBuilder,
    backoff: Backoff,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn builder(store: Arc<dyn Store>, config: Arc<PipelineConfig>) -> PipelineBuilder {
        PipelineBuilder {
            store,
            config,
            policies: PolicyRegistry::new(),
            projections: ProjectionBuilder::new(),
            clock: None,
        }
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn coalescer(&self) -> &CoalescingEngine {
        &self.coalescer
    }

    pub fn materializer(&self) -> &MaterializationEngine {
        &self.materializer
    }

    pub fn projections(&self) -> &ProjectionBuilder {
        &self.projections
    }

    pub fn now(&self) -> Result<Timestamp, EngineError> {
        Ok(self.clock.now()?)
    }

    pub fn query(&self) -> QueryService<'_> {
        QueryService::new(self)
    }

    pub fn admin(&self) -> AdminService<'_> {
        AdminService::new(self)
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Validate and durably stage a snapshot. Malformed snapshots are
    /// refused here and never reach the queue.
    pub fn submit(&self, snapshot: &Snapshot) -> Result<IntakeId, EngineError> {
        snapshot.validate()?;
        let intake_id = self.store.enqueue(snapshot, self.now()?)?;
        debug!(
            intake_id = %intake_id,
            model_type = snapshot.model_type.as_str(),
            source_system = snapshot.source_system.as_str(),
            native_id = snapshot.native_id.as_str(),
            "snapshot accepted"
        );
        Ok(intake_id)
    }

    pub fn submit_json(&self, json: &str) -> Result<IntakeId, EngineError> {
        let snapshot = Snapshot::from_json(json)?;
        self.submit(&snapshot)
    }

    /// Hand records left in `Processing` by a previous process back to the
    /// queue. Only safe while no worker is running.
    pub fn recover_in_flight(&self) -> Result<usize, EngineError> {
        let now = self.now()?;
        let stalled = self.store.list_intake(IntakeStatus::Processing, usize::MAX)?;
        for record in &stalled {
            self.store.requeue(record.intake_id, now)?;
        }
        if !stalled.is_empty() {
            info!(count = stalled.len(), "requeued in-flight intake records");
        }
        Ok(stalled.len())
    }

    // ========================================================================
    // Intake batches
    // ========================================================================

    fn batch_deadline(&self) -> Instant {
        Instant::now() + Duration::from_millis(self.config.workers.batch_deadline_ms)
    }

    /// Claim one batch and run each record through coalescing. Records not
    /// started before `deadline` are requeued without charging an attempt.
    pub fn process_intake_batch(&self, deadline: Instant) -> Result<IntakeReport, EngineError> {
        let records = self
            .store
            .dequeue(self.config.workers.batch_size, self.now()?)?;
        let mut report = IntakeReport {
            dequeued: records.len(),
            ..IntakeReport::default()
        };

        let mut records = records.into_iter();
        while let Some(record) = records.next() {
            let step = if Instant::now() >= deadline {
                self.requeue(&record).map(|()| report.requeued += 1)
            } else {
                self.process_record(&record, &mut report)
            };
            if let Err(e) = step {
                self.give_back(std::iter::once(record).chain(records));
                return Err(e);
            }
        }
        Ok(report)
    }

    fn requeue(&self, record: &IntakeRecord) -> Result<(), EngineError> {
        self.store.requeue(record.intake_id, self.now()?)?;
        Ok(())
    }

    /// Return claimed records to `Pending` after a batch aborts.
    fn give_back(&self, records: impl Iterator<Item = IntakeRecord>) {
        for record in records {
            if let Err(e) = self.requeue(&record) {
                warn!(intake_id = %record.intake_id, error = %e, "could not requeue intake record");
            }
        }
    }

    fn process_record(&self, record: &IntakeRecord, report: &mut IntakeReport) -> Result<(), EngineError> {
        let now = self.now()?;
        let intake_id = record.intake_id;
        let outcome = self
            .coalescer
            .coalesce(self.store.as_ref(), &record.snapshot, now)
            .and_then(|decision| {
                if let Some((canonical_id, version)) = decision.materialization_target() {
                    self.store.enqueue_materialization(canonical_id, version, now)?;
                }
                Ok(decision)
            });

        match outcome {
            Ok(CoalescingDecision::Reject { evidence }) => {
                self.store.mark_rejected(intake_id, &evidence, now)?;
                report.rejected += 1;
            }
            Ok(decision) => {
                self.store.mark_processed(intake_id, now)?;
                debug!(intake_id = %intake_id, ?decision, "intake record processed");
                match decision {
                    CoalescingDecision::CreateNew { .. } => report.created += 1,
                    CoalescingDecision::UpdateExisting { .. } => report.updated += 1,
                    _ => report.unchanged += 1,
                }
            }
            Err(e) => self.record_failure(record, &e, now, report)?,
        }
        Ok(())
    }

    fn record_failure(
        &self,
        record: &IntakeRecord,
        error: &EngineError,
        now: Timestamp,
        report: &mut IntakeReport,
    ) -> Result<(), EngineError> {
        let reason = error.to_string();
        if error.is_transient() && !self.backoff.exhausted(record.attempts) {
            let retry_at = self.backoff.retry_at(now, record.attempts);
            debug!(
                intake_id = %record.intake_id,
                attempts = record.attempts,
                retry_at = %retry_at,
                error = %reason,
                "transient failure, retrying later"
            );
            self.store.mark_failed(record.intake_id, &reason, retry_at, now)?;
            report.retried += 1;
        } else {
            warn!(
                intake_id = %record.intake_id,
                attempts = record.attempts,
                error = %reason,
                "intake record parked"
            );
            self.store.mark_parked(record.intake_id, &reason, now)?;
            report.parked += 1;
        }
        Ok(())
    }

    // ========================================================================
    // Materialization batches
    // ========================================================================

    pub fn process_materialization_batch(
        &self,
        deadline: Instant,
    ) -> Result<MaterializationReport, EngineError> {
        let tasks = self
            .store
            .dequeue_materialization(self.config.workers.batch_size)?;
        let mut report = MaterializationReport {
            dequeued: tasks.len(),
            ..MaterializationReport::default()
        };

        let mut tasks = tasks.into_iter();
        while let Some(task) = tasks.next() {
            if let Err(e) = self.process_task(&task, deadline, &mut report) {
                for task in std::iter::once(task).chain(tasks) {
                    if let Err(e) = self.store.release_materialization(&task) {
                        warn!(canonical_id = %task.canonical_id, error = %e, "could not release materialization task");
                    }
                }
                return Err(e);
            }
        }
        Ok(report)
    }

    fn process_task(
        &self,
        task: &MaterializationTask,
        deadline: Instant,
        report: &mut MaterializationReport,
    ) -> Result<(), EngineError> {
        if Instant::now() >= deadline {
            self.store.release_materialization(task)?;
            report.released += 1;
            return Ok(());
        }
        match self.run_task(task) {
            Ok(true) => report.built += 1,
            Ok(false) => report.skipped += 1,
            Err(e) if e.is_transient() => {
                debug!(canonical_id = %task.canonical_id, error = %e, "materialization released");
                self.store.release_materialization(task)?;
                report.released += 1;
                return Ok(());
            }
            Err(e) => {
                warn!(
                    canonical_id = %task.canonical_id,
                    version = task.version,
                    error = %e,
                    "materialization task dropped"
                );
                report.failed += 1;
            }
        }
        self.store.complete_materialization(task)?;
        Ok(())
    }

    /// Returns false when the stored view already covers the task.
    fn run_task(&self, task: &MaterializationTask) -> Result<bool, EngineError> {
        let root = self
            .store
            .resolve(task.canonical_id)?
            .ok_or_else(|| EngineError::CanonicalNotFound(task.canonical_id.to_string()))?;
        if root == task.canonical_id
            && let Some(view) = self.store.get_materialized(root)?
            && view.version >= task.version
        {
            return Ok(false);
        }
        self.projections
            .rebuild(self.store.as_ref(), &self.materializer, root, None, self.now()?)?;
        Ok(true)
    }

    // ========================================================================
    // Drivers
    // ========================================================================

    /// One intake batch followed by one materialization batch.
    pub fn run_once(&self) -> Result<RunSummary, EngineError> {
        let intake = self.process_intake_batch(self.batch_deadline())?;
        let materialization = self.process_materialization_batch(self.batch_deadline())?;
        Ok(RunSummary {
            rounds: 1,
            intake,
            materialization,
        })
    }

    /// Alternate batches until a round makes no progress.
    pub fn run_until_idle(&self) -> Result<RunSummary, EngineError> {
        let mut summary = RunSummary::default();
        loop {
            let round = self.run_once()?;
            let progressed = round.intake.progressed() || round.materialization.progressed();
            summary += round;
            if !progressed {
                return Ok(summary);
            }
        }
    }

    /// Drain both queues with `workers.count` threads sharing this pipeline.
    pub fn run_workers(&self) -> Result<RunSummary, EngineError> {
        let workers = self.config.workers.count.max(1);
        let results: Vec<Result<RunSummary, EngineError>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    scope.spawn(move || {
                        let summary = self.run_until_idle();
                        debug!(worker, ?summary, "worker idle");
                        summary
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let mut total = RunSummary::default();
        for result in results {
            total += result?;
        }
        info!(
            workers,
            created = total.intake.created,
            updated = total.intake.updated,
            rejected = total.intake.rejected,
            parked = total.intake.parked,
            built = total.materialization.built,
            "workers drained queues"
        );
        Ok(total)
    }

    /// Drop completed intake records older than the retention window.
    pub fn purge_expired(&self) -> Result<usize, EngineError> {
        let cutoff = self
            .now()?
            .saturating_sub_ms(self.config.retention.snapshot_retention_ms);
        let purged = self.store.purge_completed_before(cutoff)?;
        if purged > 0 {
            info!(purged, cutoff = %cutoff, "purged completed intake records");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_core::{ManualClock, ModelPolicies};
    use meridian_storage::MemoryStore;

    fn pipeline(clock: Arc<ManualClock>) -> Pipeline {
        let config = PipelineConfig::builder()
            .register_model("Device", ["Serial"], ModelPolicies::new())
            .build()
            .unwrap();
        Pipeline::builder(Arc::new(MemoryStore::new()), Arc::new(config))
            .clock(clock)
            .build()
            .unwrap()
    }

    fn device(source: &str, native: &str, serial: &str) -> Snapshot {
        Snapshot::new("Device", source, native, Timestamp::from_millis(10)).with_property("Serial", serial)
    }

    #[test]
    fn malformed_snapshots_never_reach_the_queue() {
        let p = pipeline(Arc::new(ManualClock::new(Timestamp::from_millis(0))));
        assert!(p.submit(&device("", "n", "S")).is_err());
        assert!(p.submit_json(r#"{"modelType": "Device"}"#).is_err());
        assert!(p.store().list_intake(IntakeStatus::Pending, 10).unwrap().is_empty());
    }

    #[test]
    fn expired_deadline_requeues_without_charging() {
        let p = pipeline(Arc::new(ManualClock::new(Timestamp::from_millis(0))));
        let id = p.submit(&device("a", "1", "S1")).unwrap();

        let report = p.process_intake_batch(Instant::now()).unwrap();
        assert_eq!(report.requeued, 1);
        let record = p.store().get_intake(id).unwrap().unwrap();
        assert_eq!(record.status, IntakeStatus::Pending);
        assert_eq!(record.attempts, 0);
    }

    #[test]
    fn run_until_idle_builds_views() {
        let p = pipeline(Arc::new(ManualClock::new(Timestamp::from_millis(0))));
        p.submit(&device("a", "1", "S1")).unwrap();
        p.submit(&device("b", "2", "S1")).unwrap();

        let summary = p.run_until_idle().unwrap();
        assert_eq!(summary.intake.created, 1);
        assert_eq!(summary.intake.updated, 1);
        assert!(summary.materialization.built >= 1);
        assert_eq!(p.store().pending_materializations().unwrap(), 0);
    }

    #[test]
    fn purge_respects_retention() {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(0)));
        let p = pipeline(Arc::clone(&clock));
        p.submit(&device("a", "1", "S1")).unwrap();
        p.run_until_idle().unwrap();

        assert_eq!(p.purge_expired().unwrap(), 0);
        clock.advance_ms(p.config().retention.snapshot_retention_ms + 1_000);
        assert_eq!(p.purge_expired().unwrap(), 1);
    }
}
