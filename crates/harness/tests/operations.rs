use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use meridian_core::config::{RetryConfig, WorkerConfig};
use meridian_core::{
    CanonicalId, Contribution, CorrelationTag, IntakeId, ModelPolicies, PipelineConfig, PropertyValue,
    Snapshot, Timestamp,
};
use meridian_engine::{CANONICAL_VIEW, PolicyRegistry, Resolution, ResolutionOutcome};
use meridian_harness::{TestPipeline, device_config, init_tracing, snapshot};
use meridian_storage::{
    ApplyOutcome, CanonicalEntity, CanonicalStore, ContributionUpdate, IntakeRecord, IntakeStatus,
    IntakeStore, MaterializationTask, MaterializedView, MemoryStore, NewCanonical, Page, ProjectionView,
    RejectionEvidence, StorageError, TaskQueue, ViewStore,
};
use tempfile::TempDir;

/// Memory store whose canonical writes lose a version race a set number
/// of times, and whose intake acknowledgements can be made to fail.
struct ContendedStore {
    inner: MemoryStore,
    conflicts_left: AtomicU32,
    failed_acks_left: AtomicU32,
}

impl ContendedStore {
    fn new(conflicts: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            conflicts_left: AtomicU32::new(conflicts),
            failed_acks_left: AtomicU32::new(0),
        }
    }

    fn failing_acks(failures: u32) -> Self {
        Self {
            failed_acks_left: AtomicU32::new(failures),
            ..Self::new(0)
        }
    }

    fn contend(&self, canonical_id: Option<CanonicalId>) -> Result<(), StorageError> {
        let lost = self
            .conflicts_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(StorageError::VersionConflict {
                canonical_id: canonical_id.map(|id| id.to_string()).unwrap_or_default(),
                expected: 0,
                actual: 1,
            });
        }
        Ok(())
    }
}

impl IntakeStore for ContendedStore {
    fn enqueue(&self, snapshot: &Snapshot, now: Timestamp) -> Result<IntakeId, StorageError> {
        self.inner.enqueue(snapshot, now)
    }
    fn dequeue(&self, batch_size: usize, now: Timestamp) -> Result<Vec<IntakeRecord>, StorageError> {
        self.inner.dequeue(batch_size, now)
    }
    fn mark_processed(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        let fail = self
            .failed_acks_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(StorageError::InvalidState(format!("ack of {intake_id} lost")));
        }
        self.inner.mark_processed(intake_id, now)
    }
    fn mark_failed(&self, intake_id: IntakeId, reason: &str, retry_at: Timestamp, now: Timestamp) -> Result<(), StorageError> {
        self.inner.mark_failed(intake_id, reason, retry_at, now)
    }
    fn mark_parked(&self, intake_id: IntakeId, reason: &str, now: Timestamp) -> Result<(), StorageError> {
        self.inner.mark_parked(intake_id, reason, now)
    }
    fn mark_rejected(&self, intake_id: IntakeId, evidence: &RejectionEvidence, now: Timestamp) -> Result<(), StorageError> {
        self.inner.mark_rejected(intake_id, evidence, now)
    }
    fn requeue(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        self.inner.requeue(intake_id, now)
    }
    fn reset_intake(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        self.inner.reset_intake(intake_id, now)
    }
    fn get_intake(&self, intake_id: IntakeId) -> Result<Option<IntakeRecord>, StorageError> {
        self.inner.get_intake(intake_id)
    }
    fn list_intake(&self, status: IntakeStatus, limit: usize) -> Result<Vec<IntakeRecord>, StorageError> {
        self.inner.list_intake(status, limit)
    }
    fn reset_range(&self, from: Timestamp, to: Timestamp, now: Timestamp) -> Result<Vec<IntakeId>, StorageError> {
        self.inner.reset_range(from, to, now)
    }
    fn purge_completed_before(&self, cutoff: Timestamp) -> Result<usize, StorageError> {
        self.inner.purge_completed_before(cutoff)
    }
}

impl CanonicalStore for ContendedStore {
    fn get_by_tag(&self, model_type: &str, tag: &CorrelationTag) -> Result<Vec<CanonicalId>, StorageError> {
        self.inner.get_by_tag(model_type, tag)
    }
    fn get_canonical(&self, canonical_id: CanonicalId) -> Result<Option<CanonicalEntity>, StorageError> {
        self.inner.get_canonical(canonical_id)
    }
    fn resolve(&self, canonical_id: CanonicalId) -> Result<Option<CanonicalId>, StorageError> {
        self.inner.resolve(canonical_id)
    }
    fn create_canonical(&self, new: &NewCanonical, now: Timestamp) -> Result<CanonicalEntity, StorageError> {
        self.contend(None)?;
        self.inner.create_canonical(new, now)
    }
    fn append(
        &self,
        canonical_id: CanonicalId,
        path: &str,
        value: &PropertyValue,
        contribution: &Contribution,
        now: Timestamp,
    ) -> Result<u64, StorageError> {
        self.inner.append(canonical_id, path, value, contribution, now)
    }
    fn union_tags(&self, canonical_id: CanonicalId, tags: &BTreeSet<CorrelationTag>, now: Timestamp) -> Result<u64, StorageError> {
        self.inner.union_tags(canonical_id, tags, now)
    }
    fn apply_contribution(
        &self,
        canonical_id: CanonicalId,
        expected_version: u64,
        update: &ContributionUpdate,
        now: Timestamp,
    ) -> Result<ApplyOutcome, StorageError> {
        self.contend(Some(canonical_id))?;
        self.inner.apply_contribution(canonical_id, expected_version, update, now)
    }
    fn list_canonical(&self, model_type: Option<&str>, page: Page) -> Result<Vec<CanonicalId>, StorageError> {
        self.inner.list_canonical(model_type, page)
    }
    fn merge_canonical(&self, survivor: CanonicalId, absorbed: CanonicalId, now: Timestamp) -> Result<CanonicalEntity, StorageError> {
        self.inner.merge_canonical(survivor, absorbed, now)
    }
    fn split_canonical(
        &self,
        source: CanonicalId,
        contributors: &[(String, String)],
        now: Timestamp,
    ) -> Result<CanonicalEntity, StorageError> {
        self.inner.split_canonical(source, contributors, now)
    }
}

impl ViewStore for ContendedStore {
    fn put_materialized(&self, view: &MaterializedView) -> Result<(), StorageError> {
        self.inner.put_materialized(view)
    }
    fn get_materialized(&self, canonical_id: CanonicalId) -> Result<Option<MaterializedView>, StorageError> {
        self.inner.get_materialized(canonical_id)
    }
    fn put_projection(&self, view: &ProjectionView) -> Result<(), StorageError> {
        self.inner.put_projection(view)
    }
    fn get_projection(&self, view_name: &str, canonical_id: CanonicalId) -> Result<Option<ProjectionView>, StorageError> {
        self.inner.get_projection(view_name, canonical_id)
    }
    fn list_projections(&self, view_name: &str, model_type: Option<&str>) -> Result<Vec<ProjectionView>, StorageError> {
        self.inner.list_projections(view_name, model_type)
    }
    fn delete_views(&self, canonical_id: CanonicalId) -> Result<(), StorageError> {
        self.inner.delete_views(canonical_id)
    }
}

impl TaskQueue for ContendedStore {
    fn enqueue_materialization(&self, canonical_id: CanonicalId, version: u64, now: Timestamp) -> Result<bool, StorageError> {
        self.inner.enqueue_materialization(canonical_id, version, now)
    }
    fn dequeue_materialization(&self, batch_size: usize) -> Result<Vec<MaterializationTask>, StorageError> {
        self.inner.dequeue_materialization(batch_size)
    }
    fn complete_materialization(&self, task: &MaterializationTask) -> Result<(), StorageError> {
        self.inner.complete_materialization(task)
    }
    fn release_materialization(&self, task: &MaterializationTask) -> Result<(), StorageError> {
        self.inner.release_materialization(task)
    }
    fn pending_materializations(&self) -> Result<usize, StorageError> {
        self.inner.pending_materializations()
    }
}

fn contended_config() -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    Ok(PipelineConfig::builder()
        .register_model("Device", ["Serial"], ModelPolicies::new())
        .retry(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            conflict_retries: 0,
        })
        .build()?)
}

// ============================================================================
// Retry and parking
// ============================================================================

#[test]
fn transient_failures_back_off_then_park() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let fixture = TestPipeline::with_store(
        Arc::new(ContendedStore::new(u32::MAX)),
        contended_config()?,
        PolicyRegistry::new(),
    )?;
    let id = fixture.submit(&snapshot("Device", "bms", "1", 10, &[("Serial", "S1")]))?;

    let summary = fixture.run_until_idle()?;
    assert_eq!(summary.intake.retried, 1);
    let record = fixture.store().get_intake(id)?.ok_or("missing record")?;
    assert_eq!(record.status, IntakeStatus::Pending);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.not_before.as_millis(), TestPipeline::START_MS + 100);
    assert!(record.last_error.is_some());

    // Still gated: nothing to do until the backoff passes.
    fixture.clock.advance_ms(99);
    assert_eq!(fixture.run_until_idle()?.intake.dequeued, 0);

    fixture.clock.advance_ms(1);
    assert_eq!(fixture.run_until_idle()?.intake.retried, 1);
    let record = fixture.store().get_intake(id)?.ok_or("missing record")?;
    assert_eq!(record.not_before, fixture.now()?.saturating_add_ms(200));

    fixture.clock.advance_ms(200);
    let summary = fixture.run_until_idle()?;
    assert_eq!(summary.intake.parked, 1);
    let record = fixture.store().get_intake(id)?.ok_or("missing record")?;
    assert_eq!(record.status, IntakeStatus::Parked);
    assert_eq!(record.attempts, 3);
    assert!(fixture.entities("Device")?.is_empty());
    Ok(())
}

#[test]
fn transient_failure_recovers_on_retry() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::with_store(
        Arc::new(ContendedStore::new(1)),
        contended_config()?,
        PolicyRegistry::new(),
    )?;
    let id = fixture.submit(&snapshot("Device", "bms", "1", 10, &[("Serial", "S1")]))?;
    fixture.run_until_idle()?;
    fixture.clock.advance_ms(100);
    let summary = fixture.run_until_idle()?;
    assert_eq!(summary.intake.created, 1);
    assert_eq!(fixture.store().get_intake(id)?.ok_or("missing record")?.status, IntakeStatus::Completed);
    Ok(())
}

#[test]
fn conflicts_within_the_retry_limit_are_absorbed() -> Result<(), Box<dyn std::error::Error>> {
    let config = PipelineConfig::builder()
        .register_model("Device", ["Serial"], ModelPolicies::new())
        .build()?;
    let fixture = TestPipeline::with_store(Arc::new(ContendedStore::new(3)), config, PolicyRegistry::new())?;
    let summary = fixture.ingest(&[
        snapshot("Device", "bms", "1", 10, &[("Serial", "S1")]),
        snapshot("Device", "oem", "1", 20, &[("Serial", "S1")]),
    ])?;
    assert_eq!(summary.intake.retried, 0);
    assert_eq!(fixture.only_entity("Device")?.contributions.len(), 2);
    Ok(())
}

#[test]
fn failed_ack_gives_the_rest_of_the_batch_back() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::with_store(
        Arc::new(ContendedStore::failing_acks(1)),
        contended_config()?,
        PolicyRegistry::new(),
    )?;
    let ids = fixture.submit_all(&[
        snapshot("Device", "bms", "1", 10, &[("Serial", "S1")]),
        snapshot("Device", "bms", "2", 20, &[("Serial", "S2")]),
        snapshot("Device", "bms", "3", 30, &[("Serial", "S3")]),
    ])?;

    assert!(fixture.run_once().is_err());
    for id in &ids {
        let record = fixture.store().get_intake(*id)?.ok_or("missing record")?;
        assert_eq!(record.status, IntakeStatus::Pending);
        assert_eq!(record.attempts, 0);
    }

    // The first record was coalesced before its ack failed; redoing it is a no-op.
    let summary = fixture.run_until_idle()?;
    assert_eq!(summary.intake.created, 2);
    assert_eq!(summary.intake.unchanged, 1);
    for id in &ids {
        let record = fixture.store().get_intake(*id)?.ok_or("missing record")?;
        assert_eq!(record.status, IntakeStatus::Completed);
    }
    assert_eq!(fixture.entities("Device")?.len(), 3);
    Ok(())
}

// ============================================================================
// Durability
// ============================================================================

#[test]
fn sqlite_state_survives_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("meridian.db");

    let first_id = {
        let fixture = TestPipeline::sqlite_at(&path, device_config()?)?;
        fixture.ingest(&[snapshot("Device", "bms", "d4", 100, &[("Serial", "SN004"), ("Model", "X")])])?;
        fixture.only_entity("Device")?.canonical_id
    };

    let fixture = TestPipeline::sqlite_at(&path, device_config()?)?;
    let stored = fixture.store().get_projection(CANONICAL_VIEW, first_id)?.ok_or("projection lost")?;
    assert_eq!(stored.payload_json()?["Model"], serde_json::json!("X"));

    fixture.ingest(&[snapshot("Device", "oem", "d4", 200, &[("Serial", "SN004"), ("Model", "X-Pro")])])?;
    let entity = fixture.only_entity("Device")?;
    assert_eq!(entity.canonical_id, first_id);
    assert_eq!(entity.version, 2);
    assert_eq!(fixture.resolved(first_id, "Model")?, PropertyValue::from("X-Pro"));
    Ok(())
}

#[test]
fn in_flight_records_are_recovered_after_restart() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("meridian.db");

    let intake_id = {
        let fixture = TestPipeline::sqlite_at(&path, device_config()?)?;
        let id = fixture.submit(&snapshot("Device", "bms", "1", 10, &[("Serial", "S1")]))?;
        // Claimed, then the process goes away.
        let claimed = fixture.store().dequeue(10, fixture.now()?)?;
        assert_eq!(claimed.len(), 1);
        id
    };

    let fixture = TestPipeline::sqlite_at(&path, device_config()?)?;
    assert_eq!(fixture.run_until_idle()?.intake.dequeued, 0);
    assert_eq!(fixture.recover_in_flight()?, 1);
    fixture.run_until_idle()?;
    let record = fixture.store().get_intake(intake_id)?.ok_or("missing record")?;
    assert_eq!(record.status, IntakeStatus::Completed);
    assert_eq!(record.attempts, 1);
    Ok(())
}

#[test]
fn completed_records_are_purged_after_retention() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::sqlite(device_config()?)?;
    let start = TestPipeline::START_MS;
    fixture.ingest(&[
        snapshot("Device", "bms", "1", start - 10, &[("Serial", "S1")]),
        snapshot("Device", "bms", "2", start, &[("Serial", "S2")]),
    ])?;
    fixture.clock.advance_ms(fixture.config().retention.snapshot_retention_ms - 5);
    assert_eq!(fixture.purge_expired()?, 1);
    // Canonical state is untouched by intake retention.
    assert_eq!(fixture.entities("Device")?.len(), 2);
    Ok(())
}

// ============================================================================
// Operator workflow on SQLite
// ============================================================================

#[test]
fn rejected_bridge_merged_on_sqlite() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::sqlite(device_config()?)?;
    fixture.ingest(&[
        snapshot("Device", "bms", "a", 10, &[("Serial", "S1")]),
        snapshot("Device", "cmdb", "c", 20, &[("Network.Mac", "M1")]),
        snapshot("Device", "oem", "b", 30, &[("Serial", "S1"), ("Network.Mac", "M1")]),
    ])?;
    let rejected = fixture.admin().list_rejected(10)?;
    assert_eq!(rejected.len(), 1);
    let evidence = rejected[0].evidence.clone().ok_or("missing evidence")?;
    let oldest = evidence.canonical_ids().into_iter().min().ok_or("no clusters")?;

    let outcome = fixture
        .admin()
        .resolve_rejected(rejected[0].intake_id, Resolution::MergeClusters)?;
    assert!(matches!(outcome, ResolutionOutcome::Merged { survivor, .. } if survivor == oldest));
    fixture.run_until_idle()?;

    let entity = fixture.only_entity("Device")?;
    assert_eq!(entity.canonical_id, oldest);
    assert_eq!(entity.contributions.len(), 3);
    assert_eq!(entity.merged_from.len(), 1);
    let lineage = fixture.query().lineage(oldest)?;
    assert_eq!(lineage["mergedFrom"].as_array().map(Vec::len), Some(1));
    Ok(())
}

// ============================================================================
// Parallel workers
// ============================================================================

fn fleet(devices: usize, sources: &[&str]) -> Vec<Snapshot> {
    let mut snapshots = Vec::new();
    for (s, source) in sources.iter().enumerate() {
        for d in 0..devices {
            snapshots.push(snapshot(
                "Device",
                source,
                &format!("{source}-{d}"),
                (s * 1_000 + d) as i64,
                &[
                    ("Serial", PropertyValue::from(format!("SN{d:04}"))),
                    ("Model", PropertyValue::from(format!("{source}-model"))),
                ],
            ));
        }
    }
    snapshots
}

fn assert_fleet(fixture: &TestPipeline, devices: usize, sources: usize) -> Result<(), Box<dyn std::error::Error>> {
    let entities = fixture.entities("Device")?;
    assert_eq!(entities.len(), devices);
    let mut by_serial: BTreeMap<String, usize> = BTreeMap::new();
    for entity in &entities {
        assert_eq!(entity.contributions.len(), sources);
        assert_eq!(entity.version, sources as u64);
        let serial = entity.property("Serial").ok_or("no serial")?[0].value.to_string();
        *by_serial.entry(serial).or_default() += 1;
        assert!(fixture.store().get_projection(CANONICAL_VIEW, entity.canonical_id)?.is_some());
    }
    assert!(by_serial.values().all(|n| *n == 1));
    assert!(fixture.admin().list_rejected(10)?.is_empty());
    assert_eq!(fixture.store().pending_materializations()?, 0);
    Ok(())
}

fn parallel_config() -> Result<PipelineConfig, Box<dyn std::error::Error>> {
    Ok(PipelineConfig::builder()
        .register_model("Device", ["Serial"], ModelPolicies::new().path("Model", "last"))
        .workers(WorkerConfig {
            count: 4,
            batch_size: 8,
            batch_deadline_ms: 5_000,
        })
        .build()?)
}

#[test]
fn workers_drain_memory_store() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::memory(parallel_config()?)?;
    fixture.submit_all(&fleet(40, &["bms", "oem", "cmdb"]))?;
    let summary = fixture.run_workers()?;
    assert_eq!(summary.intake.created, 40);
    assert_eq!(summary.intake.updated, 80);
    assert_fleet(&fixture, 40, 3)?;

    let last = fixture.entities("Device")?.remove(0);
    assert_eq!(fixture.resolved(last.canonical_id, "Model")?, PropertyValue::from("cmdb-model"));
    Ok(())
}

#[test]
fn workers_drain_sqlite_store() -> Result<(), Box<dyn std::error::Error>> {
    let fixture = TestPipeline::sqlite(parallel_config()?)?;
    fixture.submit_all(&fleet(15, &["bms", "oem"]))?;
    fixture.run_workers()?;
    assert_fleet(&fixture, 15, 2)?;
    Ok(())
}
