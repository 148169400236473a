use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use meridian_core::{
    CanonicalId, Contribution, CorrelationTag, IntakeId, PropertyValue, Snapshot, Timestamp,
};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntakeStatus {
    Pending,
    Processing,
    Completed,
    Parked,
    Rejected,
}

impl IntakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Parked => "parked",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "parked" => Ok(Self::Parked),
            "rejected" => Ok(Self::Rejected),
            _ => Err(StorageError::Serialization(format!("unknown intake status: {s}"))),
        }
    }
}

/// Which of a snapshot's tags hit which existing cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagMatch {
    pub canonical_id: CanonicalId,
    pub tags: Vec<CorrelationTag>,
}

/// Diagnostic record kept with a rejected intake record for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionEvidence {
    pub reason: String,
    pub tags: Vec<CorrelationTag>,
    pub matches: Vec<TagMatch>,
}

impl RejectionEvidence {
    pub fn canonical_ids(&self) -> Vec<CanonicalId> {
        self.matches.iter().map(|m| m.canonical_id).collect()
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, StorageError> {
        rmp_serde::to_vec_named(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, StorageError> {
        rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntakeRecord {
    pub intake_id: IntakeId,
    pub snapshot: Snapshot,
    pub status: IntakeStatus,
    /// Incremented on every dequeue; refunded by `requeue`.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub evidence: Option<RejectionEvidence>,
    /// Backoff gate: not handed out by `dequeue` before this time.
    pub not_before: Timestamp,
    pub enqueued_at: Timestamp,
    pub updated_at: Timestamp,
}

/// One attributed value inside a property's value array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyEntry {
    pub value: PropertyValue,
    pub source_system: String,
    pub native_id: String,
    pub received_at: Timestamp,
}

impl PropertyEntry {
    pub fn new(value: PropertyValue, contribution: &Contribution) -> Self {
        Self {
            value,
            source_system: contribution.source_system.clone(),
            native_id: contribution.native_id.clone(),
            received_at: contribution.received_at,
        }
    }

    pub fn is_from(&self, source_system: &str, native_id: &str) -> bool {
        self.source_system == source_system && self.native_id == native_id
    }
}

/// A correlation cluster with its lineage-preserving property arrays.
///
/// Values handed out by a store are copies; the store itself only changes
/// through the `CanonicalStore` operations.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEntity {
    pub canonical_id: CanonicalId,
    pub model_type: String,
    pub correlation_keys: BTreeSet<CorrelationTag>,
    pub properties: BTreeMap<String, Vec<PropertyEntry>>,
    pub contributions: Vec<Contribution>,
    pub merged_from: Vec<CanonicalId>,
    pub version: u64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl CanonicalEntity {
    pub fn has_contribution(&self, contribution: &Contribution) -> bool {
        self.contributions.contains(contribution)
    }

    pub fn property(&self, path: &str) -> Option<&[PropertyEntry]> {
        self.properties.get(path).map(Vec::as_slice)
    }

    /// Insert keeping the array sorted by `received_at`; equal timestamps
    /// keep arrival order.
    pub fn insert_entry(&mut self, path: &str, entry: PropertyEntry) {
        let entries = self.properties.entry(path.to_string()).or_default();
        let pos = entries.partition_point(|e| e.received_at <= entry.received_at);
        entries.insert(pos, entry);
    }

    pub fn apply_update(&mut self, update: &ContributionUpdate, now: Timestamp) {
        for (path, value) in &update.properties {
            self.insert_entry(path, PropertyEntry::new(value.clone(), &update.contribution));
        }
        self.contributions.push(update.contribution.clone());
        self.correlation_keys.extend(update.tags.iter().cloned());
        self.version += 1;
        self.updated_at = now;
    }

    /// Carve the listed `(source_system, native_id)` contributors out into
    /// a new entity. Direct tags stay here; the contributors' synthetic
    /// tags move with them.
    pub fn split_off(
        &mut self,
        new_id: CanonicalId,
        contributors: &[(String, String)],
        now: Timestamp,
    ) -> Result<CanonicalEntity, StorageError> {
        let is_listed = |source: &str, native: &str| {
            contributors.iter().any(|(s, n)| s == source && n == native)
        };

        let (moved, kept): (Vec<Contribution>, Vec<Contribution>) = self
            .contributions
            .iter()
            .cloned()
            .partition(|c| is_listed(&c.source_system, &c.native_id));
        if moved.is_empty() {
            return Err(StorageError::InvalidState(format!(
                "no listed contributor belongs to {}",
                self.canonical_id
            )));
        }
        if kept.is_empty() {
            return Err(StorageError::InvalidState(format!(
                "split would leave {} without contributors",
                self.canonical_id
            )));
        }

        let mut properties: BTreeMap<String, Vec<PropertyEntry>> = BTreeMap::new();
        for (path, entries) in self.properties.iter_mut() {
            let (out, stay): (Vec<PropertyEntry>, Vec<PropertyEntry>) = entries
                .drain(..)
                .partition(|e| is_listed(&e.source_system, &e.native_id));
            *entries = stay;
            if !out.is_empty() {
                properties.insert(path.clone(), out);
            }
        }
        self.properties.retain(|_, entries| !entries.is_empty());

        let moved_tags: BTreeSet<CorrelationTag> = moved
            .iter()
            .map(|c| CorrelationTag::synthetic(&c.source_system, &c.native_id))
            .filter(|t| self.correlation_keys.contains(t))
            .collect();
        self.correlation_keys.retain(|t| !moved_tags.contains(t));
        self.contributions = kept;
        self.version += 1;
        self.updated_at = now;

        Ok(CanonicalEntity {
            canonical_id: new_id,
            model_type: self.model_type.clone(),
            correlation_keys: moved_tags,
            properties,
            contributions: moved,
            merged_from: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        })
    }
}

/// Seed of a brand new canonical entity.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCanonical {
    pub model_type: String,
    pub tags: BTreeSet<CorrelationTag>,
    pub contribution: Contribution,
    pub properties: Vec<(String, PropertyValue)>,
}

impl NewCanonical {
    pub fn into_entity(self, canonical_id: CanonicalId, now: Timestamp) -> CanonicalEntity {
        let mut entity = CanonicalEntity {
            canonical_id,
            model_type: self.model_type,
            correlation_keys: self.tags,
            properties: BTreeMap::new(),
            contributions: vec![self.contribution.clone()],
            merged_from: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        for (path, value) in self.properties {
            entity.insert_entry(&path, PropertyEntry::new(value, &self.contribution));
        }
        entity
    }
}

/// Everything one snapshot adds to an existing cluster, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct ContributionUpdate {
    pub tags: BTreeSet<CorrelationTag>,
    pub contribution: Contribution,
    pub properties: Vec<(String, PropertyValue)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { version: u64 },
    /// The contribution was already part of the entity; nothing changed.
    AlreadyPresent { version: u64 },
}

impl ApplyOutcome {
    pub fn version(&self) -> u64 {
        match self {
            Self::Applied { version } | Self::AlreadyPresent { version } => *version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedView {
    pub canonical_id: CanonicalId,
    pub model_type: String,
    pub values: BTreeMap<String, PropertyValue>,
    pub policy_applied: BTreeMap<String, String>,
    pub warnings: Vec<String>,
    pub materialized_at: Timestamp,
    /// Version of the canonical entity this view was computed from.
    pub version: u64,
}

impl MaterializedView {
    pub fn to_msgpack(&self) -> Result<Vec<u8>, StorageError> {
        rmp_serde::to_vec_named(self).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, StorageError> {
        rmp_serde::from_slice(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionView {
    pub view_name: String,
    pub canonical_id: CanonicalId,
    pub model_type: String,
    /// Rendered JSON document.
    pub payload: String,
    pub content_hash: [u8; 32],
    pub version: u64,
    pub built_at: Timestamp,
}

impl ProjectionView {
    pub fn payload_json(&self) -> Result<serde_json::Value, StorageError> {
        serde_json::from_str(&self.payload).map_err(|e| StorageError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MaterializationTask {
    pub canonical_id: CanonicalId,
    pub version: u64,
    pub enqueued_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(&self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

/// Durable staging of arriving snapshots.
pub trait IntakeStore: Send + Sync {
    fn enqueue(&self, snapshot: &Snapshot, now: Timestamp) -> Result<IntakeId, StorageError>;

    /// Claim up to `batch_size` pending records whose backoff gate has
    /// passed, oldest first. Claimed records move to `Processing`.
    fn dequeue(&self, batch_size: usize, now: Timestamp) -> Result<Vec<IntakeRecord>, StorageError>;

    fn mark_processed(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError>;

    /// Return a record to `Pending`, gated until `retry_at`.
    fn mark_failed(
        &self,
        intake_id: IntakeId,
        reason: &str,
        retry_at: Timestamp,
        now: Timestamp,
    ) -> Result<(), StorageError>;

    fn mark_parked(&self, intake_id: IntakeId, reason: &str, now: Timestamp) -> Result<(), StorageError>;

    fn mark_rejected(
        &self,
        intake_id: IntakeId,
        evidence: &RejectionEvidence,
        now: Timestamp,
    ) -> Result<(), StorageError>;

    /// Give a claimed record back without charging an attempt.
    fn requeue(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError>;

    /// Put a finished record back to `Pending` with a clean attempt count.
    fn reset_intake(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError>;

    fn get_intake(&self, intake_id: IntakeId) -> Result<Option<IntakeRecord>, StorageError>;

    fn list_intake(&self, status: IntakeStatus, limit: usize) -> Result<Vec<IntakeRecord>, StorageError>;

    /// Reset every finished record with `from <= received_at < to`.
    fn reset_range(
        &self,
        from: Timestamp,
        to: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<IntakeId>, StorageError>;

    /// Drop completed records received before `cutoff`.
    fn purge_completed_before(&self, cutoff: Timestamp) -> Result<usize, StorageError>;
}

/// Canonical clusters plus the model-scoped correlation-key index.
pub trait CanonicalStore: Send + Sync {
    fn get_by_tag(&self, model_type: &str, tag: &CorrelationTag) -> Result<Vec<CanonicalId>, StorageError>;

    /// Every live cluster any of `tags` points at, with the tags that hit it.
    fn match_tags(
        &self,
        model_type: &str,
        tags: &BTreeSet<CorrelationTag>,
    ) -> Result<BTreeMap<CanonicalId, BTreeSet<CorrelationTag>>, StorageError> {
        let mut matches: BTreeMap<CanonicalId, BTreeSet<CorrelationTag>> = BTreeMap::new();
        for tag in tags {
            for id in self.get_by_tag(model_type, tag)? {
                matches.entry(id).or_default().insert(tag.clone());
            }
        }
        Ok(matches)
    }

    fn get_canonical(&self, canonical_id: CanonicalId) -> Result<Option<CanonicalEntity>, StorageError>;

    /// Follow merge redirects to the live entity. `None` for unknown ids.
    fn resolve(&self, canonical_id: CanonicalId) -> Result<Option<CanonicalId>, StorageError>;

    /// Fails with `TagClaimed` if another live cluster already owns a tag.
    fn create_canonical(&self, new: &NewCanonical, now: Timestamp) -> Result<CanonicalEntity, StorageError>;

    /// Administrative single-value append. Returns the new version.
    fn append(
        &self,
        canonical_id: CanonicalId,
        path: &str,
        value: &PropertyValue,
        contribution: &Contribution,
        now: Timestamp,
    ) -> Result<u64, StorageError>;

    fn union_tags(
        &self,
        canonical_id: CanonicalId,
        tags: &BTreeSet<CorrelationTag>,
        now: Timestamp,
    ) -> Result<u64, StorageError>;

    /// Idempotency check, appends, tag union and version bump as one step.
    /// Fails with `VersionConflict` when `expected_version` is stale.
    fn apply_contribution(
        &self,
        canonical_id: CanonicalId,
        expected_version: u64,
        update: &ContributionUpdate,
        now: Timestamp,
    ) -> Result<ApplyOutcome, StorageError>;

    /// Live entity ids ordered by id.
    fn list_canonical(&self, model_type: Option<&str>, page: Page) -> Result<Vec<CanonicalId>, StorageError>;

    /// Fold `absorbed` into `survivor`; `absorbed` becomes a redirect.
    fn merge_canonical(
        &self,
        survivor: CanonicalId,
        absorbed: CanonicalId,
        now: Timestamp,
    ) -> Result<CanonicalEntity, StorageError>;

    /// Move the listed `(source_system, native_id)` contributors, their
    /// values and their synthetic tags into a new entity.
    fn split_canonical(
        &self,
        source: CanonicalId,
        contributors: &[(String, String)],
        now: Timestamp,
    ) -> Result<CanonicalEntity, StorageError>;
}

/// Derived state: materialized and projected views.
pub trait ViewStore: Send + Sync {
    /// Ignored when a view of a newer entity version is already stored.
    fn put_materialized(&self, view: &MaterializedView) -> Result<(), StorageError>;

    fn get_materialized(&self, canonical_id: CanonicalId) -> Result<Option<MaterializedView>, StorageError>;

    fn put_projection(&self, view: &ProjectionView) -> Result<(), StorageError>;

    fn get_projection(
        &self,
        view_name: &str,
        canonical_id: CanonicalId,
    ) -> Result<Option<ProjectionView>, StorageError>;

    /// All projections of one view ordered by canonical id.
    fn list_projections(
        &self,
        view_name: &str,
        model_type: Option<&str>,
    ) -> Result<Vec<ProjectionView>, StorageError>;

    fn delete_views(&self, canonical_id: CanonicalId) -> Result<(), StorageError>;
}

/// Materialization work, deduplicated by `(canonical_id, version)`.
pub trait TaskQueue: Send + Sync {
    /// Returns false when the same task is already queued or in flight.
    fn enqueue_materialization(
        &self,
        canonical_id: CanonicalId,
        version: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError>;

    fn dequeue_materialization(&self, batch_size: usize) -> Result<Vec<MaterializationTask>, StorageError>;

    fn complete_materialization(&self, task: &MaterializationTask) -> Result<(), StorageError>;

    /// Hand an in-flight task back to the queue.
    fn release_materialization(&self, task: &MaterializationTask) -> Result<(), StorageError>;

    fn pending_materializations(&self) -> Result<usize, StorageError>;
}

pub trait Store: IntakeStore + CanonicalStore + ViewStore + TaskQueue {}

impl<T: IntakeStore + CanonicalStore + ViewStore + TaskQueue> Store for T {}

/// Allowed source states for each intake transition.
pub(crate) fn check_transition(
    intake_id: IntakeId,
    current: IntakeStatus,
    allowed: &[IntakeStatus],
) -> Result<(), StorageError> {
    if allowed.contains(&current) {
        Ok(())
    } else {
        Err(StorageError::InvalidState(format!(
            "intake {intake_id} is {}",
            current.as_str()
        )))
    }
}
