//! Identity resolution: decide whether a snapshot creates, updates or is
//! rejected against the existing canonical clusters.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::{debug, info, warn};

use meridian_core::snapshot::external_id_path;
use meridian_core::{
    CanonicalId, CorrelationTag, PipelineConfig, PropertyValue, Snapshot, Timestamp, extract_tags,
};
use meridian_storage::{
    ApplyOutcome, CanonicalStore, ContributionUpdate, NewCanonical, RejectionEvidence, StorageError,
    TagMatch,
};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoalescingDecision {
    CreateNew { canonical_id: CanonicalId, version: u64 },
    UpdateExisting { canonical_id: CanonicalId, version: u64 },
    /// The contribution was already part of the cluster.
    AlreadyApplied { canonical_id: CanonicalId, version: u64 },
    Reject { evidence: RejectionEvidence },
}

impl CoalescingDecision {
    /// Entity and version a materialization task should be queued for.
    pub fn materialization_target(&self) -> Option<(CanonicalId, u64)> {
        match self {
            Self::CreateNew { canonical_id, version }
            | Self::UpdateExisting { canonical_id, version }
            | Self::AlreadyApplied { canonical_id, version } => Some((*canonical_id, *version)),
            Self::Reject { .. } => None,
        }
    }

    pub fn canonical_id(&self) -> Option<CanonicalId> {
        self.materialization_target().map(|(id, _)| id)
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Self::Reject { .. })
    }
}

/// Everything a snapshot contributes, computed once per attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedContribution {
    pub model_type: String,
    pub tags: BTreeSet<CorrelationTag>,
    pub update: ContributionUpdate,
}

impl PreparedContribution {
    fn new_canonical(&self, tags: BTreeSet<CorrelationTag>) -> NewCanonical {
        NewCanonical {
            model_type: self.model_type.clone(),
            tags,
            contribution: self.update.contribution.clone(),
            properties: self.update.properties.clone(),
        }
    }
}

pub struct CoalescingEngine {
    config: Arc<PipelineConfig>,
}

impl CoalescingEngine {
    pub fn new(config: Arc<PipelineConfig>) -> Self {
        Self { config }
    }

    /// Tags plus properties, with the `identifier.external.<source>`
    /// lineage property appended.
    pub fn prepare(&self, snapshot: &Snapshot) -> PreparedContribution {
        let tags = extract_tags(snapshot, &self.config);
        let mut properties = snapshot.properties.clone();
        let external = external_id_path(&snapshot.source_system);
        if snapshot.property(&external).is_none() {
            properties.push((external, PropertyValue::Text(snapshot.native_id.clone())));
        }
        PreparedContribution {
            model_type: snapshot.model_type.clone(),
            update: ContributionUpdate {
                tags: tags.clone(),
                contribution: snapshot.contribution(),
                properties,
            },
            tags,
        }
    }

    /// Matched clusters grouped by their live root, with the tags that hit each.
    pub fn matched_roots<S: CanonicalStore + ?Sized>(
        &self,
        store: &S,
        model_type: &str,
        tags: &BTreeSet<CorrelationTag>,
    ) -> Result<BTreeMap<CanonicalId, BTreeSet<CorrelationTag>>, EngineError> {
        let mut roots: BTreeMap<CanonicalId, BTreeSet<CorrelationTag>> = BTreeMap::new();
        for (id, hit) in store.match_tags(model_type, tags)? {
            if let Some(root) = store.resolve(id)? {
                roots.entry(root).or_default().extend(hit);
            }
        }
        Ok(roots)
    }

    pub fn coalesce<S: CanonicalStore + ?Sized>(
        &self,
        store: &S,
        snapshot: &Snapshot,
        now: Timestamp,
    ) -> Result<CoalescingDecision, EngineError> {
        let prepared = self.prepare(snapshot);
        self.with_conflict_retries(snapshot, || self.decide(store, &prepared, now))
    }

    fn decide<S: CanonicalStore + ?Sized>(
        &self,
        store: &S,
        prepared: &PreparedContribution,
        now: Timestamp,
    ) -> Result<CoalescingDecision, StorageError> {
        let roots = self
            .matched_roots(store, &prepared.model_type, &prepared.tags)
            .map_err(into_storage)?;

        match roots.len() {
            0 => {
                let entity = store.create_canonical(&prepared.new_canonical(prepared.tags.clone()), now)?;
                info!(
                    canonical_id = %entity.canonical_id,
                    model_type = prepared.model_type.as_str(),
                    "created canonical entity"
                );
                Ok(CoalescingDecision::CreateNew {
                    canonical_id: entity.canonical_id,
                    version: entity.version,
                })
            }
            1 => {
                let Some(canonical_id) = roots.keys().next().copied() else {
                    return Err(StorageError::InvalidState("empty match set".into()));
                };
                self.attach(store, canonical_id, &prepared.update, now)
            }
            _ => {
                let evidence = RejectionEvidence {
                    reason: format!(
                        "tags match {} distinct canonical entities",
                        roots.len()
                    ),
                    tags: prepared.tags.iter().cloned().collect(),
                    matches: roots
                        .into_iter()
                        .map(|(canonical_id, tags)| TagMatch {
                            canonical_id,
                            tags: tags.into_iter().collect(),
                        })
                        .collect(),
                };
                warn!(
                    model_type = prepared.model_type.as_str(),
                    source_system = prepared.update.contribution.source_system.as_str(),
                    native_id = prepared.update.contribution.native_id.as_str(),
                    clusters = ?evidence.canonical_ids(),
                    "ambiguous correlation rejected"
                );
                Ok(CoalescingDecision::Reject { evidence })
            }
        }
    }

    fn attach<S: CanonicalStore + ?Sized>(
        &self,
        store: &S,
        canonical_id: CanonicalId,
        update: &ContributionUpdate,
        now: Timestamp,
    ) -> Result<CoalescingDecision, StorageError> {
        let entity = store
            .get_canonical(canonical_id)?
            .ok_or_else(|| StorageError::NotFound(format!("canonical entity {canonical_id}")))?;
        let canonical_id = entity.canonical_id;
        if entity.has_contribution(&update.contribution) {
            return Ok(CoalescingDecision::AlreadyApplied {
                canonical_id,
                version: entity.version,
            });
        }
        let decision = match store.apply_contribution(canonical_id, entity.version, update, now)? {
            ApplyOutcome::Applied { version } => CoalescingDecision::UpdateExisting { canonical_id, version },
            ApplyOutcome::AlreadyPresent { version } => {
                CoalescingDecision::AlreadyApplied { canonical_id, version }
            }
        };
        debug!(canonical_id = %canonical_id, ?decision, "coalesced into existing entity");
        Ok(decision)
    }

    /// Attach a snapshot to `target` regardless of what its tags match.
    /// Only tags no other cluster holds are added.
    pub fn force_attach<S: CanonicalStore + ?Sized>(
        &self,
        store: &S,
        snapshot: &Snapshot,
        target: CanonicalId,
        now: Timestamp,
    ) -> Result<CoalescingDecision, EngineError> {
        let prepared = self.prepare(snapshot);
        self.with_conflict_retries(snapshot, || {
            let root = store
                .resolve(target)?
                .ok_or_else(|| StorageError::NotFound(format!("canonical entity {target}")))?;
            let mut update = prepared.update.clone();
            update.tags = self.unclaimed(store, &prepared, Some(root))?;
            self.attach(store, root, &update, now)
        })
    }

    /// Create a new entity for a snapshot, keeping only unclaimed tags.
    pub fn create_separate<S: CanonicalStore + ?Sized>(
        &self,
        store: &S,
        snapshot: &Snapshot,
        now: Timestamp,
    ) -> Result<CoalescingDecision, EngineError> {
        let prepared = self.prepare(snapshot);
        self.with_conflict_retries(snapshot, || {
            let tags = self.unclaimed(store, &prepared, None)?;
            let entity = store.create_canonical(&prepared.new_canonical(tags), now)?;
            info!(canonical_id = %entity.canonical_id, "created separate canonical entity");
            Ok(CoalescingDecision::CreateNew {
                canonical_id: entity.canonical_id,
                version: entity.version,
            })
        })
    }

    fn unclaimed<S: CanonicalStore + ?Sized>(
        &self,
        store: &S,
        prepared: &PreparedContribution,
        owner: Option<CanonicalId>,
    ) -> Result<BTreeSet<CorrelationTag>, StorageError> {
        let mut free = BTreeSet::new();
        for tag in &prepared.tags {
            let holders = store.get_by_tag(&prepared.model_type, tag)?;
            if holders.iter().all(|id| Some(*id) == owner) {
                free.insert(tag.clone());
            }
        }
        Ok(free)
    }

    /// Re-run `step` while it fails with a concurrency conflict.
    fn with_conflict_retries<F>(&self, snapshot: &Snapshot, mut step: F) -> Result<CoalescingDecision, EngineError>
    where
        F: FnMut() -> Result<CoalescingDecision, StorageError>,
    {
        let attempts = self.config.retry.conflict_retries.saturating_add(1);
        for attempt in 1..=attempts {
            match step() {
                Ok(decision) => return Ok(decision),
                Err(e) if is_conflict(&e) => {
                    debug!(
                        source_system = snapshot.source_system.as_str(),
                        native_id = snapshot.native_id.as_str(),
                        attempt,
                        error = %e,
                        "coalescing conflict, re-running decision"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::ConflictRetriesExhausted {
            what: format!("{}:{}", snapshot.source_system, snapshot.native_id),
            attempts,
        })
    }
}

fn is_conflict(e: &StorageError) -> bool {
    matches!(
        e,
        StorageError::VersionConflict { .. }
            | StorageError::TagClaimed { .. }
            | StorageError::Redirected { .. }
    )
}

fn into_storage(e: EngineError) -> StorageError {
    match e {
        EngineError::Storage(inner) => inner,
        other => StorageError::InvalidState(other.to_string()),
    }
}
