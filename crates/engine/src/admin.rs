//! Operator actions: replay, reprojection and the rejected-record workflow.

use std::collections::BTreeSet;

use tracing::{info, warn};

use meridian_core::{CanonicalId, IntakeId, Timestamp};
use meridian_storage::{IntakeRecord, IntakeStatus, ProjectionView};

use crate::coalesce::CoalescingDecision;
use crate::error::EngineError;
use crate::pipeline::Pipeline;

/// How an operator settles a rejected intake record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Merge every cluster named in the evidence into the oldest one, then
    /// run the record again.
    MergeClusters,
    /// Attach the record to this entity, claiming only tags nobody holds.
    AssignTo(CanonicalId),
    /// Start a new entity from the record's unclaimed tags.
    CreateSeparate,
    /// Park the record for good.
    Discard { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// The record is pending again and will coalesce into `survivor`.
    Merged {
        survivor: CanonicalId,
        absorbed: Vec<CanonicalId>,
    },
    Attached { canonical_id: CanonicalId, version: u64 },
    Created { canonical_id: CanonicalId },
    Discarded,
}

pub struct AdminService<'a> {
    pipeline: &'a Pipeline,
}

impl<'a> AdminService<'a> {
    pub fn new(pipeline: &'a Pipeline) -> Self {
        Self { pipeline }
    }

    /// Put every finished record received in `[from, to)` back on the
    /// queue. Already-applied contributions are no-ops on the second pass.
    pub fn replay(&self, from: Timestamp, to: Timestamp) -> Result<Vec<IntakeId>, EngineError> {
        let now = self.pipeline.now()?;
        let reset = self.pipeline.store().reset_range(from, to, now)?;
        info!(from = %from, to = %to, count = reset.len(), "replay scheduled");
        Ok(reset)
    }

    /// Recompute the materialized view and re-render projections (all when
    /// `views` is `None`), regardless of staleness.
    pub fn reproject(
        &self,
        canonical_id: CanonicalId,
        views: Option<&[&str]>,
    ) -> Result<Vec<ProjectionView>, EngineError> {
        let store = self.pipeline.store();
        let now = self.pipeline.now()?;
        let root = store
            .resolve(canonical_id)?
            .ok_or_else(|| EngineError::CanonicalNotFound(canonical_id.to_string()))?;
        let entity = store
            .get_canonical(root)?
            .ok_or_else(|| EngineError::CanonicalNotFound(root.to_string()))?;

        let view = self.pipeline.materializer().materialize_entity(&entity, now);
        store.put_materialized(&view)?;
        let built = self
            .pipeline
            .projections()
            .render(store, &entity, &view, views, now)?;
        info!(canonical_id = %root, views = built.len(), "reprojected");
        Ok(built)
    }

    /// Rejected records with their evidence, oldest first.
    pub fn list_rejected(&self, limit: usize) -> Result<Vec<IntakeRecord>, EngineError> {
        Ok(self
            .pipeline
            .store()
            .list_intake(IntakeStatus::Rejected, limit)?)
    }

    pub fn resolve_rejected(
        &self,
        intake_id: IntakeId,
        resolution: Resolution,
    ) -> Result<ResolutionOutcome, EngineError> {
        let store = self.pipeline.store();
        let record = store
            .get_intake(intake_id)?
            .ok_or_else(|| EngineError::IntakeNotFound(intake_id.to_string()))?;
        if record.status != IntakeStatus::Rejected {
            return Err(EngineError::NotRejected(intake_id.to_string()));
        }
        let now = self.pipeline.now()?;

        let outcome = match resolution {
            Resolution::MergeClusters => self.merge_clusters(&record, now)?,
            Resolution::AssignTo(target) => {
                if store.resolve(target)?.is_none() {
                    return Err(EngineError::CanonicalNotFound(target.to_string()));
                }
                let decision =
                    self.pipeline
                        .coalescer()
                        .force_attach(store, &record.snapshot, target, now)?;
                let (canonical_id, version) = self.settle(&record, &decision, now)?;
                ResolutionOutcome::Attached { canonical_id, version }
            }
            Resolution::CreateSeparate => {
                let decision = self
                    .pipeline
                    .coalescer()
                    .create_separate(store, &record.snapshot, now)?;
                let (canonical_id, _) = self.settle(&record, &decision, now)?;
                ResolutionOutcome::Created { canonical_id }
            }
            Resolution::Discard { reason } => {
                store.mark_parked(intake_id, &reason, now)?;
                ResolutionOutcome::Discarded
            }
        };
        info!(intake_id = %intake_id, ?outcome, "rejected record resolved");
        Ok(outcome)
    }

    fn merge_clusters(&self, record: &IntakeRecord, now: Timestamp) -> Result<ResolutionOutcome, EngineError> {
        let store = self.pipeline.store();
        let evidence = record.evidence.as_ref().ok_or_else(|| {
            EngineError::InvalidResolution(format!("intake {} has no rejection evidence", record.intake_id))
        })?;

        let mut roots = BTreeSet::new();
        for id in evidence.canonical_ids() {
            if let Some(root) = store.resolve(id)? {
                roots.insert(root);
            }
        }
        let mut roots = roots.into_iter();
        let survivor = roots
            .next()
            .ok_or_else(|| EngineError::InvalidResolution("evidence names no live entity".into()))?;

        let absorbed: Vec<CanonicalId> = roots.collect();
        let mut version = None;
        for id in &absorbed {
            let merged = store.merge_canonical(survivor, *id, now)?;
            store.delete_views(*id)?;
            version = Some(merged.version);
        }
        if let Some(version) = version {
            store.enqueue_materialization(survivor, version, now)?;
        } else {
            warn!(intake_id = %record.intake_id, "evidence clusters were already merged");
        }
        store.reset_intake(record.intake_id, now)?;
        Ok(ResolutionOutcome::Merged { survivor, absorbed })
    }

    /// Finish a manually decided record and queue its entity for rebuild.
    fn settle(
        &self,
        record: &IntakeRecord,
        decision: &CoalescingDecision,
        now: Timestamp,
    ) -> Result<(CanonicalId, u64), EngineError> {
        let store = self.pipeline.store();
        let (canonical_id, version) = decision.materialization_target().ok_or_else(|| {
            EngineError::InvalidResolution(format!("intake {} was rejected again", record.intake_id))
        })?;
        store.enqueue_materialization(canonical_id, version, now)?;
        store.mark_processed(record.intake_id, now)?;
        Ok((canonical_id, version))
    }
}
