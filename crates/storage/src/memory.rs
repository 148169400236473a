//! In-process store with sharded locking.
//!
//! Entities and the correlation-key index are split into hash shards, each
//! behind its own `RwLock`. Writers lock entity shards before index shards,
//! and within one family always in ascending shard order.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::debug;

use meridian_core::{
    CanonicalId, Contribution, CorrelationTag, IntakeId, PropertyValue, Snapshot, Timestamp,
};

use crate::error::StorageError;
use crate::traits::*;

const SHARD_COUNT: usize = 16;
const MAX_REDIRECT_HOPS: usize = 64;

type IndexKey = (String, CorrelationTag);
type IndexShard = HashMap<IndexKey, BTreeSet<CanonicalId>>;
type EntityShard = HashMap<CanonicalId, EntitySlot>;

#[derive(Debug, Clone)]
enum EntitySlot {
    Live(CanonicalEntity),
    Redirect(CanonicalId),
}

fn shard_of<K: Hash + ?Sized>(key: &K) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

fn index_key(model_type: &str, tag: &CorrelationTag) -> IndexKey {
    (model_type.to_string(), tag.clone())
}

/// Write guards over a sorted set of index shards.
struct IndexGuards<'a> {
    shards: Vec<usize>,
    guards: Vec<RwLockWriteGuard<'a, IndexShard>>,
}

impl IndexGuards<'_> {
    fn shard_mut(&mut self, key: &IndexKey) -> Result<&mut IndexShard, StorageError> {
        let shard = shard_of(key);
        let pos = self
            .shards
            .binary_search(&shard)
            .map_err(|_| StorageError::InvalidState(format!("index shard {shard} not locked")))?;
        Ok(&mut self.guards[pos])
    }

    /// Fail if any key is owned by a cluster other than `owner`.
    fn check_unclaimed(
        &mut self,
        keys: &[IndexKey],
        owner: Option<CanonicalId>,
    ) -> Result<(), StorageError> {
        for key in keys {
            if let Some(other) = self
                .shard_mut(key)?
                .get(key)
                .and_then(|ids| ids.iter().find(|id| Some(**id) != owner))
            {
                return Err(StorageError::TagClaimed {
                    tag: key.1.key(),
                    owner: other.to_string(),
                });
            }
        }
        Ok(())
    }

    fn claim(&mut self, keys: Vec<IndexKey>, owner: CanonicalId) -> Result<(), StorageError> {
        for key in keys {
            self.shard_mut(&key)?.entry(key).or_default().insert(owner);
        }
        Ok(())
    }

    fn transfer(&mut self, keys: Vec<IndexKey>, from: CanonicalId, to: CanonicalId) -> Result<(), StorageError> {
        for key in keys {
            let owners = self.shard_mut(&key)?.entry(key).or_default();
            owners.remove(&from);
            owners.insert(to);
        }
        Ok(())
    }
}

/// Pick the guard holding `shard` out of a locked lo/hi pair.
fn pick<'a, 'b: 'a>(
    shard: usize,
    lo: usize,
    lo_guard: &'a mut EntityShard,
    hi_guard: &'a mut Option<RwLockWriteGuard<'b, EntityShard>>,
) -> &'a mut EntityShard {
    if shard == lo {
        return lo_guard;
    }
    match hi_guard {
        Some(guard) => guard,
        None => lo_guard,
    }
}

fn live_mut(shard: &mut EntityShard, canonical_id: CanonicalId) -> Result<&mut CanonicalEntity, StorageError> {
    match shard.get_mut(&canonical_id) {
        Some(EntitySlot::Live(entity)) => Ok(entity),
        Some(EntitySlot::Redirect(survivor)) => Err(StorageError::Redirected {
            canonical_id: canonical_id.to_string(),
            survivor: survivor.to_string(),
        }),
        None => Err(StorageError::NotFound(format!("canonical entity {canonical_id}"))),
    }
}

/// Intake records in arrival order.
#[derive(Default)]
struct IntakeLog {
    next_seq: u64,
    records: BTreeMap<u64, IntakeRecord>,
    seqs: HashMap<IntakeId, u64>,
}

impl IntakeLog {
    fn push(&mut self, record: IntakeRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.seqs.insert(record.intake_id, seq);
        self.records.insert(seq, record);
    }

    fn get(&self, intake_id: IntakeId) -> Option<&IntakeRecord> {
        self.records.get(self.seqs.get(&intake_id)?)
    }

    fn get_mut(&mut self, intake_id: IntakeId) -> Option<&mut IntakeRecord> {
        self.records.get_mut(self.seqs.get(&intake_id)?)
    }

    fn retain(&mut self, mut keep: impl FnMut(&IntakeRecord) -> bool) {
        let seqs = &mut self.seqs;
        self.records.retain(|_, record| {
            let kept = keep(record);
            if !kept {
                seqs.remove(&record.intake_id);
            }
            kept
        });
    }
}

#[derive(Default)]
struct TaskState {
    queued: VecDeque<MaterializationTask>,
    queued_keys: HashSet<(CanonicalId, u64)>,
    in_flight: HashSet<(CanonicalId, u64)>,
}

pub struct MemoryStore {
    intake: Mutex<IntakeLog>,
    entities: Vec<RwLock<EntityShard>>,
    index: Vec<RwLock<IndexShard>>,
    materialized: RwLock<HashMap<CanonicalId, MaterializedView>>,
    projections: RwLock<BTreeMap<(String, CanonicalId), ProjectionView>>,
    tasks: Mutex<TaskState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            intake: Mutex::new(IntakeLog::default()),
            entities: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            index: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            materialized: RwLock::new(HashMap::new()),
            projections: RwLock::new(BTreeMap::new()),
            tasks: Mutex::new(TaskState::default()),
        }
    }

    fn lock_index(&self, keys: &[IndexKey]) -> IndexGuards<'_> {
        let shards: Vec<usize> = keys
            .iter()
            .map(shard_of)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let guards = shards.iter().map(|&s| self.index[s].write()).collect();
        IndexGuards { shards, guards }
    }

    fn update_intake<F>(&self, intake_id: IntakeId, allowed: &[IntakeStatus], f: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut IntakeRecord),
    {
        let mut intake = self.intake.lock();
        let record = intake
            .get_mut(intake_id)
            .ok_or_else(|| StorageError::NotFound(format!("intake {intake_id}")))?;
        check_transition(intake_id, record.status, allowed)?;
        f(record);
        Ok(())
    }
}

impl IntakeStore for MemoryStore {
    fn enqueue(&self, snapshot: &Snapshot, now: Timestamp) -> Result<IntakeId, StorageError> {
        let intake_id = IntakeId::new();
        self.intake.lock().push(IntakeRecord {
            intake_id,
            snapshot: snapshot.clone(),
            status: IntakeStatus::Pending,
            attempts: 0,
            last_error: None,
            evidence: None,
            not_before: now,
            enqueued_at: now,
            updated_at: now,
        });
        Ok(intake_id)
    }

    fn dequeue(&self, batch_size: usize, now: Timestamp) -> Result<Vec<IntakeRecord>, StorageError> {
        let mut intake = self.intake.lock();
        let mut claimed = Vec::new();
        for record in intake.records.values_mut() {
            if claimed.len() >= batch_size {
                break;
            }
            if record.status == IntakeStatus::Pending && record.not_before <= now {
                record.status = IntakeStatus::Processing;
                record.attempts += 1;
                record.updated_at = now;
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    fn mark_processed(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        self.update_intake(
            intake_id,
            &[IntakeStatus::Processing, IntakeStatus::Rejected],
            |record| {
                record.status = IntakeStatus::Completed;
                record.updated_at = now;
            },
        )
    }

    fn mark_failed(
        &self,
        intake_id: IntakeId,
        reason: &str,
        retry_at: Timestamp,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        self.update_intake(intake_id, &[IntakeStatus::Processing], |record| {
            record.status = IntakeStatus::Pending;
            record.last_error = Some(reason.to_string());
            record.not_before = retry_at;
            record.updated_at = now;
        })
    }

    fn mark_parked(&self, intake_id: IntakeId, reason: &str, now: Timestamp) -> Result<(), StorageError> {
        self.update_intake(
            intake_id,
            &[IntakeStatus::Processing, IntakeStatus::Rejected],
            |record| {
                record.status = IntakeStatus::Parked;
                record.last_error = Some(reason.to_string());
                record.updated_at = now;
            },
        )
    }

    fn mark_rejected(
        &self,
        intake_id: IntakeId,
        evidence: &RejectionEvidence,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        self.update_intake(intake_id, &[IntakeStatus::Processing], |record| {
            record.status = IntakeStatus::Rejected;
            record.last_error = Some(evidence.reason.clone());
            record.evidence = Some(evidence.clone());
            record.updated_at = now;
        })
    }

    fn requeue(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        self.update_intake(intake_id, &[IntakeStatus::Processing], |record| {
            record.status = IntakeStatus::Pending;
            record.attempts = record.attempts.saturating_sub(1);
            record.updated_at = now;
        })
    }

    fn reset_intake(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        self.update_intake(
            intake_id,
            &[
                IntakeStatus::Pending,
                IntakeStatus::Completed,
                IntakeStatus::Parked,
                IntakeStatus::Rejected,
            ],
            |record| {
                record.status = IntakeStatus::Pending;
                record.attempts = 0;
                record.last_error = None;
                record.evidence = None;
                record.not_before = now;
                record.updated_at = now;
            },
        )
    }

    fn get_intake(&self, intake_id: IntakeId) -> Result<Option<IntakeRecord>, StorageError> {
        Ok(self.intake.lock().get(intake_id).cloned())
    }

    fn list_intake(&self, status: IntakeStatus, limit: usize) -> Result<Vec<IntakeRecord>, StorageError> {
        Ok(self
            .intake
            .lock()
            .records
            .values()
            .filter(|r| r.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    fn reset_range(
        &self,
        from: Timestamp,
        to: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<IntakeId>, StorageError> {
        let mut intake = self.intake.lock();
        let mut reset = Vec::new();
        for record in intake.records.values_mut() {
            let received = record.snapshot.received_at;
            let finished = matches!(
                record.status,
                IntakeStatus::Completed | IntakeStatus::Parked | IntakeStatus::Rejected
            );
            if finished && received >= from && received < to {
                record.status = IntakeStatus::Pending;
                record.attempts = 0;
                record.last_error = None;
                record.evidence = None;
                record.not_before = now;
                record.updated_at = now;
                reset.push(record.intake_id);
            }
        }
        Ok(reset)
    }

    fn purge_completed_before(&self, cutoff: Timestamp) -> Result<usize, StorageError> {
        let mut intake = self.intake.lock();
        let before = intake.records.len();
        intake.retain(|r| !(r.status == IntakeStatus::Completed && r.snapshot.received_at < cutoff));
        Ok(before - intake.records.len())
    }
}

impl CanonicalStore for MemoryStore {
    fn get_by_tag(&self, model_type: &str, tag: &CorrelationTag) -> Result<Vec<CanonicalId>, StorageError> {
        let key = index_key(model_type, tag);
        let shard = self.index[shard_of(&key)].read();
        Ok(shard
            .get(&key)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default())
    }

    fn get_canonical(&self, canonical_id: CanonicalId) -> Result<Option<CanonicalEntity>, StorageError> {
        let Some(live_id) = self.resolve(canonical_id)? else {
            return Ok(None);
        };
        let shard = self.entities[shard_of(&live_id)].read();
        match shard.get(&live_id) {
            Some(EntitySlot::Live(entity)) => Ok(Some(entity.clone())),
            _ => Ok(None),
        }
    }

    fn resolve(&self, canonical_id: CanonicalId) -> Result<Option<CanonicalId>, StorageError> {
        let mut current = canonical_id;
        for _ in 0..MAX_REDIRECT_HOPS {
            let shard = self.entities[shard_of(&current)].read();
            match shard.get(&current) {
                Some(EntitySlot::Live(_)) => return Ok(Some(current)),
                Some(EntitySlot::Redirect(next)) => current = *next,
                None => return Ok(None),
            }
        }
        Err(StorageError::InvalidState(format!(
            "redirect chain from {canonical_id} too long"
        )))
    }

    fn create_canonical(&self, new: &NewCanonical, now: Timestamp) -> Result<CanonicalEntity, StorageError> {
        let canonical_id = CanonicalId::new();
        let keys: Vec<IndexKey> = new.tags.iter().map(|t| index_key(&new.model_type, t)).collect();

        let mut shard = self.entities[shard_of(&canonical_id)].write();
        let mut index = self.lock_index(&keys);
        index.check_unclaimed(&keys, None)?;
        index.claim(keys, canonical_id)?;

        let entity = new.clone().into_entity(canonical_id, now);
        shard.insert(canonical_id, EntitySlot::Live(entity.clone()));
        Ok(entity)
    }

    fn append(
        &self,
        canonical_id: CanonicalId,
        path: &str,
        value: &PropertyValue,
        contribution: &Contribution,
        now: Timestamp,
    ) -> Result<u64, StorageError> {
        let mut shard = self.entities[shard_of(&canonical_id)].write();
        let entity = live_mut(&mut shard, canonical_id)?;
        entity.insert_entry(path, PropertyEntry::new(value.clone(), contribution));
        entity.version += 1;
        entity.updated_at = now;
        Ok(entity.version)
    }

    fn union_tags(
        &self,
        canonical_id: CanonicalId,
        tags: &BTreeSet<CorrelationTag>,
        now: Timestamp,
    ) -> Result<u64, StorageError> {
        let mut shard = self.entities[shard_of(&canonical_id)].write();
        let entity = live_mut(&mut shard, canonical_id)?;
        let keys: Vec<IndexKey> = tags
            .iter()
            .filter(|t| !entity.correlation_keys.contains(*t))
            .map(|t| index_key(&entity.model_type, t))
            .collect();
        if keys.is_empty() {
            return Ok(entity.version);
        }
        let mut index = self.lock_index(&keys);
        index.check_unclaimed(&keys, Some(canonical_id))?;
        index.claim(keys, canonical_id)?;
        entity.correlation_keys.extend(tags.iter().cloned());
        entity.version += 1;
        entity.updated_at = now;
        Ok(entity.version)
    }

    fn apply_contribution(
        &self,
        canonical_id: CanonicalId,
        expected_version: u64,
        update: &ContributionUpdate,
        now: Timestamp,
    ) -> Result<ApplyOutcome, StorageError> {
        let mut shard = self.entities[shard_of(&canonical_id)].write();
        let entity = live_mut(&mut shard, canonical_id)?;
        if entity.has_contribution(&update.contribution) {
            return Ok(ApplyOutcome::AlreadyPresent {
                version: entity.version,
            });
        }
        if entity.version != expected_version {
            return Err(StorageError::VersionConflict {
                canonical_id: canonical_id.to_string(),
                expected: expected_version,
                actual: entity.version,
            });
        }

        let keys: Vec<IndexKey> = update
            .tags
            .iter()
            .filter(|t| !entity.correlation_keys.contains(*t))
            .map(|t| index_key(&entity.model_type, t))
            .collect();
        let mut index = self.lock_index(&keys);
        index.check_unclaimed(&keys, Some(canonical_id))?;
        index.claim(keys, canonical_id)?;

        entity.apply_update(update, now);
        Ok(ApplyOutcome::Applied {
            version: entity.version,
        })
    }

    fn list_canonical(&self, model_type: Option<&str>, page: Page) -> Result<Vec<CanonicalId>, StorageError> {
        let mut ids: Vec<CanonicalId> = Vec::new();
        for shard in &self.entities {
            let shard = shard.read();
            ids.extend(shard.values().filter_map(|slot| match slot {
                EntitySlot::Live(e) if model_type.is_none_or(|m| e.model_type == m) => {
                    Some(e.canonical_id)
                }
                _ => None,
            }));
        }
        ids.sort();
        Ok(ids.into_iter().skip(page.offset).take(page.limit).collect())
    }

    fn merge_canonical(
        &self,
        survivor: CanonicalId,
        absorbed: CanonicalId,
        now: Timestamp,
    ) -> Result<CanonicalEntity, StorageError> {
        if survivor == absorbed {
            return Err(StorageError::InvalidState("cannot merge an entity into itself".into()));
        }
        let (s_shard, a_shard) = (shard_of(&survivor), shard_of(&absorbed));
        let (lo, hi) = (s_shard.min(a_shard), s_shard.max(a_shard));
        let mut lo_guard = self.entities[lo].write();
        let mut hi_guard = (hi != lo).then(|| self.entities[hi].write());

        let survivor_model = live_mut(pick(s_shard, lo, &mut lo_guard, &mut hi_guard), survivor)?
            .model_type
            .clone();
        let absorbed_model = live_mut(pick(a_shard, lo, &mut lo_guard, &mut hi_guard), absorbed)?
            .model_type
            .clone();
        if survivor_model != absorbed_model {
            return Err(StorageError::InvalidState(format!(
                "cannot merge {absorbed_model} entity into {survivor_model} entity"
            )));
        }

        let absorbed_map = pick(a_shard, lo, &mut lo_guard, &mut hi_guard);
        let Some(EntitySlot::Live(gone)) = absorbed_map.insert(absorbed, EntitySlot::Redirect(survivor)) else {
            return Err(StorageError::InvalidState(format!("{absorbed} vanished during merge")));
        };

        let keys: Vec<IndexKey> = gone
            .correlation_keys
            .iter()
            .map(|t| index_key(&gone.model_type, t))
            .collect();
        let mut index = self.lock_index(&keys);
        index.transfer(keys, absorbed, survivor)?;

        let entity = live_mut(pick(s_shard, lo, &mut lo_guard, &mut hi_guard), survivor)?;
        for (path, entries) in gone.properties {
            for entry in entries {
                entity.insert_entry(&path, entry);
            }
        }
        for contribution in gone.contributions {
            if !entity.has_contribution(&contribution) {
                entity.contributions.push(contribution);
            }
        }
        entity.correlation_keys.extend(gone.correlation_keys);
        entity.merged_from.push(absorbed);
        entity.merged_from.extend(gone.merged_from);
        entity.version += 1;
        entity.updated_at = now;
        debug!(survivor = %survivor, absorbed = %absorbed, version = entity.version, "merged canonical entities");
        Ok(entity.clone())
    }

    fn split_canonical(
        &self,
        source: CanonicalId,
        contributors: &[(String, String)],
        now: Timestamp,
    ) -> Result<CanonicalEntity, StorageError> {
        let new_id = CanonicalId::new();
        let (s_shard, n_shard) = (shard_of(&source), shard_of(&new_id));
        let (lo, hi) = (s_shard.min(n_shard), s_shard.max(n_shard));
        let mut lo_guard = self.entities[lo].write();
        let mut hi_guard = (hi != lo).then(|| self.entities[hi].write());

        let entity = live_mut(pick(s_shard, lo, &mut lo_guard, &mut hi_guard), source)?;
        let split = entity.split_off(new_id, contributors, now)?;

        let keys: Vec<IndexKey> = split
            .correlation_keys
            .iter()
            .map(|t| index_key(&split.model_type, t))
            .collect();
        let mut index = self.lock_index(&keys);
        index.transfer(keys, source, new_id)?;

        pick(n_shard, lo, &mut lo_guard, &mut hi_guard).insert(new_id, EntitySlot::Live(split.clone()));
        debug!(source = %source, split = %new_id, moved = split.contributions.len(), "split canonical entity");
        Ok(split)
    }
}

impl ViewStore for MemoryStore {
    fn put_materialized(&self, view: &MaterializedView) -> Result<(), StorageError> {
        let mut views = self.materialized.write();
        match views.get(&view.canonical_id) {
            Some(existing) if existing.version > view.version => {}
            _ => {
                views.insert(view.canonical_id, view.clone());
            }
        }
        Ok(())
    }

    fn get_materialized(&self, canonical_id: CanonicalId) -> Result<Option<MaterializedView>, StorageError> {
        Ok(self.materialized.read().get(&canonical_id).cloned())
    }

    fn put_projection(&self, view: &ProjectionView) -> Result<(), StorageError> {
        self.projections
            .write()
            .insert((view.view_name.clone(), view.canonical_id), view.clone());
        Ok(())
    }

    fn get_projection(
        &self,
        view_name: &str,
        canonical_id: CanonicalId,
    ) -> Result<Option<ProjectionView>, StorageError> {
        Ok(self
            .projections
            .read()
            .get(&(view_name.to_string(), canonical_id))
            .cloned())
    }

    fn list_projections(
        &self,
        view_name: &str,
        model_type: Option<&str>,
    ) -> Result<Vec<ProjectionView>, StorageError> {
        Ok(self
            .projections
            .read()
            .values()
            .filter(|v| v.view_name == view_name)
            .filter(|v| model_type.is_none_or(|m| v.model_type == m))
            .cloned()
            .collect())
    }

    fn delete_views(&self, canonical_id: CanonicalId) -> Result<(), StorageError> {
        self.materialized.write().remove(&canonical_id);
        self.projections.write().retain(|(_, id), _| *id != canonical_id);
        Ok(())
    }
}

impl TaskQueue for MemoryStore {
    fn enqueue_materialization(
        &self,
        canonical_id: CanonicalId,
        version: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError> {
        let mut tasks = self.tasks.lock();
        let key = (canonical_id, version);
        if tasks.queued_keys.contains(&key) || tasks.in_flight.contains(&key) {
            return Ok(false);
        }
        tasks.queued_keys.insert(key);
        tasks.queued.push_back(MaterializationTask {
            canonical_id,
            version,
            enqueued_at: now,
        });
        Ok(true)
    }

    fn dequeue_materialization(&self, batch_size: usize) -> Result<Vec<MaterializationTask>, StorageError> {
        let mut tasks = self.tasks.lock();
        let mut claimed = Vec::new();
        while claimed.len() < batch_size {
            let Some(task) = tasks.queued.pop_front() else {
                break;
            };
            let key = (task.canonical_id, task.version);
            tasks.queued_keys.remove(&key);
            tasks.in_flight.insert(key);
            claimed.push(task);
        }
        Ok(claimed)
    }

    fn complete_materialization(&self, task: &MaterializationTask) -> Result<(), StorageError> {
        self.tasks.lock().in_flight.remove(&(task.canonical_id, task.version));
        Ok(())
    }

    fn release_materialization(&self, task: &MaterializationTask) -> Result<(), StorageError> {
        let mut tasks = self.tasks.lock();
        let key = (task.canonical_id, task.version);
        if tasks.in_flight.remove(&key) && tasks.queued_keys.insert(key) {
            tasks.queued.push_front(*task);
        }
        Ok(())
    }

    fn pending_materializations(&self) -> Result<usize, StorageError> {
        Ok(self.tasks.lock().queued.len())
    }
}
