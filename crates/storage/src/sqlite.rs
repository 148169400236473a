use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use tracing::debug;

use meridian_core::{
    CanonicalId, Contribution, CorrelationTag, IntakeId, PropertyValue, Snapshot, Timestamp,
};

use crate::error::StorageError;
use crate::traits::*;

const MAX_REDIRECT_HOPS: usize = 64;

const INTAKE_COLUMNS: &str =
    "intake_id, snapshot, status, attempts, last_error, evidence, not_before, enqueued_at, updated_at";

const PROJECTION_COLUMNS: &str =
    "view_name, canonical_id, model_type, payload, content_hash, version, built_at";

/// Convert Vec<u8> to fixed-size array with proper error handling.
fn to_array<const N: usize>(v: Vec<u8>, label: &str) -> Result<[u8; N], StorageError> {
    v.try_into()
        .map_err(|_| StorageError::Serialization(format!("invalid {label} length")))
}

fn canonical_id_from(v: Vec<u8>) -> Result<CanonicalId, StorageError> {
    Ok(CanonicalId::from_bytes(to_array::<16>(v, "canonical_id")?))
}

/// Carry a `StorageError` out of a rusqlite row closure.
fn tunnel(e: StorageError) -> rusqlite::Error {
    match e {
        StorageError::Sqlite(sq) => sq,
        other => rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Blob,
            Box::new(OpaqueStorageError(other.to_string())),
        ),
    }
}

pub struct SqliteStorage {
    conn: Mutex<Connection>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        crate::schema::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Check the record's current status, then run `sql` in one transaction.
    /// `?1` of `sql` is always the intake id.
    fn transition(
        &self,
        intake_id: IntakeId,
        allowed: &[IntakeStatus],
        sql: &str,
        extra: &[&dyn ToSql],
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id: &[u8] = intake_id.as_bytes();
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM intake WHERE intake_id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        let status = status.ok_or_else(|| StorageError::NotFound(format!("intake {intake_id}")))?;
        check_transition(intake_id, IntakeStatus::parse(&status)?, allowed)?;

        let mut bound: Vec<&dyn ToSql> = vec![&id];
        bound.extend_from_slice(extra);
        tx.execute(sql, bound.as_slice())?;
        tx.commit()?;
        Ok(())
    }
}

fn read_intake(row: &rusqlite::Row) -> Result<IntakeRecord, StorageError> {
    let intake_id_bytes: Vec<u8> = row.get(0)?;
    let snapshot_bytes: Vec<u8> = row.get(1)?;
    let status: String = row.get(2)?;
    let attempts: u32 = row.get(3)?;
    let last_error: Option<String> = row.get(4)?;
    let evidence_bytes: Option<Vec<u8>> = row.get(5)?;

    Ok(IntakeRecord {
        intake_id: IntakeId::from_bytes(to_array::<16>(intake_id_bytes, "intake_id")?),
        snapshot: Snapshot::from_msgpack(&snapshot_bytes)?,
        status: IntakeStatus::parse(&status)?,
        attempts,
        last_error,
        evidence: evidence_bytes
            .map(|b| RejectionEvidence::from_msgpack(&b))
            .transpose()?,
        not_before: Timestamp::from_millis(row.get(6)?),
        enqueued_at: Timestamp::from_millis(row.get(7)?),
        updated_at: Timestamp::from_millis(row.get(8)?),
    })
}

fn get_intake_in(conn: &Connection, intake_id: IntakeId) -> Result<Option<IntakeRecord>, StorageError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {INTAKE_COLUMNS} FROM intake WHERE intake_id = ?1"
    ))?;
    let mut rows = stmt.query_map(params![intake_id.as_bytes().as_slice()], |row| {
        read_intake(row).map_err(tunnel)
    })?;
    match rows.next() {
        Some(Ok(record)) => Ok(Some(record)),
        Some(Err(e)) => Err(StorageError::Sqlite(e)),
        None => Ok(None),
    }
}

fn read_projection(row: &rusqlite::Row) -> Result<ProjectionView, StorageError> {
    let canonical_id_bytes: Vec<u8> = row.get(1)?;
    let hash_bytes: Vec<u8> = row.get(4)?;
    let version: i64 = row.get(5)?;
    Ok(ProjectionView {
        view_name: row.get(0)?,
        canonical_id: canonical_id_from(canonical_id_bytes)?,
        model_type: row.get(2)?,
        payload: row.get(3)?,
        content_hash: to_array::<32>(hash_bytes, "content_hash")?,
        version: version as u64,
        built_at: Timestamp::from_millis(row.get(6)?),
    })
}

struct EntityHead {
    model_type: String,
    version: u64,
    redirect_to: Option<CanonicalId>,
}

fn read_head(conn: &Connection, canonical_id: CanonicalId) -> Result<Option<EntityHead>, StorageError> {
    let row = conn
        .query_row(
            "SELECT model_type, version, redirect_to FROM canonical_entities WHERE canonical_id = ?1",
            params![canonical_id.as_bytes().as_slice()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            },
        )
        .optional()?;
    let Some((model_type, version, redirect)) = row else {
        return Ok(None);
    };
    Ok(Some(EntityHead {
        model_type,
        version: version as u64,
        redirect_to: redirect.map(canonical_id_from).transpose()?,
    }))
}

/// Head of a live entity; merged ids fail with `Redirected`.
fn live_head(conn: &Connection, canonical_id: CanonicalId) -> Result<EntityHead, StorageError> {
    match read_head(conn, canonical_id)? {
        Some(EntityHead {
            redirect_to: Some(survivor),
            ..
        }) => Err(StorageError::Redirected {
            canonical_id: canonical_id.to_string(),
            survivor: survivor.to_string(),
        }),
        Some(head) => Ok(head),
        None => Err(StorageError::NotFound(format!("canonical entity {canonical_id}"))),
    }
}

fn resolve_in(conn: &Connection, canonical_id: CanonicalId) -> Result<Option<CanonicalId>, StorageError> {
    let mut current = canonical_id;
    for _ in 0..MAX_REDIRECT_HOPS {
        match read_head(conn, current)? {
            Some(EntityHead {
                redirect_to: Some(next),
                ..
            }) => current = next,
            Some(_) => return Ok(Some(current)),
            None => return Ok(None),
        }
    }
    Err(StorageError::InvalidState(format!(
        "redirect chain from {canonical_id} too long"
    )))
}

fn load_entity(conn: &Connection, canonical_id: CanonicalId) -> Result<CanonicalEntity, StorageError> {
    let id = canonical_id.as_bytes().as_slice();
    let (model_type, version, merged_blob, created_at, updated_at): (String, i64, Vec<u8>, i64, i64) =
        conn.query_row(
            "SELECT model_type, version, merged_from, created_at, updated_at FROM canonical_entities WHERE canonical_id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
    let merged_from: Vec<CanonicalId> = rmp_serde::from_slice(&merged_blob)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    let mut stmt = conn.prepare("SELECT tag_key FROM correlation_keys WHERE canonical_id = ?1")?;
    let tag_keys = stmt
        .query_map(params![id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let mut correlation_keys = BTreeSet::new();
    for key in tag_keys {
        correlation_keys.insert(CorrelationTag::parse_key(&key)?);
    }

    let mut stmt = conn.prepare(
        "SELECT path, value, source_system, native_id, received_at FROM property_values WHERE canonical_id = ?1 ORDER BY path, received_at, seq",
    )?;
    let rows = stmt
        .query_map(params![id], |row| {
            let value_bytes: Vec<u8> = row.get(1)?;
            let value = PropertyValue::from_msgpack(&value_bytes)
                .map_err(|e| tunnel(StorageError::Core(e)))?;
            Ok((
                row.get::<_, String>(0)?,
                PropertyEntry {
                    value,
                    source_system: row.get(2)?,
                    native_id: row.get(3)?,
                    received_at: Timestamp::from_millis(row.get(4)?),
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    let mut properties: BTreeMap<String, Vec<PropertyEntry>> = BTreeMap::new();
    for (path, entry) in rows {
        properties.entry(path).or_default().push(entry);
    }

    let mut stmt = conn.prepare(
        "SELECT source_system, native_id, received_at FROM contributions WHERE canonical_id = ?1 ORDER BY seq",
    )?;
    let contributions = stmt
        .query_map(params![id], |row| {
            Ok(Contribution {
                source_system: row.get(0)?,
                native_id: row.get(1)?,
                received_at: Timestamp::from_millis(row.get(2)?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CanonicalEntity {
        canonical_id,
        model_type,
        correlation_keys,
        properties,
        contributions,
        merged_from,
        version: version as u64,
        created_at: Timestamp::from_millis(created_at),
        updated_at: Timestamp::from_millis(updated_at),
    })
}

fn insert_value(
    conn: &Connection,
    canonical_id: CanonicalId,
    path: &str,
    value: &PropertyValue,
    contribution: &Contribution,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO property_values (canonical_id, path, received_at, value, source_system, native_id) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            canonical_id.as_bytes().as_slice(),
            path,
            contribution.received_at.as_millis(),
            value.to_msgpack()?,
            contribution.source_system,
            contribution.native_id,
        ],
    )?;
    Ok(())
}

fn insert_contribution(
    conn: &Connection,
    canonical_id: CanonicalId,
    contribution: &Contribution,
) -> Result<(), StorageError> {
    conn.execute(
        "INSERT OR IGNORE INTO contributions (canonical_id, source_system, native_id, received_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            canonical_id.as_bytes().as_slice(),
            contribution.source_system,
            contribution.native_id,
            contribution.received_at.as_millis(),
        ],
    )?;
    Ok(())
}

fn has_contribution(
    conn: &Connection,
    canonical_id: CanonicalId,
    contribution: &Contribution,
) -> Result<bool, StorageError> {
    let hit: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM contributions WHERE canonical_id = ?1 AND source_system = ?2 AND native_id = ?3 AND received_at = ?4",
            params![
                canonical_id.as_bytes().as_slice(),
                contribution.source_system,
                contribution.native_id,
                contribution.received_at.as_millis(),
            ],
            |row| row.get(0),
        )
        .optional()?;
    Ok(hit.is_some())
}

/// Index `tags` for `owner`, failing if another cluster holds any of them.
/// Returns how many tags were newly indexed.
fn claim_tags<'a>(
    conn: &Connection,
    model_type: &str,
    tags: impl IntoIterator<Item = &'a CorrelationTag>,
    owner: CanonicalId,
) -> Result<usize, StorageError> {
    let owner_bytes = owner.as_bytes().as_slice();
    let mut added = 0;
    for tag in tags {
        let key = tag.key();
        let other: Option<Vec<u8>> = conn
            .query_row(
                "SELECT canonical_id FROM correlation_keys WHERE model_type = ?1 AND tag_key = ?2 AND canonical_id != ?3 LIMIT 1",
                params![model_type, key, owner_bytes],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(bytes) = other {
            return Err(StorageError::TagClaimed {
                tag: key,
                owner: canonical_id_from(bytes)?.to_string(),
            });
        }
        added += conn.execute(
            "INSERT OR IGNORE INTO correlation_keys (model_type, tag_key, canonical_id) VALUES (?1, ?2, ?3)",
            params![model_type, key, owner_bytes],
        )?;
    }
    Ok(added)
}

fn bump_version(conn: &Connection, canonical_id: CanonicalId, now: Timestamp) -> Result<u64, StorageError> {
    let version: i64 = conn.query_row(
        "UPDATE canonical_entities SET version = version + 1, updated_at = ?1 WHERE canonical_id = ?2 RETURNING version",
        params![now.as_millis(), canonical_id.as_bytes().as_slice()],
        |row| row.get(0),
    )?;
    Ok(version as u64)
}

fn encode_ids(ids: &[CanonicalId]) -> Result<Vec<u8>, StorageError> {
    rmp_serde::to_vec(ids).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl IntakeStore for SqliteStorage {
    fn enqueue(&self, snapshot: &Snapshot, now: Timestamp) -> Result<IntakeId, StorageError> {
        let intake_id = IntakeId::new();
        self.conn.lock().execute(
            "INSERT INTO intake (intake_id, snapshot, model_type, source_system, native_id, received_at, status, attempts, not_before, enqueued_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8, ?8)",
            params![
                intake_id.as_bytes().as_slice(),
                snapshot.to_msgpack()?,
                snapshot.model_type,
                snapshot.source_system,
                snapshot.native_id,
                snapshot.received_at.as_millis(),
                IntakeStatus::Pending.as_str(),
                now.as_millis(),
            ],
        )?;
        Ok(intake_id)
    }

    fn dequeue(&self, batch_size: usize, now: Timestamp) -> Result<Vec<IntakeRecord>, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "SELECT intake_id FROM intake WHERE status = ?1 AND not_before <= ?2 ORDER BY seq LIMIT ?3",
            )?;
            stmt.query_map(
                params![IntakeStatus::Pending.as_str(), now.as_millis(), batch_size as i64],
                |row| row.get::<_, Vec<u8>>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?
        };

        let mut claimed = Vec::with_capacity(ids.len());
        for bytes in ids {
            let intake_id = IntakeId::from_bytes(to_array::<16>(bytes, "intake_id")?);
            tx.execute(
                "UPDATE intake SET status = ?1, attempts = attempts + 1, updated_at = ?2 WHERE intake_id = ?3",
                params![
                    IntakeStatus::Processing.as_str(),
                    now.as_millis(),
                    intake_id.as_bytes().as_slice(),
                ],
            )?;
            if let Some(record) = get_intake_in(&tx, intake_id)? {
                claimed.push(record);
            }
        }
        tx.commit()?;
        Ok(claimed)
    }

    fn mark_processed(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        self.transition(
            intake_id,
            &[IntakeStatus::Processing, IntakeStatus::Rejected],
            "UPDATE intake SET status = 'completed', updated_at = ?2 WHERE intake_id = ?1",
            params![now.as_millis()],
        )
    }

    fn mark_failed(
        &self,
        intake_id: IntakeId,
        reason: &str,
        retry_at: Timestamp,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        self.transition(
            intake_id,
            &[IntakeStatus::Processing],
            "UPDATE intake SET status = 'pending', last_error = ?2, not_before = ?3, updated_at = ?4 WHERE intake_id = ?1",
            params![reason, retry_at.as_millis(), now.as_millis()],
        )
    }

    fn mark_parked(&self, intake_id: IntakeId, reason: &str, now: Timestamp) -> Result<(), StorageError> {
        self.transition(
            intake_id,
            &[IntakeStatus::Processing, IntakeStatus::Rejected],
            "UPDATE intake SET status = 'parked', last_error = ?2, updated_at = ?3 WHERE intake_id = ?1",
            params![reason, now.as_millis()],
        )
    }

    fn mark_rejected(
        &self,
        intake_id: IntakeId,
        evidence: &RejectionEvidence,
        now: Timestamp,
    ) -> Result<(), StorageError> {
        self.transition(
            intake_id,
            &[IntakeStatus::Processing],
            "UPDATE intake SET status = 'rejected', last_error = ?2, evidence = ?3, updated_at = ?4 WHERE intake_id = ?1",
            params![evidence.reason, evidence.to_msgpack()?, now.as_millis()],
        )
    }

    fn requeue(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        self.transition(
            intake_id,
            &[IntakeStatus::Processing],
            "UPDATE intake SET status = 'pending', attempts = MAX(attempts - 1, 0), updated_at = ?2 WHERE intake_id = ?1",
            params![now.as_millis()],
        )
    }

    fn reset_intake(&self, intake_id: IntakeId, now: Timestamp) -> Result<(), StorageError> {
        self.transition(
            intake_id,
            &[
                IntakeStatus::Pending,
                IntakeStatus::Completed,
                IntakeStatus::Parked,
                IntakeStatus::Rejected,
            ],
            "UPDATE intake SET status = 'pending', attempts = 0, last_error = NULL, evidence = NULL, not_before = ?2, updated_at = ?2 WHERE intake_id = ?1",
            params![now.as_millis()],
        )
    }

    fn get_intake(&self, intake_id: IntakeId) -> Result<Option<IntakeRecord>, StorageError> {
        get_intake_in(&self.conn.lock(), intake_id)
    }

    fn list_intake(&self, status: IntakeStatus, limit: usize) -> Result<Vec<IntakeRecord>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {INTAKE_COLUMNS} FROM intake WHERE status = ?1 ORDER BY seq LIMIT ?2"
        ))?;
        let records = stmt
            .query_map(params![status.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                read_intake(row).map_err(tunnel)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn reset_range(
        &self,
        from: Timestamp,
        to: Timestamp,
        now: Timestamp,
    ) -> Result<Vec<IntakeId>, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare(
                "UPDATE intake SET status = 'pending', attempts = 0, last_error = NULL, evidence = NULL, not_before = ?1, updated_at = ?1
                 WHERE status IN ('completed', 'parked', 'rejected') AND received_at >= ?2 AND received_at < ?3
                 RETURNING intake_id",
            )?;
            stmt.query_map(
                params![now.as_millis(), from.as_millis(), to.as_millis()],
                |row| row.get::<_, Vec<u8>>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;
        let mut reset = ids
            .into_iter()
            .map(|b| to_array::<16>(b, "intake_id").map(IntakeId::from_bytes))
            .collect::<Result<Vec<_>, _>>()?;
        reset.sort();
        Ok(reset)
    }

    fn purge_completed_before(&self, cutoff: Timestamp) -> Result<usize, StorageError> {
        let removed = self.conn.lock().execute(
            "DELETE FROM intake WHERE status = 'completed' AND received_at < ?1",
            params![cutoff.as_millis()],
        )?;
        Ok(removed)
    }
}

impl CanonicalStore for SqliteStorage {
    fn get_by_tag(&self, model_type: &str, tag: &CorrelationTag) -> Result<Vec<CanonicalId>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT canonical_id FROM correlation_keys WHERE model_type = ?1 AND tag_key = ?2 ORDER BY canonical_id",
        )?;
        let ids = stmt
            .query_map(params![model_type, tag.key()], |row| row.get::<_, Vec<u8>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter().map(canonical_id_from).collect()
    }

    fn get_canonical(&self, canonical_id: CanonicalId) -> Result<Option<CanonicalEntity>, StorageError> {
        let conn = self.conn.lock();
        match resolve_in(&conn, canonical_id)? {
            Some(live) => Ok(Some(load_entity(&conn, live)?)),
            None => Ok(None),
        }
    }

    fn resolve(&self, canonical_id: CanonicalId) -> Result<Option<CanonicalId>, StorageError> {
        resolve_in(&self.conn.lock(), canonical_id)
    }

    fn create_canonical(&self, new: &NewCanonical, now: Timestamp) -> Result<CanonicalEntity, StorageError> {
        let canonical_id = CanonicalId::new();
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO canonical_entities (canonical_id, model_type, version, merged_from, created_at, updated_at) VALUES (?1, ?2, 1, ?3, ?4, ?4)",
            params![
                canonical_id.as_bytes().as_slice(),
                new.model_type,
                encode_ids(&[])?,
                now.as_millis(),
            ],
        )?;
        claim_tags(&tx, &new.model_type, &new.tags, canonical_id)?;
        for (path, value) in &new.properties {
            insert_value(&tx, canonical_id, path, value, &new.contribution)?;
        }
        insert_contribution(&tx, canonical_id, &new.contribution)?;
        let entity = load_entity(&tx, canonical_id)?;
        tx.commit()?;
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
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        live_head(&tx, canonical_id)?;
        insert_value(&tx, canonical_id, path, value, contribution)?;
        let version = bump_version(&tx, canonical_id, now)?;
        tx.commit()?;
        Ok(version)
    }

    fn union_tags(
        &self,
        canonical_id: CanonicalId,
        tags: &BTreeSet<CorrelationTag>,
        now: Timestamp,
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let head = live_head(&tx, canonical_id)?;
        let version = if claim_tags(&tx, &head.model_type, tags, canonical_id)? > 0 {
            bump_version(&tx, canonical_id, now)?
        } else {
            head.version
        };
        tx.commit()?;
        Ok(version)
    }

    fn apply_contribution(
        &self,
        canonical_id: CanonicalId,
        expected_version: u64,
        update: &ContributionUpdate,
        now: Timestamp,
    ) -> Result<ApplyOutcome, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let head = live_head(&tx, canonical_id)?;
        if has_contribution(&tx, canonical_id, &update.contribution)? {
            return Ok(ApplyOutcome::AlreadyPresent {
                version: head.version,
            });
        }
        if head.version != expected_version {
            return Err(StorageError::VersionConflict {
                canonical_id: canonical_id.to_string(),
                expected: expected_version,
                actual: head.version,
            });
        }

        claim_tags(&tx, &head.model_type, &update.tags, canonical_id)?;
        for (path, value) in &update.properties {
            insert_value(&tx, canonical_id, path, value, &update.contribution)?;
        }
        insert_contribution(&tx, canonical_id, &update.contribution)?;
        let version = bump_version(&tx, canonical_id, now)?;
        tx.commit()?;
        Ok(ApplyOutcome::Applied { version })
    }

    fn list_canonical(&self, model_type: Option<&str>, page: Page) -> Result<Vec<CanonicalId>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT canonical_id FROM canonical_entities
             WHERE redirect_to IS NULL AND (?1 IS NULL OR model_type = ?1)
             ORDER BY canonical_id LIMIT ?2 OFFSET ?3",
        )?;
        let limit = i64::try_from(page.limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(page.offset).unwrap_or(i64::MAX);
        let ids = stmt
            .query_map(params![model_type, limit, offset], |row| {
                row.get::<_, Vec<u8>>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        ids.into_iter().map(canonical_id_from).collect()
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
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let kept = live_head(&tx, survivor)?;
        let gone = live_head(&tx, absorbed)?;
        if kept.model_type != gone.model_type {
            return Err(StorageError::InvalidState(format!(
                "cannot merge {} entity into {} entity",
                gone.model_type, kept.model_type
            )));
        }

        let s = survivor.as_bytes().as_slice();
        let a = absorbed.as_bytes().as_slice();
        // Re-inserting gives absorbed values fresh sequence numbers, so they
        // sort after survivor values with the same timestamp.
        tx.execute(
            "INSERT INTO property_values (canonical_id, path, received_at, value, source_system, native_id)
             SELECT ?1, path, received_at, value, source_system, native_id
             FROM property_values WHERE canonical_id = ?2 ORDER BY seq",
            params![s, a],
        )?;
        tx.execute("DELETE FROM property_values WHERE canonical_id = ?1", params![a])?;
        tx.execute(
            "INSERT OR IGNORE INTO contributions (canonical_id, source_system, native_id, received_at)
             SELECT ?1, source_system, native_id, received_at
             FROM contributions WHERE canonical_id = ?2 ORDER BY seq",
            params![s, a],
        )?;
        tx.execute("DELETE FROM contributions WHERE canonical_id = ?1", params![a])?;
        tx.execute(
            "INSERT OR IGNORE INTO correlation_keys (model_type, tag_key, canonical_id)
             SELECT model_type, tag_key, ?1 FROM correlation_keys WHERE canonical_id = ?2",
            params![s, a],
        )?;
        tx.execute("DELETE FROM correlation_keys WHERE canonical_id = ?1", params![a])?;

        let absorbed_entity = load_entity(&tx, absorbed)?;
        let mut merged_from = load_entity(&tx, survivor)?.merged_from;
        merged_from.push(absorbed);
        merged_from.extend(absorbed_entity.merged_from);
        tx.execute(
            "UPDATE canonical_entities SET merged_from = ?1 WHERE canonical_id = ?2",
            params![encode_ids(&merged_from)?, s],
        )?;
        tx.execute(
            "UPDATE canonical_entities SET redirect_to = ?1, updated_at = ?2 WHERE canonical_id = ?3",
            params![s, now.as_millis(), a],
        )?;
        let version = bump_version(&tx, survivor, now)?;
        let entity = load_entity(&tx, survivor)?;
        tx.commit()?;
        debug!(survivor = %survivor, absorbed = %absorbed, version, "merged canonical entities");
        Ok(entity)
    }

    fn split_canonical(
        &self,
        source: CanonicalId,
        contributors: &[(String, String)],
        now: Timestamp,
    ) -> Result<CanonicalEntity, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        live_head(&tx, source)?;
        let mut remaining = load_entity(&tx, source)?;
        let new_id = CanonicalId::new();
        let split = remaining.split_off(new_id, contributors, now)?;

        let n = new_id.as_bytes().as_slice();
        let s = source.as_bytes().as_slice();
        tx.execute(
            "INSERT INTO canonical_entities (canonical_id, model_type, version, merged_from, created_at, updated_at) VALUES (?1, ?2, 1, ?3, ?4, ?4)",
            params![n, split.model_type, encode_ids(&[])?, now.as_millis()],
        )?;
        for contribution in &split.contributions {
            for table in ["property_values", "contributions"] {
                tx.execute(
                    &format!(
                        "UPDATE {table} SET canonical_id = ?1 WHERE canonical_id = ?2 AND source_system = ?3 AND native_id = ?4"
                    ),
                    params![n, s, contribution.source_system, contribution.native_id],
                )?;
            }
        }
        for tag in &split.correlation_keys {
            tx.execute(
                "UPDATE correlation_keys SET canonical_id = ?1 WHERE canonical_id = ?2 AND model_type = ?3 AND tag_key = ?4",
                params![n, s, split.model_type, tag.key()],
            )?;
        }
        bump_version(&tx, source, now)?;
        let entity = load_entity(&tx, new_id)?;
        tx.commit()?;
        debug!(source = %source, split = %new_id, moved = entity.contributions.len(), "split canonical entity");
        Ok(entity)
    }
}

impl ViewStore for SqliteStorage {
    fn put_materialized(&self, view: &MaterializedView) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT INTO materialized_views (canonical_id, model_type, version, view) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (canonical_id) DO UPDATE SET model_type = excluded.model_type, version = excluded.version, view = excluded.view
             WHERE excluded.version >= materialized_views.version",
            params![
                view.canonical_id.as_bytes().as_slice(),
                view.model_type,
                view.version as i64,
                view.to_msgpack()?,
            ],
        )?;
        Ok(())
    }

    fn get_materialized(&self, canonical_id: CanonicalId) -> Result<Option<MaterializedView>, StorageError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT view FROM materialized_views WHERE canonical_id = ?1",
                params![canonical_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        blob.map(|b| MaterializedView::from_msgpack(&b)).transpose()
    }

    fn put_projection(&self, view: &ProjectionView) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO projections (view_name, canonical_id, model_type, payload, content_hash, version, built_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                view.view_name,
                view.canonical_id.as_bytes().as_slice(),
                view.model_type,
                view.payload,
                view.content_hash.as_slice(),
                view.version as i64,
                view.built_at.as_millis(),
            ],
        )?;
        Ok(())
    }

    fn get_projection(
        &self,
        view_name: &str,
        canonical_id: CanonicalId,
    ) -> Result<Option<ProjectionView>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECTION_COLUMNS} FROM projections WHERE view_name = ?1 AND canonical_id = ?2"
        ))?;
        let mut rows = stmt.query_map(
            params![view_name, canonical_id.as_bytes().as_slice()],
            |row| read_projection(row).map_err(tunnel),
        )?;
        match rows.next() {
            Some(Ok(view)) => Ok(Some(view)),
            Some(Err(e)) => Err(StorageError::Sqlite(e)),
            None => Ok(None),
        }
    }

    fn list_projections(
        &self,
        view_name: &str,
        model_type: Option<&str>,
    ) -> Result<Vec<ProjectionView>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PROJECTION_COLUMNS} FROM projections
             WHERE view_name = ?1 AND (?2 IS NULL OR model_type = ?2)
             ORDER BY canonical_id"
        ))?;
        let views = stmt
            .query_map(params![view_name, model_type], |row| {
                read_projection(row).map_err(tunnel)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(views)
    }

    fn delete_views(&self, canonical_id: CanonicalId) -> Result<(), StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let id = canonical_id.as_bytes().as_slice();
        tx.execute("DELETE FROM materialized_views WHERE canonical_id = ?1", params![id])?;
        tx.execute("DELETE FROM projections WHERE canonical_id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

impl TaskQueue for SqliteStorage {
    fn enqueue_materialization(
        &self,
        canonical_id: CanonicalId,
        version: u64,
        now: Timestamp,
    ) -> Result<bool, StorageError> {
        let inserted = self.conn.lock().execute(
            "INSERT OR IGNORE INTO materialization_tasks (canonical_id, version, enqueued_at) VALUES (?1, ?2, ?3)",
            params![
                canonical_id.as_bytes().as_slice(),
                version as i64,
                now.as_millis()
            ],
        )?;
        Ok(inserted > 0)
    }

    fn dequeue_materialization(&self, batch_size: usize) -> Result<Vec<MaterializationTask>, StorageError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let rows = {
            let mut stmt = tx.prepare(
                "UPDATE materialization_tasks SET in_flight = 1
                 WHERE seq IN (SELECT seq FROM materialization_tasks WHERE in_flight = 0 ORDER BY seq LIMIT ?1)
                 RETURNING seq, canonical_id, version, enqueued_at",
            )?;
            stmt.query_map(params![batch_size as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
        };
        tx.commit()?;

        let mut rows = rows;
        rows.sort_by_key(|(seq, ..)| *seq);
        rows.into_iter()
            .map(|(_, id, version, enqueued_at)| {
                Ok(MaterializationTask {
                    canonical_id: canonical_id_from(id)?,
                    version: version as u64,
                    enqueued_at: Timestamp::from_millis(enqueued_at),
                })
            })
            .collect()
    }

    fn complete_materialization(&self, task: &MaterializationTask) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "DELETE FROM materialization_tasks WHERE canonical_id = ?1 AND version = ?2 AND in_flight = 1",
            params![task.canonical_id.as_bytes().as_slice(), task.version as i64],
        )?;
        Ok(())
    }

    fn release_materialization(&self, task: &MaterializationTask) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "UPDATE materialization_tasks SET in_flight = 0 WHERE canonical_id = ?1 AND version = ?2",
            params![task.canonical_id.as_bytes().as_slice(), task.version as i64],
        )?;
        Ok(())
    }

    fn pending_materializations(&self) -> Result<usize, StorageError> {
        let count: i64 = self.conn.lock().query_row(
            "SELECT COUNT(*) FROM materialization_tasks WHERE in_flight = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

#[derive(Debug)]
struct OpaqueStorageError(String);

impl std::fmt::Display for OpaqueStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OpaqueStorageError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn contribution(source: &str, native: &str, at: i64) -> Contribution {
        Contribution {
            source_system: source.into(),
            native_id: native.into(),
            received_at: Timestamp::from_millis(at),
        }
    }

    fn seed(source: &str, native: &str, serial: &str, at: i64) -> NewCanonical {
        NewCanonical {
            model_type: "Device".into(),
            tags: [
                CorrelationTag::synthetic(source, native),
                CorrelationTag::direct("Serial", serial),
            ]
            .into_iter()
            .collect(),
            contribution: contribution(source, native, at),
            properties: vec![
                ("Serial".into(), serial.into()),
                ("specifications.power.voltage".into(), PropertyValue::Integer(230)),
            ],
        }
    }

    fn now() -> Timestamp {
        Timestamp::from_millis(1_000)
    }

    #[test]
    fn canonical_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteStorage::open_in_memory()?;
        let created = store.create_canonical(&seed("bms", "d1", "SN1", 10), now())?;
        let loaded = store.get_canonical(created.canonical_id)?.ok_or("missing")?;
        assert_eq!(loaded, created);
        assert_eq!(loaded.version, 1);
        assert_eq!(
            store.get_by_tag("Device", &CorrelationTag::direct("Serial", "SN1"))?,
            vec![created.canonical_id]
        );

        let err = store.create_canonical(&seed("oem", "o1", "SN1", 11), now()).unwrap_err();
        assert!(matches!(err, StorageError::TagClaimed { .. }));
        assert_eq!(store.list_canonical(Some("Device"), Page::first(10))?.len(), 1);
        Ok(())
    }

    #[test]
    fn apply_contribution_checks_version() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteStorage::open_in_memory()?;
        let created = store.create_canonical(&seed("bms", "d1", "SN1", 10), now())?;
        let update = ContributionUpdate {
            tags: [CorrelationTag::synthetic("oem", "o1")].into_iter().collect(),
            contribution: contribution("oem", "o1", 10),
            properties: vec![("Serial".into(), "SN1".into())],
        };
        let outcome = store.apply_contribution(created.canonical_id, 1, &update, now())?;
        assert_eq!(outcome, ApplyOutcome::Applied { version: 2 });
        let again = store.apply_contribution(created.canonical_id, 1, &update, now())?;
        assert_eq!(again, ApplyOutcome::AlreadyPresent { version: 2 });

        let loaded = store.get_canonical(created.canonical_id)?.ok_or("missing")?;
        let serial = loaded.property("Serial").ok_or("no serial")?;
        // Equal timestamps keep arrival order.
        assert_eq!(serial[0].source_system, "bms");
        assert_eq!(serial[1].source_system, "oem");
        Ok(())
    }

    #[test]
    fn merge_and_split() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteStorage::open_in_memory()?;
        let a = store.create_canonical(&seed("bms", "d1", "SN1", 10), now())?;
        let b = store.create_canonical(&seed("oem", "o1", "SN2", 20), now())?;

        let merged = store.merge_canonical(a.canonical_id, b.canonical_id, now())?;
        assert_eq!(merged.contributions.len(), 2);
        assert_eq!(merged.merged_from, vec![b.canonical_id]);
        assert_eq!(store.resolve(b.canonical_id)?, Some(a.canonical_id));
        let err = store
            .apply_contribution(
                b.canonical_id,
                1,
                &ContributionUpdate {
                    tags: BTreeSet::new(),
                    contribution: contribution("x", "y", 1),
                    properties: Vec::new(),
                },
                now(),
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::Redirected { .. }));

        let split = store.split_canonical(a.canonical_id, &[("oem".into(), "o1".into())], now())?;
        assert_eq!(split.contributions, vec![contribution("oem", "o1", 20)]);
        assert_eq!(
            store.get_by_tag("Device", &CorrelationTag::synthetic("oem", "o1"))?,
            vec![split.canonical_id]
        );
        let source = store.get_canonical(a.canonical_id)?.ok_or("missing")?;
        assert_eq!(source.contributions, vec![contribution("bms", "d1", 10)]);
        assert_eq!(source.version, merged.version + 1);
        Ok(())
    }

    #[test]
    fn intake_state_machine() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteStorage::open_in_memory()?;
        let snapshot = Snapshot::new("Device", "bms", "d1", Timestamp::from_millis(10))
            .with_property("Serial", "SN1");
        let first = store.enqueue(&snapshot, now())?;
        let second = store.enqueue(&snapshot, now())?;

        let batch = store.dequeue(1, now())?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].intake_id, first);
        assert_eq!(batch[0].snapshot, snapshot);

        let evidence = RejectionEvidence {
            reason: "ambiguous".into(),
            tags: vec![CorrelationTag::direct("Serial", "SN1")],
            matches: Vec::new(),
        };
        store.mark_rejected(first, &evidence, now())?;
        let rejected = store.list_intake(IntakeStatus::Rejected, 10)?;
        assert_eq!(rejected[0].evidence.as_ref(), Some(&evidence));

        store.requeue(store.dequeue(5, now())?[0].intake_id, now())?;
        let record = store.get_intake(second)?.ok_or("missing")?;
        assert_eq!(record.status, IntakeStatus::Pending);
        assert_eq!(record.attempts, 0);

        assert!(store.mark_processed(second, now()).is_err());
        assert_eq!(
            store.reset_range(Timestamp::from_millis(0), Timestamp::from_millis(11), now())?,
            vec![first]
        );
        Ok(())
    }

    #[test]
    fn views_and_tasks() -> Result<(), Box<dyn std::error::Error>> {
        let store = SqliteStorage::open_in_memory()?;
        let id = CanonicalId::new();
        let view = |version: u64| MaterializedView {
            canonical_id: id,
            model_type: "Device".into(),
            values: BTreeMap::from([("Serial".to_string(), PropertyValue::from("SN1"))]),
            policy_applied: BTreeMap::from([("Serial".to_string(), "last".to_string())]),
            warnings: Vec::new(),
            materialized_at: now(),
            version,
        };
        store.put_materialized(&view(3))?;
        store.put_materialized(&view(2))?;
        assert_eq!(store.get_materialized(id)?.ok_or("missing")?.version, 3);

        assert!(store.enqueue_materialization(id, 3, now())?);
        assert!(!store.enqueue_materialization(id, 3, now())?);
        let tasks = store.dequeue_materialization(10)?;
        assert_eq!(tasks.len(), 1);
        assert_eq!(store.pending_materializations()?, 0);
        store.release_materialization(&tasks[0])?;
        assert_eq!(store.pending_materializations()?, 1);
        let tasks = store.dequeue_materialization(10)?;
        store.complete_materialization(&tasks[0])?;
        assert!(store.enqueue_materialization(id, 3, now())?);
        Ok(())
    }

    #[test]
    fn reopens_from_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("meridian.db");
        let created = {
            let store = SqliteStorage::open(&path)?;
            store.create_canonical(&seed("bms", "d1", "SN1", 10), now())?
        };
        let store = SqliteStorage::open(&path)?;
        assert_eq!(store.get_canonical(created.canonical_id)?, Some(created));
        Ok(())
    }
}
