use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use meridian_core::{CanonicalId, IntakeId, ManualClock, PipelineConfig, PropertyValue, Snapshot, Timestamp};
use meridian_engine::{EngineError, Pipeline, PolicyRegistry, RunSummary};
use meridian_storage::{CanonicalEntity, MemoryStore, Page, SqliteStorage, Store};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Install a test-writer subscriber once. Honors `RUST_LOG`, defaults to `warn`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// A pipeline on a manual clock, backed by memory or a temporary SQLite file.
pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub clock: Arc<ManualClock>,
    dir: Option<TempDir>,
}

impl Deref for TestPipeline {
    type Target = Pipeline;

    fn deref(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl TestPipeline {
    pub const START_MS: i64 = 1_700_000_000_000;

    pub fn memory(config: PipelineConfig) -> Result<Self, EngineError> {
        Self::with_store(Arc::new(MemoryStore::new()), config, PolicyRegistry::new())
    }

    pub fn sqlite(config: PipelineConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let mut fixture = Self::sqlite_at(&dir.path().join("meridian.db"), config)?;
        fixture.dir = Some(dir);
        Ok(fixture)
    }

    /// Open (or reopen) a pipeline on an existing database file.
    pub fn sqlite_at(path: &Path, config: PipelineConfig) -> Result<Self, EngineError> {
        let store = SqliteStorage::open(path)?;
        Self::with_store(Arc::new(store), config, PolicyRegistry::new())
    }

    pub fn with_store(
        store: Arc<dyn Store>,
        config: PipelineConfig,
        policies: PolicyRegistry,
    ) -> Result<Self, EngineError> {
        let clock = Arc::new(ManualClock::new(Timestamp::from_millis(Self::START_MS)));
        let pipeline = Pipeline::builder(store, Arc::new(config))
            .policies(policies)
            .clock(clock.clone())
            .build()?;
        Ok(Self {
            pipeline,
            clock,
            dir: None,
        })
    }

    /// Directory holding the SQLite file, if this fixture owns one.
    pub fn db_dir(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    pub fn submit_all(&self, snapshots: &[Snapshot]) -> Result<Vec<IntakeId>, EngineError> {
        snapshots.iter().map(|s| self.pipeline.submit(s)).collect()
    }

    /// Submit in order, then drain both queues.
    pub fn ingest(&self, snapshots: &[Snapshot]) -> Result<RunSummary, EngineError> {
        self.submit_all(snapshots)?;
        self.pipeline.run_until_idle()
    }

    pub fn entities(&self, model_type: &str) -> Result<Vec<CanonicalEntity>, EngineError> {
        let store = self.pipeline.store();
        let mut entities = Vec::new();
        for id in store.list_canonical(Some(model_type), Page::first(usize::MAX))? {
            if let Some(entity) = store.get_canonical(id)? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// The single live entity of a model; anything else is an error.
    pub fn only_entity(&self, model_type: &str) -> Result<CanonicalEntity, Box<dyn std::error::Error>> {
        let mut entities = self.entities(model_type)?;
        match entities.len() {
            1 => Ok(entities.remove(0)),
            n => Err(format!("expected one {model_type} entity, found {n}").into()),
        }
    }

    pub fn resolved(&self, canonical_id: CanonicalId, path: &str) -> Result<PropertyValue, EngineError> {
        let view = self.pipeline.query().materialized(canonical_id)?;
        Ok(view.values.get(path).cloned().unwrap_or_default())
    }
}
