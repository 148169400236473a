use serde_json::Value;

use meridian_core::CanonicalId;
use meridian_storage::{CanonicalEntity, MaterializedView, Page, ProjectionView};

use crate::error::EngineError;
use crate::pipeline::Pipeline;
use crate::projection::{LINEAGE_VIEW, lookup_path};

/// Listing filter: optional model type plus dotted-path equality checks
/// against the rendered payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewFilter {
    pub model_type: Option<String>,
    pub equals: Vec<(String, Value)>,
}

impl ViewFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_type(mut self, model_type: &str) -> Self {
        self.model_type = Some(model_type.to_string());
        self
    }

    pub fn equals(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.equals.push((path.to_string(), value.into()));
        self
    }

    fn matches(&self, doc: &Value) -> bool {
        self.equals
            .iter()
            .all(|(path, expected)| lookup_path(doc, path) == Some(expected))
    }
}

/// Read side of the pipeline. Views are built on demand when missing or
/// older than their entity.
pub struct QueryService<'a> {
    pipeline: &'a Pipeline,
}

impl<'a> QueryService<'a> {
    pub fn new(pipeline: &'a Pipeline) -> Self {
        Self { pipeline }
    }

    fn live_entity(&self, canonical_id: CanonicalId) -> Result<CanonicalEntity, EngineError> {
        let store = self.pipeline.store();
        let root = store
            .resolve(canonical_id)?
            .ok_or_else(|| EngineError::CanonicalNotFound(canonical_id.to_string()))?;
        store
            .get_canonical(root)?
            .ok_or_else(|| EngineError::CanonicalNotFound(root.to_string()))
    }

    /// Materialized values of an entity, following merge redirects.
    pub fn materialized(&self, canonical_id: CanonicalId) -> Result<MaterializedView, EngineError> {
        let entity = self.live_entity(canonical_id)?;
        let store = self.pipeline.store();
        match store.get_materialized(entity.canonical_id)? {
            Some(view) if view.version >= entity.version => Ok(view),
            _ => {
                let view = self
                    .pipeline
                    .materializer()
                    .materialize_entity(&entity, self.pipeline.now()?);
                store.put_materialized(&view)?;
                Ok(view)
            }
        }
    }

    pub fn get_view(&self, view_name: &str, canonical_id: CanonicalId) -> Result<ProjectionView, EngineError> {
        if !self.pipeline.projections().has_view(view_name) {
            return Err(EngineError::UnknownView(view_name.to_string()));
        }
        let entity = self.live_entity(canonical_id)?;
        let store = self.pipeline.store();

        if let Some(projection) = store.get_projection(view_name, entity.canonical_id)?
            && let Some(view) = store.get_materialized(entity.canonical_id)?
            && view.version >= entity.version
            && projection.built_at >= view.materialized_at
        {
            return Ok(projection);
        }

        self.pipeline
            .projections()
            .rebuild(
                store,
                self.pipeline.materializer(),
                entity.canonical_id,
                Some(&[view_name]),
                self.pipeline.now()?,
            )?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::UnknownView(view_name.to_string()))
    }

    /// Stored projections of one view, filtered then paged, ordered by id.
    pub fn list_views(
        &self,
        view_name: &str,
        filter: &ViewFilter,
        page: Page,
    ) -> Result<Vec<ProjectionView>, EngineError> {
        if !self.pipeline.projections().has_view(view_name) {
            return Err(EngineError::UnknownView(view_name.to_string()));
        }
        let candidates = self
            .pipeline
            .store()
            .list_projections(view_name, filter.model_type.as_deref())?;

        let mut matched = Vec::new();
        for projection in candidates {
            if filter.equals.is_empty() || filter.matches(&projection.payload_json()?) {
                matched.push(projection);
            }
        }
        Ok(matched.into_iter().skip(page.offset).take(page.limit).collect())
    }

    /// Every stored value with its source, arrival time and the policy
    /// that resolved it.
    pub fn lineage(&self, canonical_id: CanonicalId) -> Result<Value, EngineError> {
        Ok(self.get_view(LINEAGE_VIEW, canonical_id)?.payload_json()?)
    }
}
