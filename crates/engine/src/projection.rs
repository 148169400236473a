//! Named consumer views rendered from canonical and materialized state.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value, json};
use tracing::debug;

use meridian_core::{CanonicalId, Timestamp};
use meridian_storage::{CanonicalEntity, MaterializedView, ProjectionView, Store};

use crate::error::EngineError;
use crate::materialize::MaterializationEngine;

pub const CANONICAL_VIEW: &str = "canonical";
pub const LINEAGE_VIEW: &str = "lineage";

/// Renders one named view. Identical input must give identical output.
pub trait ProjectionRenderer: Send + Sync {
    fn name(&self) -> &str;

    fn render(&self, entity: &CanonicalEntity, view: &MaterializedView) -> Result<Value, EngineError>;
}

/// Materialized values as a nested document built from the dotted paths.
#[derive(Debug, Default)]
pub struct CanonicalRenderer;

impl ProjectionRenderer for CanonicalRenderer {
    fn name(&self) -> &str {
        CANONICAL_VIEW
    }

    fn render(&self, _entity: &CanonicalEntity, view: &MaterializedView) -> Result<Value, EngineError> {
        let mut root = Map::new();
        for (path, value) in &view.values {
            insert_nested(&mut root, path, value.to_json());
        }
        Ok(Value::Object(root))
    }
}

/// Place `value` at `path`. A path that runs into an existing scalar is
/// kept verbatim as a top-level key instead.
fn insert_nested(root: &mut Map<String, Value>, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };
    if !fits_nested(root, parents, leaf) {
        root.insert(path.to_string(), value);
        return;
    }

    let mut cursor = root;
    for segment in parents {
        let slot = cursor
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        let Value::Object(map) = slot else {
            return;
        };
        cursor = map;
    }
    cursor.insert(leaf.to_string(), value);
}

fn fits_nested(root: &Map<String, Value>, parents: &[&str], leaf: &str) -> bool {
    let mut cursor = root;
    for segment in parents {
        match cursor.get(*segment) {
            None => return true,
            Some(Value::Object(map)) => cursor = map,
            Some(_) => return false,
        }
    }
    !matches!(cursor.get(leaf), Some(Value::Object(_)))
}

/// Look a dotted path up in a rendered document: nested first, then as a
/// verbatim top-level key.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let nested = path
        .split('.')
        .try_fold(doc, |node, segment| node.as_object()?.get(segment));
    nested.or_else(|| doc.as_object()?.get(path))
}

/// Resolved value, policy and the full attributed array for every path.
#[derive(Debug, Default)]
pub struct LineageRenderer;

impl ProjectionRenderer for LineageRenderer {
    fn name(&self) -> &str {
        LINEAGE_VIEW
    }

    fn render(&self, entity: &CanonicalEntity, view: &MaterializedView) -> Result<Value, EngineError> {
        let mut properties = Map::new();
        for (path, entries) in &entity.properties {
            let values: Vec<Value> = entries
                .iter()
                .map(|e| {
                    json!({
                        "value": e.value.to_json(),
                        "sourceSystem": e.source_system,
                        "nativeId": e.native_id,
                        "receivedAt": e.received_at.to_rfc3339(),
                    })
                })
                .collect();
            properties.insert(
                path.clone(),
                json!({
                    "resolved": view.values.get(path).map(|v| v.to_json()).unwrap_or(Value::Null),
                    "policy": view.policy_applied.get(path),
                    "values": values,
                }),
            );
        }
        let contributions: Vec<Value> = entity
            .contributions
            .iter()
            .map(|c| {
                json!({
                    "sourceSystem": c.source_system,
                    "nativeId": c.native_id,
                    "receivedAt": c.received_at.to_rfc3339(),
                })
            })
            .collect();
        let merged_from: Vec<String> = entity.merged_from.iter().map(|id| id.to_string()).collect();

        Ok(json!({
            "canonicalId": entity.canonical_id.to_string(),
            "modelType": entity.model_type,
            "version": view.version,
            "properties": properties,
            "contributions": contributions,
            "mergedFrom": merged_from,
            "warnings": view.warnings,
        }))
    }
}

pub struct ProjectionBuilder {
    renderers: BTreeMap<String, Arc<dyn ProjectionRenderer>>,
}

impl Default for ProjectionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectionBuilder {
    /// A builder with the `canonical` and `lineage` renderers.
    pub fn new() -> Self {
        let mut builder = Self {
            renderers: BTreeMap::new(),
        };
        builder.register(Arc::new(CanonicalRenderer));
        builder.register(Arc::new(LineageRenderer));
        builder
    }

    /// Add or replace a renderer under its own name.
    pub fn register(&mut self, renderer: Arc<dyn ProjectionRenderer>) {
        self.renderers.insert(renderer.name().to_string(), renderer);
    }

    pub fn view_names(&self) -> Vec<&str> {
        self.renderers.keys().map(String::as_str).collect()
    }

    pub fn has_view(&self, view_name: &str) -> bool {
        self.renderers.contains_key(view_name)
    }

    fn select(&self, views: Option<&[&str]>) -> Result<Vec<Arc<dyn ProjectionRenderer>>, EngineError> {
        match views {
            None => Ok(self.renderers.values().cloned().collect()),
            Some(names) => names
                .iter()
                .map(|name| {
                    self.renderers
                        .get(*name)
                        .cloned()
                        .ok_or_else(|| EngineError::UnknownView(name.to_string()))
                })
                .collect(),
        }
    }

    /// Rebuild the named views (all when `views` is `None`), recomputing
    /// the materialized view first when it is missing or stale.
    pub fn rebuild<S: Store + ?Sized>(
        &self,
        store: &S,
        materializer: &MaterializationEngine,
        canonical_id: CanonicalId,
        views: Option<&[&str]>,
        now: Timestamp,
    ) -> Result<Vec<ProjectionView>, EngineError> {
        let renderers = self.select(views)?;
        let entity = store
            .get_canonical(canonical_id)?
            .ok_or_else(|| EngineError::CanonicalNotFound(canonical_id.to_string()))?;
        let view = match store.get_materialized(entity.canonical_id)? {
            Some(view) if view.version >= entity.version => view,
            _ => {
                let view = materializer.materialize_entity(&entity, now);
                store.put_materialized(&view)?;
                view
            }
        };
        self.render_all(store, &renderers, &entity, &view, now)
    }

    /// Render from an explicit materialized view, bypassing the staleness check.
    pub fn render<S: Store + ?Sized>(
        &self,
        store: &S,
        entity: &CanonicalEntity,
        view: &MaterializedView,
        views: Option<&[&str]>,
        now: Timestamp,
    ) -> Result<Vec<ProjectionView>, EngineError> {
        let renderers = self.select(views)?;
        self.render_all(store, &renderers, entity, view, now)
    }

    fn render_all<S: Store + ?Sized>(
        &self,
        store: &S,
        renderers: &[Arc<dyn ProjectionRenderer>],
        entity: &CanonicalEntity,
        view: &MaterializedView,
        now: Timestamp,
    ) -> Result<Vec<ProjectionView>, EngineError> {
        let mut built = Vec::with_capacity(renderers.len());
        for renderer in renderers {
            let doc = renderer.render(entity, view)?;
            let payload =
                serde_json::to_string(&doc).map_err(|e| EngineError::Render(e.to_string()))?;
            let content_hash: [u8; 32] = blake3::hash(payload.as_bytes()).into();

            let existing = store.get_projection(renderer.name(), entity.canonical_id)?;
            if let Some(existing) = existing.as_ref()
                && existing.content_hash == content_hash
            {
                // Same bytes and version; only mark it as checked against this view.
                if existing.built_at < view.materialized_at {
                    let refreshed = ProjectionView {
                        built_at: now.max(view.materialized_at),
                        ..existing.clone()
                    };
                    store.put_projection(&refreshed)?;
                    built.push(refreshed);
                } else {
                    built.push(existing.clone());
                }
                continue;
            }

            let projection = ProjectionView {
                view_name: renderer.name().to_string(),
                canonical_id: entity.canonical_id,
                model_type: entity.model_type.clone(),
                payload,
                content_hash,
                version: existing.map(|p| p.version + 1).unwrap_or(1),
                built_at: now,
            };
            store.put_projection(&projection)?;
            debug!(
                canonical_id = %entity.canonical_id,
                view = renderer.name(),
                version = projection.version,
                "projection rebuilt"
            );
            built.push(projection);
        }
        Ok(built)
    }
}
