//! Policy-driven resolution of canonical property arrays.
//!
//! Precedence is resolved once per model when the engine is built:
//! record transformer, then per-path policy, then the model default, then
//! the global default. Nothing in here fails the pipeline; policy problems
//! fall back and become warnings on the view.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use meridian_core::{CanonicalId, PipelineConfig, PropertyValue, Timestamp};
use meridian_storage::{CanonicalEntity, CanonicalStore, MaterializedView, ViewStore};
use tracing::warn;

use crate::error::EngineError;
use crate::policy::{BuiltinPolicy, PathInput, PolicyRegistry, PropertyTransformer, RecordTransformer};

#[derive(Clone)]
struct PolicyRef {
    name: String,
    transformer: Arc<dyn PropertyTransformer>,
    /// Set when the configured name was unknown and `last` stands in.
    fallback_note: Option<String>,
}

impl PolicyRef {
    fn lookup(registry: &PolicyRegistry, name: &str, scope: &str) -> Self {
        if let Some(transformer) = registry.property(name) {
            return Self {
                name: name.to_string(),
                transformer,
                fallback_note: None,
            };
        }
        let note = format!("unknown policy {name:?} for {scope}; using last");
        warn!(policy = name, scope, "unknown policy, falling back to last");
        Self {
            name: BuiltinPolicy::Last.name().to_string(),
            transformer: Arc::new(BuiltinPolicy::Last),
            fallback_note: Some(note),
        }
    }
}

#[derive(Clone)]
struct ModelPlan {
    record: Option<(String, Arc<dyn RecordTransformer>)>,
    paths: BTreeMap<String, PolicyRef>,
    default: PolicyRef,
    notes: Vec<String>,
}

pub struct MaterializationEngine {
    plans: HashMap<String, ModelPlan>,
    global: ModelPlan,
}

impl MaterializationEngine {
    pub fn new(config: &PipelineConfig, registry: &PolicyRegistry) -> Self {
        let global_default = PolicyRef::lookup(registry, &config.global_policy, "global default");
        let global = ModelPlan {
            record: None,
            paths: BTreeMap::new(),
            notes: global_default.fallback_note.iter().cloned().collect(),
            default: global_default.clone(),
        };

        let mut plans = HashMap::new();
        for (model_type, model) in &config.models {
            let default = match &model.default_policy {
                Some(name) => PolicyRef::lookup(registry, name, &format!("model {model_type}")),
                None => global_default.clone(),
            };
            let mut notes: Vec<String> = default.fallback_note.iter().cloned().collect();

            let mut paths = BTreeMap::new();
            for (path, name) in &model.path_policies {
                let policy = PolicyRef::lookup(registry, name, &format!("{model_type}.{path}"));
                notes.extend(policy.fallback_note.iter().cloned());
                paths.insert(path.clone(), policy);
            }

            let record = match &model.record_transformer {
                Some(name) => match registry.record(name) {
                    Some(transformer) => {
                        if !model.path_policies.is_empty() || model.default_policy.is_some() {
                            warn!(
                                model_type = model_type.as_str(),
                                transformer = name.as_str(),
                                "record transformer overrides per-path and per-model policies"
                            );
                        }
                        Some((name.clone(), transformer))
                    }
                    None => {
                        warn!(
                            model_type = model_type.as_str(),
                            transformer = name.as_str(),
                            "unknown record transformer, using per-path policies"
                        );
                        notes.push(format!(
                            "unknown record transformer {name:?}; using per-path policies"
                        ));
                        None
                    }
                },
                None => None,
            };

            plans.insert(
                model_type.clone(),
                ModelPlan {
                    record,
                    paths,
                    default,
                    notes,
                },
            );
        }

        Self { plans, global }
    }

    fn plan(&self, model_type: &str) -> &ModelPlan {
        self.plans.get(model_type).unwrap_or(&self.global)
    }

    /// Name of the policy that would resolve `path` of `model_type`.
    pub fn policy_for(&self, model_type: &str, path: &str) -> &str {
        let plan = self.plan(model_type);
        if let Some((name, _)) = &plan.record {
            return name;
        }
        plan.paths.get(path).unwrap_or(&plan.default).name.as_str()
    }

    /// Pure core: resolve every path of `entity`.
    pub fn materialize_entity(&self, entity: &CanonicalEntity, now: Timestamp) -> MaterializedView {
        let plan = self.plan(&entity.model_type);
        let mut warnings = plan.notes.clone();

        if let Some((name, transformer)) = &plan.record {
            match transformer.resolve(entity) {
                Ok(resolution) => {
                    return MaterializedView {
                        canonical_id: entity.canonical_id,
                        model_type: entity.model_type.clone(),
                        values: resolution.values,
                        policy_applied: resolution.policies,
                        warnings,
                        materialized_at: now,
                        version: entity.version,
                    };
                }
                Err(mismatch) => {
                    warn!(
                        canonical_id = %entity.canonical_id,
                        transformer = name.as_str(),
                        %mismatch,
                        "record transformer failed, using per-path policies"
                    );
                    warnings.push(format!("record transformer {name:?} failed: {mismatch}"));
                }
            }
        }

        let mut values = BTreeMap::new();
        let mut policy_applied = BTreeMap::new();
        for (path, entries) in &entity.properties {
            let policy = plan.paths.get(path).unwrap_or(&plan.default);
            let input = PathInput {
                model_type: &entity.model_type,
                path,
                values: entries,
                properties: &entity.properties,
            };
            match policy.transformer.resolve(&input) {
                Ok(resolved) => {
                    values.insert(path.clone(), resolved.value);
                    policy_applied.insert(path.clone(), resolved.policy);
                }
                Err(mismatch) => {
                    warn!(
                        canonical_id = %entity.canonical_id,
                        path = path.as_str(),
                        policy = policy.name.as_str(),
                        %mismatch,
                        "policy not applicable, path resolved to null"
                    );
                    warnings.push(format!("{path}: {} not applicable: {mismatch}", policy.name));
                    values.insert(path.clone(), PropertyValue::Null);
                    policy_applied.insert(path.clone(), policy.name.clone());
                }
            }
        }

        MaterializedView {
            canonical_id: entity.canonical_id,
            model_type: entity.model_type.clone(),
            values,
            policy_applied,
            warnings,
            materialized_at: now,
            version: entity.version,
        }
    }

    /// Recompute and store the view of `canonical_id` (following merges).
    pub fn materialize<S>(
        &self,
        store: &S,
        canonical_id: CanonicalId,
        now: Timestamp,
    ) -> Result<MaterializedView, EngineError>
    where
        S: CanonicalStore + ViewStore + ?Sized,
    {
        let entity = store
            .get_canonical(canonical_id)?
            .ok_or_else(|| EngineError::CanonicalNotFound(canonical_id.to_string()))?;
        let view = self.materialize_entity(&entity, now);
        store.put_materialized(&view)?;
        Ok(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    use meridian_core::{Contribution, ModelPolicies};
    use meridian_storage::{MemoryStore, PropertyEntry};

    use crate::policy::{PolicyMismatch, RecordResolution, Resolved};

    fn entity(model_type: &str, rows: &[(&str, &str, i64, PropertyValue)]) -> CanonicalEntity {
        let mut entity = CanonicalEntity {
            canonical_id: CanonicalId::new(),
            model_type: model_type.into(),
            correlation_keys: BTreeSet::new(),
            properties: BTreeMap::new(),
            contributions: Vec::new(),
            merged_from: Vec::new(),
            version: 3,
            created_at: Timestamp::from_millis(0),
            updated_at: Timestamp::from_millis(0),
        };
        for (path, source, at, value) in rows {
            let contribution = Contribution {
                source_system: source.to_string(),
                native_id: "n".into(),
                received_at: Timestamp::from_millis(*at),
            };
            entity.insert_entry(path, PropertyEntry::new(value.clone(), &contribution));
        }
        entity
    }

    fn config(policies: ModelPolicies) -> PipelineConfig {
        PipelineConfig::builder()
            .register_model("Device", ["Serial"], policies)
            .build()
            .unwrap()
    }

    #[test]
    fn precedence_path_over_model_over_global() {
        let engine = MaterializationEngine::new(
            &config(ModelPolicies::new().default_policy("first").path("Model", "last")),
            &PolicyRegistry::new(),
        );
        let e = entity(
            "Device",
            &[
                ("Model", "bms", 1, "X".into()),
                ("Model", "oem", 2, "X-Pro".into()),
                ("Site", "bms", 1, "A".into()),
                ("Site", "oem", 2, "B".into()),
            ],
        );
        let view = engine.materialize_entity(&e, Timestamp::from_millis(9));
        assert_eq!(view.values["Model"], PropertyValue::from("X-Pro"));
        assert_eq!(view.values["Site"], PropertyValue::from("A"));
        assert_eq!(view.policy_applied["Site"], "first");
        assert_eq!(view.version, 3);

        let other = entity("Sensor", &[("Site", "bms", 1, "A".into()), ("Site", "oem", 2, "B".into())]);
        let view = engine.materialize_entity(&other, Timestamp::from_millis(9));
        assert_eq!(view.values["Site"], PropertyValue::from("B"));
        assert_eq!(engine.policy_for("Sensor", "Site"), "last");
    }

    #[test]
    fn record_transformer_beats_path_policy() {
        let mut registry = PolicyRegistry::new();
        registry.register_record("upper", |entity: &CanonicalEntity| -> Result<RecordResolution, PolicyMismatch> {
            let mut resolution = RecordResolution::default();
            for (path, entries) in &entity.properties {
                let joined: Vec<String> = entries.iter().map(|e| e.value.to_string()).collect();
                resolution.values.insert(path.clone(), joined.join("|").to_uppercase().into());
                resolution.policies.insert(path.clone(), "upper".into());
            }
            Ok::<_, PolicyMismatch>(resolution)
        });
        let engine = MaterializationEngine::new(
            &config(ModelPolicies::new().path("Model", "first").record_transformer("upper")),
            &registry,
        );
        let e = entity("Device", &[("Model", "bms", 1, "x".into()), ("Model", "oem", 2, "y".into())]);
        let view = engine.materialize_entity(&e, Timestamp::from_millis(9));
        assert_eq!(view.values["Model"], PropertyValue::from("X|Y"));
        assert_eq!(view.policy_applied["Model"], "upper");
        assert_eq!(engine.policy_for("Device", "Model"), "upper");
    }

    #[test]
    fn unknown_policy_falls_back_to_last_with_warning() {
        let engine = MaterializationEngine::new(
            &config(ModelPolicies::new().path("Model", "median")),
            &PolicyRegistry::new(),
        );
        let e = entity("Device", &[("Model", "bms", 1, "X".into()), ("Model", "oem", 2, "Y".into())]);
        let view = engine.materialize_entity(&e, Timestamp::from_millis(9));
        assert_eq!(view.values["Model"], PropertyValue::from("Y"));
        assert_eq!(view.policy_applied["Model"], "last");
        assert!(view.warnings.iter().any(|w| w.contains("median")));
    }

    #[test]
    fn type_mismatch_yields_null_not_failure() {
        let engine = MaterializationEngine::new(
            &config(ModelPolicies::new().path("Model", "max")),
            &PolicyRegistry::new(),
        );
        let e = entity("Device", &[("Model", "bms", 1, "X".into()), ("Serial", "bms", 1, "SN".into())]);
        let view = engine.materialize_entity(&e, Timestamp::from_millis(9));
        assert_eq!(view.values["Model"], PropertyValue::Null);
        assert_eq!(view.values["Serial"], PropertyValue::from("SN"));
        assert_eq!(view.warnings.len(), 1);
    }

    #[test]
    fn custom_property_transformer_by_name() {
        let mut registry = PolicyRegistry::new();
        registry.register_property("count", |input: &PathInput<'_>| -> Result<Resolved, PolicyMismatch> {
            Ok(Resolved {
                value: PropertyValue::Integer(input.values.len() as i64),
                policy: "count".into(),
            })
        });
        let engine = MaterializationEngine::new(
            &config(ModelPolicies::new().path("Model", "count")),
            &registry,
        );
        let e = entity("Device", &[("Model", "bms", 1, "X".into()), ("Model", "oem", 2, "Y".into())]);
        let view = engine.materialize_entity(&e, Timestamp::from_millis(9));
        assert_eq!(view.values["Model"], PropertyValue::Integer(2));
    }

    #[test]
    fn materialize_stores_view() {
        let store = MemoryStore::new();
        let engine = MaterializationEngine::new(&config(ModelPolicies::new()), &PolicyRegistry::new());
        let created = store
            .create_canonical(
                &meridian_storage::NewCanonical {
                    model_type: "Device".into(),
                    tags: BTreeSet::new(),
                    contribution: Contribution {
                        source_system: "bms".into(),
                        native_id: "d1".into(),
                        received_at: Timestamp::from_millis(1),
                    },
                    properties: vec![("Model".into(), "X".into())],
                },
                Timestamp::from_millis(2),
            )
            .unwrap();
        let view = engine
            .materialize(&store, created.canonical_id, Timestamp::from_millis(3))
            .unwrap();
        assert_eq!(store.get_materialized(created.canonical_id).unwrap(), Some(view));
        assert!(matches!(
            engine.materialize(&store, CanonicalId::new(), Timestamp::from_millis(3)),
            Err(EngineError::CanonicalNotFound(_))
        ));
    }
}
