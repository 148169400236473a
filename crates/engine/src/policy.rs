//! Resolution policies: built-ins, pluggable transformers and the registry
//! configuration names resolve against.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use meridian_core::PropertyValue;
use meridian_storage::{CanonicalEntity, PropertyEntry};

pub const LAST: &str = "last";
pub const FIRST: &str = "first";
pub const MAX: &str = "max";
pub const MIN: &str = "min";
pub const COALESCE: &str = "coalesce";

/// A policy could not be applied to the values it was given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMismatch(pub String);

impl fmt::Display for PolicyMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for PolicyMismatch {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub value: PropertyValue,
    pub policy: String,
}

/// Read-only input of a per-path policy.
#[derive(Debug, Clone, Copy)]
pub struct PathInput<'a> {
    pub model_type: &'a str,
    pub path: &'a str,
    /// Attributed values ordered by `received_at`.
    pub values: &'a [PropertyEntry],
    pub properties: &'a BTreeMap<String, Vec<PropertyEntry>>,
}

/// Turns one path's value array into a single value. Must be pure.
pub trait PropertyTransformer: Send + Sync {
    fn resolve(&self, input: &PathInput<'_>) -> Result<Resolved, PolicyMismatch>;
}

impl<F> PropertyTransformer for F
where
    F: Fn(&PathInput<'_>) -> Result<Resolved, PolicyMismatch> + Send + Sync,
{
    fn resolve(&self, input: &PathInput<'_>) -> Result<Resolved, PolicyMismatch> {
        self(input)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordResolution {
    pub values: BTreeMap<String, PropertyValue>,
    pub policies: BTreeMap<String, String>,
}

/// Resolves a whole entity at once, replacing per-path policies. Must be pure.
pub trait RecordTransformer: Send + Sync {
    fn resolve(&self, entity: &CanonicalEntity) -> Result<RecordResolution, PolicyMismatch>;
}

impl<F> RecordTransformer for F
where
    F: Fn(&CanonicalEntity) -> Result<RecordResolution, PolicyMismatch> + Send + Sync,
{
    fn resolve(&self, entity: &CanonicalEntity) -> Result<RecordResolution, PolicyMismatch> {
        self(entity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinPolicy {
    Last,
    First,
    Max,
    Min,
    Coalesce,
}

impl BuiltinPolicy {
    pub const ALL: [BuiltinPolicy; 5] = [
        BuiltinPolicy::Last,
        BuiltinPolicy::First,
        BuiltinPolicy::Max,
        BuiltinPolicy::Min,
        BuiltinPolicy::Coalesce,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Last => LAST,
            Self::First => FIRST,
            Self::Max => MAX,
            Self::Min => MIN,
            Self::Coalesce => COALESCE,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }

    pub fn apply(&self, values: &[PropertyEntry]) -> Result<PropertyValue, PolicyMismatch> {
        match self {
            Self::Last => Ok(non_empty(values.iter().rev())),
            Self::First | Self::Coalesce => Ok(non_empty(values.iter())),
            Self::Max => extreme(values, f64::max),
            Self::Min => extreme(values, f64::min),
        }
    }
}

/// First non-empty value in iteration order, or null when every entry is empty.
fn non_empty<'a>(mut entries: impl Iterator<Item = &'a PropertyEntry>) -> PropertyValue {
    entries
        .find(|e| !e.value.is_empty())
        .map(|e| e.value.clone())
        .unwrap_or_default()
}

/// Fold the numeric entries; non-numeric ones are skipped.
fn extreme(values: &[PropertyEntry], pick: fn(f64, f64) -> f64) -> Result<PropertyValue, PolicyMismatch> {
    values
        .iter()
        .filter_map(|e| e.value.as_number())
        .reduce(pick)
        .map(PropertyValue::from_number)
        .ok_or_else(|| PolicyMismatch("no numeric values".into()))
}

impl PropertyTransformer for BuiltinPolicy {
    fn resolve(&self, input: &PathInput<'_>) -> Result<Resolved, PolicyMismatch> {
        Ok(Resolved {
            value: self.apply(input.values)?,
            policy: self.name().to_string(),
        })
    }
}

/// Named policies available to configuration. Starts out with the built-ins.
#[derive(Clone)]
pub struct PolicyRegistry {
    properties: HashMap<String, Arc<dyn PropertyTransformer>>,
    records: HashMap<String, Arc<dyn RecordTransformer>>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        let mut properties: HashMap<String, Arc<dyn PropertyTransformer>> = HashMap::new();
        for policy in BuiltinPolicy::ALL {
            properties.insert(policy.name().to_string(), Arc::new(policy));
        }
        Self {
            properties,
            records: HashMap::new(),
        }
    }

    /// Register or replace a per-path policy.
    pub fn register_property(
        &mut self,
        name: &str,
        transformer: impl PropertyTransformer + 'static,
    ) -> &mut Self {
        self.properties.insert(name.to_string(), Arc::new(transformer));
        self
    }

    pub fn register_record(
        &mut self,
        name: &str,
        transformer: impl RecordTransformer + 'static,
    ) -> &mut Self {
        self.records.insert(name.to_string(), Arc::new(transformer));
        self
    }

    pub fn property(&self, name: &str) -> Option<Arc<dyn PropertyTransformer>> {
        self.properties.get(name).cloned()
    }

    pub fn record(&self, name: &str) -> Option<Arc<dyn RecordTransformer>> {
        self.records.get(name).cloned()
    }
}

impl fmt::Debug for PolicyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut properties: Vec<_> = self.properties.keys().collect();
        properties.sort();
        let mut records: Vec<_> = self.records.keys().collect();
        records.sort();
        f.debug_struct("PolicyRegistry")
            .field("properties", &properties)
            .field("records", &records)
            .finish()
    }
}
