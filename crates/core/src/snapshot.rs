use std::collections::BTreeSet;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreError;
use crate::timestamp::Timestamp;
use crate::value::PropertyValue;

/// Path prefix of the lineage property every snapshot contributes:
/// `identifier.external.<sourceSystem>` holds the source's native id.
pub const EXTERNAL_ID_PREFIX: &str = "identifier.external.";

pub fn external_id_path(source_system: &str) -> String {
    format!("{EXTERNAL_ID_PREFIX}{source_system}")
}

/// One observation of a business entity by one source system.
///
/// `properties` keeps delivery order. Nested JSON objects are flattened to
/// dotted paths on the way in, so a typed struct and a dynamic JSON map
/// end up as the same flat list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub model_type: String,
    pub source_system: String,
    pub native_id: String,
    #[serde(
        serialize_with = "serialize_properties",
        deserialize_with = "deserialize_properties",
        default
    )]
    pub properties: Vec<(String, PropertyValue)>,
    pub received_at: Timestamp,
}

/// Who contributed a snapshot and when. Also the idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contribution {
    pub source_system: String,
    pub native_id: String,
    pub received_at: Timestamp,
}

impl Snapshot {
    pub fn new(
        model_type: impl Into<String>,
        source_system: impl Into<String>,
        native_id: impl Into<String>,
        received_at: Timestamp,
    ) -> Self {
        Self {
            model_type: model_type.into(),
            source_system: source_system.into(),
            native_id: native_id.into(),
            properties: Vec::new(),
            received_at,
        }
    }

    pub fn with_property(mut self, path: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.push((path.into(), value.into()));
        self
    }

    /// Parse the ingestion wire format and validate it.
    pub fn from_json(json: &str) -> Result<Self, CoreError> {
        let snapshot: Snapshot = serde_json::from_str(json)
            .map_err(|e| CoreError::MalformedSnapshot(e.to_string()))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Build a snapshot from a strongly-typed struct. The struct is
    /// serialized and flattened to the same path map a dynamic payload
    /// would produce.
    pub fn from_typed<T: Serialize>(
        model_type: impl Into<String>,
        source_system: impl Into<String>,
        native_id: impl Into<String>,
        received_at: Timestamp,
        payload: &T,
    ) -> Result<Self, CoreError> {
        let value =
            serde_json::to_value(payload).map_err(|e| CoreError::Serialization(e.to_string()))?;
        let serde_json::Value::Object(map) = value else {
            return Err(CoreError::MalformedSnapshot(
                "typed payload must serialize to an object".into(),
            ));
        };
        let mut properties = Vec::new();
        for (key, value) in &map {
            flatten_json(key, value, &mut properties);
        }
        let snapshot = Self {
            model_type: model_type.into(),
            source_system: source_system.into(),
            native_id: native_id.into(),
            properties,
            received_at,
        };
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Reject snapshots that can never be correlated or stored.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.model_type.trim().is_empty() {
            return Err(CoreError::MalformedSnapshot("empty modelType".into()));
        }
        if self.source_system.trim().is_empty() {
            return Err(CoreError::MalformedSnapshot("empty sourceSystem".into()));
        }
        if self.native_id.trim().is_empty() {
            return Err(CoreError::MalformedSnapshot("empty nativeId".into()));
        }
        let mut seen = BTreeSet::new();
        for (path, _) in &self.properties {
            if path.trim().is_empty() {
                return Err(CoreError::MalformedSnapshot("empty property path".into()));
            }
            if !seen.insert(path.as_str()) {
                return Err(CoreError::MalformedSnapshot(format!(
                    "duplicate property path {path:?}"
                )));
            }
        }
        Ok(())
    }

    pub fn property(&self, path: &str) -> Option<&PropertyValue> {
        self.properties
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, v)| v)
    }

    pub fn contribution(&self) -> Contribution {
        Contribution {
            source_system: self.source_system.clone(),
            native_id: self.native_id.clone(),
            received_at: self.received_at,
        }
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

/// Flatten a JSON value into `(dotted.path, value)` pairs. Empty objects
/// contribute nothing.
pub fn flatten_json(prefix: &str, value: &serde_json::Value, out: &mut Vec<(String, PropertyValue)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, nested) in map {
                flatten_json(&format!("{prefix}.{key}"), nested, out);
            }
        }
        other => out.push((prefix.to_string(), PropertyValue::from_json(other))),
    }
}

fn serialize_properties<S: Serializer>(
    properties: &[(String, PropertyValue)],
    serializer: S,
) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(properties.len()))?;
    for (path, value) in properties {
        map.serialize_entry(path, value)?;
    }
    map.end()
}

fn deserialize_properties<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<(String, PropertyValue)>, D::Error> {
    struct PropertiesVisitor;

    impl<'de> Visitor<'de> for PropertiesVisitor {
        type Value = Vec<(String, PropertyValue)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of property paths to values")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::new();
            while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
                flatten_json(&key, &value, &mut out);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_map(PropertiesVisitor)
}
