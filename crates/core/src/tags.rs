use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{KeyNormalization, PipelineConfig};
use crate::error::CoreError;
use crate::snapshot::Snapshot;

/// A value used to decide whether two snapshots describe the same object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CorrelationTag {
    /// Repeated updates from one source about one native object.
    Synthetic {
        source_system: String,
        native_id: String,
    },
    /// A business key shared across sources, e.g. `Serial:SN004`.
    Direct { label: String, value: String },
}

impl CorrelationTag {
    pub fn synthetic(source_system: &str, native_id: &str) -> Self {
        Self::Synthetic {
            source_system: source_system.trim().to_string(),
            native_id: native_id.trim().to_string(),
        }
    }

    pub fn direct(label: &str, value: &str) -> Self {
        Self::Direct {
            label: label.to_string(),
            value: value.to_string(),
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self, Self::Synthetic { .. })
    }

    /// Stable index key: `@source:native` for synthetic tags and
    /// `Label:value` for direct ones. `:` and `%` inside the leading parts
    /// are percent-escaped so keys never collide.
    pub fn key(&self) -> String {
        match self {
            Self::Synthetic {
                source_system,
                native_id,
            } => format!("@{}:{native_id}", escape(source_system)),
            Self::Direct { label, value } => format!("{}:{value}", escape(label)),
        }
    }

    pub fn parse_key(key: &str) -> Result<Self, CoreError> {
        let (head, rest, synthetic) = match key.strip_prefix('@') {
            Some(stripped) => {
                let (head, rest) = stripped
                    .split_once(':')
                    .ok_or_else(|| CoreError::InvalidData(format!("bad tag key {key:?}")))?;
                (head, rest, true)
            }
            None => {
                let (head, rest) = key
                    .split_once(':')
                    .ok_or_else(|| CoreError::InvalidData(format!("bad tag key {key:?}")))?;
                (head, rest, false)
            }
        };
        let head = unescape(head);
        Ok(if synthetic {
            Self::Synthetic {
                source_system: head,
                native_id: rest.to_string(),
            }
        } else {
            Self::Direct {
                label: head,
                value: rest.to_string(),
            }
        })
    }
}

impl fmt::Display for CorrelationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

fn escape(s: &str) -> String {
    s.replace('%', "%25").replace(':', "%3A")
}

fn unescape(s: &str) -> String {
    s.replace("%3A", ":").replace("%25", "%")
}

/// Compute the correlation tags of a snapshot.
///
/// Always yields the synthetic tag, plus one direct tag per configured key
/// path that is present and non-empty after normalization. Models without
/// configuration only get the synthetic tag.
pub fn extract_tags(snapshot: &Snapshot, config: &PipelineConfig) -> BTreeSet<CorrelationTag> {
    let mut tags = BTreeSet::new();
    tags.insert(CorrelationTag::synthetic(
        &snapshot.source_system,
        &snapshot.native_id,
    ));

    let Some(model) = config.model(&snapshot.model_type) else {
        return tags;
    };

    for key in &model.key_paths {
        if let Some(tag) = direct_tag(snapshot, &key.path, key.label(), &model.normalization) {
            tags.insert(tag);
        }
    }
    tags
}

fn direct_tag(
    snapshot: &Snapshot,
    path: &str,
    label: &str,
    normalization: &KeyNormalization,
) -> Option<CorrelationTag> {
    let raw = snapshot.property(path)?.tag_text()?;
    let value = normalization.apply(&raw);
    if value.trim().is_empty() {
        return None;
    }
    Some(CorrelationTag::direct(label, &value))
}
