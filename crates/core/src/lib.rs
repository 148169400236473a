pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod snapshot;
pub mod tags;
pub mod timestamp;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{KeyPath, ModelConfig, ModelPolicies, PipelineConfig};
pub use error::CoreError;
pub use ids::*;
pub use snapshot::{Contribution, Snapshot};
pub use tags::{CorrelationTag, extract_tags};
pub use timestamp::Timestamp;
pub use value::PropertyValue;
