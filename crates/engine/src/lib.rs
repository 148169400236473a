pub mod admin;
pub mod coalesce;
pub mod error;
pub mod materialize;
pub mod pipeline;
pub mod policy;
pub mod projection;
pub mod query;
pub mod retry;

pub use admin::{AdminService, Resolution, ResolutionOutcome};
pub use coalesce::{CoalescingDecision, CoalescingEngine};
pub use error::EngineError;
pub use materialize::MaterializationEngine;
pub use pipeline::{IntakeReport, MaterializationReport, Pipeline, PipelineBuilder, RunSummary};
pub use policy::{
    BuiltinPolicy, PathInput, PolicyMismatch, PolicyRegistry, PropertyTransformer, RecordResolution,
    RecordTransformer, Resolved,
};
pub use projection::{CANONICAL_VIEW, LINEAGE_VIEW, ProjectionBuilder, ProjectionRenderer};
pub use query::{QueryService, ViewFilter};
pub use retry::Backoff;
