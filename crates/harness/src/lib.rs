mod fixture;
mod snapshots;

pub use fixture::{TestPipeline, init_tracing};
pub use snapshots::{device_config, snapshot};
