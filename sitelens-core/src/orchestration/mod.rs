//! Scan orchestration: configuration, the per-route task pipeline, the
//! worker scheduler and the typed event bus they report through.

pub mod config;
pub mod events;
pub mod pipeline;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use config::ScanConfig;
pub use events::{EventMeta, PipelineEvent, PipelineEventPayload};
pub use pipeline::RouteRun;
pub use registry::ReportRegistry;
pub use retry::RetryPolicy;
pub use runtime::InProcPipelineBus;
pub use scheduler::{ScanRuntime, ScanRuntimeBuilder};
