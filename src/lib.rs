//! Slipway sequences the release of a containerized web service: build the
//! image, verify it boots and answers its health endpoint (alone and inside
//! named compose topologies), then publish and deploy behind branch gates.
//! The stage order is fixed in code; a YAML plan file parameterizes it.

pub mod cleanup;
pub mod credentials;
pub mod exec;
pub mod gates;
pub mod health;
pub mod metadata;
pub mod notify;
pub mod pipeline;
pub mod plan;
pub mod presets;
pub mod publish;
pub mod stages;
pub mod validation;

pub use metadata::BuildMetadata;
pub use pipeline::{PipelineRun, Scheduler, StageDefinition};
pub use plan::Plan;
