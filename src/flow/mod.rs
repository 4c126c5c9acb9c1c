//! Flow model and catalog.
//!
//! - [`definition`]: `FlowDefinition` and its per-step metadata
//! - [`registry`]: builtin catalog, override validation, merge and lookup

pub mod definition;
pub mod registry;

pub use definition::{ArtifactSpec, Conditional, FlowDefinition, WHOLE_FEATURE_DIR};
pub use registry::{
    FlowLoad, FlowRegistry, FlowValidation, builtin_flows, load, load_from_str, merge, validate,
};
