// Pipeline Definitions
// Models, YAML parser, trigger filters and definition errors

pub mod error;
pub mod models;
pub mod parser;
pub mod trigger;

pub use error::{DefinitionError, DefinitionErrorKind};
pub use models::{
    CacheSpec, CommandSpec, Job, PipelineDefinition, Program, Step, StepKind, ToolchainSpec,
};
pub use parser::DefinitionParser;
pub use trigger::{BranchFilter, EventKind, Trigger, TriggerDecision, TriggerEvent};
