pub mod backfill;
pub mod controller;
pub mod generator;
pub mod representative;
pub mod resolver;
pub mod union_find;

pub use backfill::{BackfillConfig, BackfillError, BackfillReport, HashBackfillWorker};
pub use controller::{
    JobPhase, JobStatus, RegenerationController, RegenerationError, RegenerationHandle,
};
pub use generator::{
    GenerateError, GenerationReport, GenerationScope, GeneratorParams, PhaseReport,
    StackGenerator,
};
pub use resolver::{AssetResolver, ResolveError};
