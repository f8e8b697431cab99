pub mod api;
pub mod external;
pub mod health;
pub mod incremental;
pub mod orchestrator;

pub use api::{ApplyFixResult, Engine};
pub use external::{ClassDescriptor, CodeGraph, FunctionDescriptor, ImportEdge, ModuleDescriptor, VcsAdapter};
pub use health::{ComponentHealth, HealthProbe, HealthReport, OverallHealth};
pub use incremental::{candidate_source_files, plan_incremental, IncrementalPlan};
pub use orchestrator::{AgentOutcome, ProgressCounters, Semaphores, WalkContext};
