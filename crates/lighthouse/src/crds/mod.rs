pub mod activity;
pub mod breakpoint;
pub mod job;
pub mod policy;
pub mod tekton;

pub use activity::*;
pub use breakpoint::*;
pub use job::*;
pub use policy::*;
pub use tekton::{Pipeline, PipelineRun, PipelineRunSpec, PipelineRunStatus, PipelineSpec};
