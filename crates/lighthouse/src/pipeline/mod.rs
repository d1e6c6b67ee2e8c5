//! Translation of jobs into pipeline-engine runs.

pub mod duration;
pub mod env;
pub mod template;
pub mod translator;

pub use duration::{format_duration, parse_duration};
pub use env::job_env;
pub use translator::{make_pipeline_run, TranslateContext, Translated};
