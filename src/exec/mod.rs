pub mod executor;
pub mod pipeline;

pub use executor::{run_pipeline, ExecError, PipelineOutcome, ProcessResult, SIG_KILL_DELAY};
pub use pipeline::parse_pipeline;
