//! End-to-end response handling over the dedup and delivery crates.
//!
//! [`ResponsePipeline::respond`] collapses duplicate requests onto one
//! generation, marks the personality/channel pair as busy while it runs, and
//! hands the result to the chunked delivery engine.

pub mod response_pipeline;

pub use response_pipeline::{
    PipelineConfig, PipelineError, RespondOutcome, ResponseGenerator, ResponsePipeline,
    ResponseRequest,
};
