// shopsync - Offline-resilient mutation pipeline for the storefront client

pub mod cart;
pub mod conflict;
pub mod dispatch;
pub mod network;
pub mod offline;
pub mod pipeline;
pub mod storage;
pub mod sync;

pub use pipeline::{MutationPipeline, PipelineConfig, PipelineError, Submission};
