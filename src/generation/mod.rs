//! Generation pipeline.
//!
//! Recipients flow through:
//! 1. `BatchOrchestrator::run()`: batching, pacing, fault isolation
//! 2. `ContentGenerator::generate_batch()`: the external content service
//! 3. `reconcile()`: merge with the session's prior pass

pub mod adapter;
pub mod orchestrator;
pub mod reconcile;
pub mod types;

pub use adapter::{ContentGenerator, Enricher, HttpGenerator};
pub use orchestrator::{BatchOrchestrator, CancelFlag};
pub use reconcile::reconcile;
pub use types::{
    BatchStamp, GeneratedContent, GeneratedMessage, GenerationParams, GenerationRequest,
    GenerationResponse, GenerationRun, RunCounters, RunOutcome,
};
