//! The synchronization core.
//!
//! [`SyncOrchestrator`] drives one job end to end; [`BatchUpsertProcessor`]
//! reconciles fetched messages into the store, [`DeletionHandler`] runs the
//! trash/purge convergence machine, and [`AttachmentPipeline`] applies the
//! eager-fetch policy for attachment bytes.

mod attachments;
mod batch;
mod deletion;
mod orchestrator;

pub use attachments::AttachmentPipeline;
pub use batch::{BatchOutcome, BatchUpsertProcessor};
pub use deletion::{DeletionHandler, Disposition};
pub use orchestrator::SyncOrchestrator;
