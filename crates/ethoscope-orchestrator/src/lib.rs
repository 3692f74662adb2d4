//! # ethoscope-orchestrator
//!
//! Drives the Ethoscope pipeline.
//!
//! ## Key Features
//!
//! - **Collection cycle**: every registered collector runs concurrently under
//!   its own deadline; partial results are merged and processed as one batch
//! - **Scoring cycle**: on a slower timer, scores network health, persists the
//!   record and publishes it with its anomaly flags
//! - **Isolation**: a failing, hung or panicking collector costs its own
//!   records for that tick and nothing else
//! - **Graceful shutdown**: timers stop first, in-flight collectors get a
//!   bounded grace period, then are abandoned

mod events;
mod pipeline;

pub use events::{BroadcastEventBus, EventSink, PipelineEvent, DEFAULT_EVENT_CAPACITY};
pub use pipeline::{CollectionReport, CollectorOutcome, Pipeline};
