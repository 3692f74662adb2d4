//! # ethoscope-metrics
//!
//! Processing and persistence for Ethoscope metrics.
//!
//! This crate provides:
//! - The metric processor (validation, normalization, categorization)
//! - The storage sink interface with in-memory and append-file stores
//! - Pipeline telemetry counters

mod processor;
mod storage;
mod telemetry;

pub use processor::{DroppedRecord, MetricProcessor, ProcessOutcome};
pub use storage::{open_store, AppendFileStore, MemoryStore, MetricSink, StorageMode};
pub use telemetry::{CollectorTelemetry, PipelineTelemetry, TelemetryEvent, TelemetrySummary};
