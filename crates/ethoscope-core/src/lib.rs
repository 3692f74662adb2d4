//! # ethoscope-core
//!
//! Core types for the Ethoscope network health pipeline.
//!
//! Ethoscope samples a live, noisy environment (Ethereum mainnet, MEV-Boost
//! relays, L2 networks), turns what it sees into validated time-series records
//! and derives a single 0-100 health score with statistical anomaly flags.
//!
//! ## Core Paradigm
//!
//! - Collectors produce [`RawMetricRecord`]s, never errors
//! - The processor turns raw records into per-kind [`ProcessedMetricBatch`]es
//! - The health calculator reads history back and emits a [`NetworkHealthScoreRecord`]
//! - Configuration is validated once at startup; a bad weighting refuses to run

mod config;
mod error;
pub mod delivery;
mod types;

pub use config::{
    CollectorKind, CollectorSettings, ComponentWeights, EthoscopeConfig, L2NetworkSettings,
    PipelineSettings, RateLimitPolicy, RateLimitSettings, RelaySettings, ScoringSettings,
    SourceSettings, StorageSettings, WEIGHT_TOLERANCE,
};
pub use error::{EthoscopeError, Result};
pub use types::*;
