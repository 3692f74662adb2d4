//! # ethoscope-collectors
//!
//! Collectors turn an external data provider into [`RawMetricRecord`]s.
//!
//! Every outbound call goes through the same chain:
//! rate limiter -> cache -> circuit breaker -> [`Source::fetch`].
//!
//! Variants:
//! - [`MainnetCollector`] - blocks, gas prices and a mempool sample over JSON-RPC
//! - [`MevRelayCollector`] - delivered payloads from MEV-Boost relays
//! - [`L2Collector`] - block and cost samples from L2 networks
//!
//! [`RawMetricRecord`]: ethoscope_core::RawMetricRecord

mod collector;
mod guard;
mod l2;
mod mainnet;
mod mev;
mod registry;
mod source;

pub use collector::{
    parse_decimal, parse_quantity, parse_quantity_u64, Collector, CollectorHealth, CollectorStats,
};
pub use guard::{CallError, GuardedSource};
pub use l2::L2Collector;
pub use mainnet::MainnetCollector;
pub use mev::MevRelayCollector;
pub use registry::{build_registry, build_registry_with, CollectorRegistry};
pub use source::{unwrap_rpc_result, HttpSource, MockSource, Source, SourceFault, SourceRequest};
