//! # ethoscope-health
//!
//! Turns stored metric history into a bounded, explainable 0-100 health score.
//!
//! - [`stats`]: descriptive statistics over sample windows
//! - [`baseline`]: 1h / 24h / 7d windows rebuilt from the sink each cycle
//! - [`anomaly`]: z-score and IQR outlier detection with severity grading
//! - [`components`]: the six component scorers
//! - [`HealthScoreCalculator`]: ties them together into a [`NetworkHealthScoreRecord`]
//!
//! [`NetworkHealthScoreRecord`]: ethoscope_core::NetworkHealthScoreRecord

pub mod anomaly;
pub mod baseline;
mod calculator;
pub mod components;
pub mod stats;

pub use anomaly::{AnomalyDetector, Observation};
pub use baseline::{BaselineWindow, BlockHead, MetricHistory, WindowSpan};
pub use calculator::HealthScoreCalculator;
