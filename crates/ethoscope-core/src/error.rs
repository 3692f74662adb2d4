//! Unified error types for Ethoscope

use thiserror::Error;

/// Unified error type for all Ethoscope operations
#[derive(Error, Debug)]
pub enum EthoscopeError {
    // Configuration errors (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Component weights must sum to 1.0, got {sum}")]
    InvalidWeights { sum: f64 },

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Source errors
    #[error("Source error: {0}")]
    Source(String),

    // Processing errors
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Computation error: {0}")]
    Computation(String),

    // Storage errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

impl EthoscopeError {
    /// Configuration faults must stop the process instead of being logged and skipped
    pub fn is_configuration_fault(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::InvalidWeights { .. } | Self::ConfigParse(_)
        )
    }
}

/// Result type alias using EthoscopeError
pub type Result<T> = std::result::Result<T, EthoscopeError>;
