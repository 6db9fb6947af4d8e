//! Error types for the confinement system
//!
//! This module defines the errors that can occur while confining subjects,
//! loading configuration and talking to the durable store.

use thiserror::Error;

/// Errors raised by the durable store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is temporarily unable to accept the operation
    #[error("Storage busy: {0}")]
    Busy(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage encoding error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Busy(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            Self::Yaml(_) => false,
        }
    }
}

/// Errors that can occur during confinement operations
#[derive(Debug, Error)]
pub enum ConfinementError {
    /// No cell with this name is configured
    #[error("Cell not found: {0}")]
    CellNotFound(String),

    /// A labor sentence was requested for a cell without spawners
    #[error("Cell {0} has no labor spawners")]
    NoSpawners(String),

    #[error("Invalid material name: {0}")]
    InvalidMaterial(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Configuration file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Generic error
    #[error("Confinement error: {0}")]
    Other(String),
}

/// Convert a string into a ConfinementError
impl From<String> for ConfinementError {
    fn from(message: String) -> Self {
        Self::Other(message)
    }
}

/// Result type for confinement operations
pub type ConfinementResult<T> = Result<T, ConfinementError>;

/// Result type for durable store operations
pub type StoreResult<T> = Result<T, StoreError>;
