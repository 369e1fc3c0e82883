use std::time::Duration;

use thiserror::Error;

use registry::RegistryError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Write conflict on {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[error("Invalid volume {name:?}: {message}")]
    InvalidVolume { name: String, message: String },

    #[error("Failed to resolve image: {0}")]
    Registry(#[from] RegistryError),

    #[error("Object is missing key: {0}")]
    MissingObjectKey(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::Conflict { .. } => "Conflict",
            Error::InvalidVolume { .. } => "InvalidVolume",
            Error::Registry(_) => "RegistryError",
            Error::MissingObjectKey(_) => "MissingObjectKey",
        }
    }

    /// How long to wait before the next attempt after this error
    pub fn requeue_after(&self) -> Duration {
        match self {
            // someone else wrote first; re-read and try again straight away
            Error::Conflict { .. } => Duration::ZERO,
            _ => Duration::from_secs(30),
        }
    }
}

pub mod controllers;
pub use controllers::State;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;

/// Container registry access
pub mod registry;

/// Cluster API access
pub mod store;

/// Custom resources
pub mod resources;

#[cfg(test)]
mod test_support;
