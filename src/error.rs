//! Operator error types.

use rco_mesh::MeshError;
use thiserror::Error;

pub type OperatorResult<T> = Result<T, OperatorError>;

#[derive(Debug, Error)]
pub enum OperatorError {
    /// The instance-group collaborator failed to apply the instances.
    #[error("orchestration failed: {0}")]
    Orchestration(String),

    /// Instances could not be listed.
    #[error("could not enumerate instances: {0}")]
    Enumeration(String),

    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Mesh(#[from] MeshError),

    /// Instances are ready but none of them answered.
    #[error("none of the {ready} ready instances could be reached")]
    NoReachableInstances { ready: usize },

    /// The declared state cannot be acted on until it changes.
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl OperatorError {
    pub fn orchestration(err: impl std::fmt::Display) -> Self {
        Self::Orchestration(err.to_string())
    }

    pub fn enumeration(err: impl std::fmt::Display) -> Self {
        Self::Enumeration(err.to_string())
    }

    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Orchestration(_) => "orchestration",
            Self::Enumeration(_) => "enumeration",
            Self::Kube(_) => "kube",
            Self::Mesh(_) => "mesh",
            Self::NoReachableInstances { .. } => "no_reachable_instances",
            Self::InvalidSpec(_) => "invalid_spec",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }
}
