use crate::model::element::ElementId;

/// Errors produced by collab-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("element not found: {0}")]
    ElementNotFound(ElementId),

    #[error("element id already in use: {0}")]
    DuplicateId(ElementId),

    #[error("connection endpoint not found: {0}")]
    EndpointNotFound(ElementId),

    #[error("element {0} is not a shape")]
    NotAShape(ElementId),

    #[error("element {0} is not a connection")]
    NotAConnection(ElementId),

    #[error("malformed change: {0}")]
    MalformedChange(String),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
