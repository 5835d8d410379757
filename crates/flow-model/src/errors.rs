//! Model validation error types

use thiserror::Error;

/// Structural problems in a flow definition. These are programmer errors in
/// the authoring process and the only errors allowed to escape run
/// preparation.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("duplicate node id {0} in {1}")]
    DuplicateNode(String, String),

    #[error("edge references unknown node {0} in {1}")]
    DanglingEdge(String, String),

    #[error("invalid flow structure: {0}")]
    InvalidStructure(String),
}
