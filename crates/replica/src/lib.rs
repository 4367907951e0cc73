/// Replicated document store
/// Convergent per-file text and per-project metadata shared between peers
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

mod operations;
pub use operations::*;

mod frontier;
pub use frontier::*;

mod pending;
pub use pending::*;

mod document;
pub use document::*;

mod project;
pub use project::*;

mod snapshot;
pub use snapshot::*;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("malformed operation {0}: {1}")]
    Malformed(OpId, String),

    #[error("edit out of bounds: {offset}+{len} exceeds document length {length}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        length: usize,
    },

    #[error("empty edit")]
    EmptyEdit,

    #[error("pending buffer full ({0} operations)")]
    BufferFull(usize),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("project {0} is archived")]
    Archived(ProjectId),
}

pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Identity of a replica producing operations (one per team member device)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub uuid::Uuid);

impl ActorId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ActorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Project identifier shared by every replica of the same team project
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(pub uuid::Uuid);

impl ProjectId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ProjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
