/// Peer-to-peer collaborative editing
/// Synchronizes replicated documents between peers and tracks the
/// conflicts their merges produce
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use replica::{BufferLimits, ProjectId};

mod sync;
pub use sync::*;

mod presence;
pub use presence::*;

mod offline;
pub use offline::*;

mod persistence;
pub use persistence::*;

pub mod transport;
pub use transport::{Channel, PeerAddress, Transport, TransportKind};

mod connector;
pub use connector::*;

mod session;
pub use session::*;

mod conflict;
pub use conflict::*;

mod detector;
pub use detector::*;

mod resolution;
pub use resolution::*;

mod workspace;
pub use workspace::*;

/// Wire protocol version spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("replica error: {0}")]
    Replica(#[from] replica::ReplicaError),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("handshake rejected: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("workspace is read-only: {0}")]
    ReadOnly(String),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("invalid conflict transition: {0}")]
    InvalidTransition(String),

    #[error("resolution no longer applies: {0}")]
    StalePatch(String),

    #[error("document not found: {0}")]
    DocumentNotFound(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("project mismatch: expected {expected}, got {actual}")]
    ProjectMismatch {
        expected: ProjectId,
        actual: ProjectId,
    },
}

impl From<serde_json::Error> for CollaborationError {
    fn from(e: serde_json::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Per-connection session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.simple().to_string()[..8])
    }
}

/// Synchronization tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub protocol_version: u32,

    /// Outbound operations are coalesced for this long
    pub batch_window_ms: u64,

    pub handshake_timeout_secs: u64,
    pub connect_timeout_secs: u64,

    /// Attempts per transport strategy before falling back to the next
    pub connect_attempts: u32,

    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    /// Pending-buffer capacity per document
    pub buffer_capacity: usize,

    /// How long an operation may wait for its dependencies
    pub retention_secs: u64,

    pub presence_idle_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            batch_window_ms: 25,
            handshake_timeout_secs: 5,
            connect_timeout_secs: 5,
            connect_attempts: 3,
            backoff_base_ms: 200,
            backoff_max_ms: 5_000,
            buffer_capacity: 1024,
            retention_secs: 30,
            presence_idle_secs: 60,
        }
    }
}

impl SyncConfig {
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms.max(1))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn presence_idle(&self) -> Duration {
        Duration::from_secs(self.presence_idle_secs)
    }

    /// Delay before retry number `attempt` (0-based), doubling up to the cap
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(16)).unwrap_or(u64::MAX);
        let millis = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }

    pub fn buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            capacity: self.buffer_capacity,
            retention: self.retention(),
        }
    }
}

/// Confidence thresholds and timing for conflict resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionPolicy {
    /// At or above: apply the patch immediately
    pub auto_apply_threshold: f64,

    /// At or above (and below auto-apply): hold for explicit accept
    pub propose_threshold: f64,

    pub reasoning_timeout_secs: u64,

    /// Failed reasoning calls are retried after this long
    pub retry_interval_secs: u64,
}

impl Default for ResolutionPolicy {
    fn default() -> Self {
        Self {
            auto_apply_threshold: 0.85,
            propose_threshold: 0.70,
            reasoning_timeout_secs: 20,
            retry_interval_secs: 60,
        }
    }
}

impl ResolutionPolicy {
    pub fn decide(&self, confidence: f64) -> Decision {
        if confidence >= self.auto_apply_threshold {
            Decision::AutoApply
        } else if confidence >= self.propose_threshold {
            Decision::Propose
        } else {
            Decision::Present
        }
    }

    pub fn reasoning_timeout(&self) -> Duration {
        Duration::from_secs(self.reasoning_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

/// What the policy does with a resolution of a given confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    AutoApply,
    Propose,
    Present,
}
