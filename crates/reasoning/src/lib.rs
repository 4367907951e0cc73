/// Conflict reasoning
/// Turns a detected conflict into a proposed fix with a confidence score
///
/// Backends are interchangeable: a local heuristic resolver and a remote
/// HTTP service both implement [`ReasoningBackend`].
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

pub mod backends;

pub use backends::{
    BackendConfig, BackendFactory, BackendType, LocalBackend, ReasoningBackend, RemoteBackend,
};

#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("reasoning timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed resolution: {0}")]
    Malformed(String),

    #[error("backend configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReasoningError>;

/// Conflict classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Merged content no longer parses
    CompileTime,
    /// Declarations and uses disagree
    TypeLevel,
    /// Concurrent edits to the same logical construct
    Semantic,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CompileTime => write!(f, "compile_time"),
            Self::TypeLevel => write!(f, "type_level"),
            Self::Semantic => write!(f, "semantic"),
        }
    }
}

/// Everything a backend sees about one conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictContext {
    pub file_path: String,
    pub language: Option<String>,
    pub conflict_type: ConflictKind,

    /// Conflict region in the merged document (0-based lines, end exclusive)
    pub region: Range<usize>,

    /// Merged text of the region as it currently reads
    pub merged: String,

    /// Region text with only the local side's edits
    pub local_version: String,

    /// Region text with only the remote side's edits
    pub remote_version: String,

    /// A few lines around the region
    pub surrounding_code: String,

    /// Parser or checker messages that triggered the conflict
    pub diagnostics: Vec<String>,
}

/// Replacement of a line region.
/// `original` is the region text the patch was computed against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub lines: Range<usize>,
    pub original: String,
    pub replacement: String,
}

/// A proposed fix; immutable once produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub patch: Option<Patch>,
    pub explanation: String,
    pub confidence: f64,
    pub alternatives: Vec<String>,
}

impl Resolution {
    /// Reject out-of-range confidence and empty explanations
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(ReasoningError::Malformed(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if self.explanation.trim().is_empty() {
            return Err(ReasoningError::Malformed("missing explanation".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolution(confidence: f64) -> Resolution {
        Resolution {
            patch: None,
            explanation: "keep both calls".into(),
            confidence,
            alternatives: Vec::new(),
        }
    }

    #[test]
    fn test_validate_confidence_range() {
        assert!(resolution(0.0).validate().is_ok());
        assert!(resolution(1.0).validate().is_ok());
        assert!(resolution(1.2).validate().is_err());
        assert!(resolution(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_conflict_kind_serialization() {
        let json = serde_json::to_string(&ConflictKind::TypeLevel).unwrap();
        assert_eq!(json, "\"type_level\"");
        assert_eq!(ConflictKind::CompileTime.to_string(), "compile_time");
    }
}
