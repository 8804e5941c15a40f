use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfusionError {
    #[error("Required bundle member not found: {0}")]
    NotFound(String),
    
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    
    #[error("Malformed header: {0}")]
    MalformedHeader(String),
    
    #[error("Inconsistent bundle: {0}")]
    Inconsistent(String),
    
    #[error("Segment {segment} of {file} truncated: expected {expected} values, read {actual}")]
    Truncated {
        file: String,
        segment: usize,
        expected: usize,
        actual: usize,
    },
    
    #[error("Malformed segment framing: {0}")]
    MalformedSegment(String),
    
    #[error("Segment index {0} out of range")]
    InvalidSegmentIndex(usize),
    
    #[error("Optional component {component} unavailable: {reason}")]
    OptionalComponentFailure {
        component: String,
        reason: String,
    },
    
    #[error("No electrode placement was loaded")]
    NoPlacement,
    
    #[error("{0} electrode placements were loaded, select one explicitly")]
    AmbiguousPlacement(usize),
    
    #[error("Electrode placement not found: {0}")]
    PlacementNotFound(String),
    
    #[error("Invalid signal container: {0}")]
    InvalidSignal(String),
}

impl ProfusionError {
    /// Builds an `OptionalComponentFailure` for the named bundle member
    pub fn optional<C: Into<String>, R: ToString>(component: C, reason: R) -> Self {
        ProfusionError::OptionalComponentFailure {
            component: component.into(),
            reason: reason.to_string(),
        }
    }
    
    /// Whether this error aborts an import or only degrades it
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ProfusionError::OptionalComponentFailure { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProfusionError>;
