//! # Pressure Errors
//!
//! A single error enum covers every failure the core can surface. It is
//! `Clone` because one settlement is fanned out to every coalesced `observe`
//! waiter for the same source.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use thiserror::Error;

use crate::core::model::PressureSource;

/// # Error Kind
///
/// Coarse classification of a `PressureError`, mirroring the exception classes
/// a host environment would surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input, rejected synchronously before any state changes.
    Validation,
    /// The source cannot be observed on this platform.
    NotSupported,
    /// A pending operation was cancelled by `unobserve` or `disconnect`.
    Abort,
    /// A driver call did not match the registry's current state.
    InvalidState,
    /// The backend itself failed.
    Backend,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// # Pressure Error
///
/// Failures of observer, registry and backend operations.
pub enum PressureError {
    /// `sampleInterval` was negative or not below 2^32.
    #[error("sampleInterval {0} is outside the range [0, 2^32)")]
    InvalidSampleInterval(i64),

    /// A source name outside the known set.
    #[error("unknown pressure source \"{0}\"")]
    UnknownSource(String),

    /// A state name outside nominal/fair/serious/critical.
    #[error("unknown pressure state \"{0}\"")]
    UnknownState(String),

    /// The source is not supported by the backend.
    #[error("pressure source \"{0}\" is not supported")]
    NotSupported(PressureSource),

    /// The observe operation was cancelled before it settled.
    #[error("observation of \"{0}\" was aborted")]
    Aborted(PressureSource),

    /// `create` was called for a virtual source that already exists.
    #[error("virtual pressure source \"{0}\" already exists")]
    SourceAlreadyExists(PressureSource),

    /// A driver call referenced a virtual source that was never created.
    #[error("virtual pressure source \"{0}\" does not exist")]
    SourceNotFound(PressureSource),

    /// The backend could not start or continue sampling.
    #[error("pressure backend failure: {0}")]
    Backend(String),
}

impl PressureError {
    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSampleInterval(_) | Self::UnknownSource(_) | Self::UnknownState(_) => {
                ErrorKind::Validation
            }
            Self::NotSupported(_) => ErrorKind::NotSupported,
            Self::Aborted(_) => ErrorKind::Abort,
            Self::SourceAlreadyExists(_) | Self::SourceNotFound(_) => ErrorKind::InvalidState,
            Self::Backend(_) => ErrorKind::Backend,
        }
    }

    /// The host exception name for this error (e.g. `"AbortError"`).
    pub fn dom_name(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "TypeError",
            ErrorKind::NotSupported => "NotSupportedError",
            ErrorKind::Abort => "AbortError",
            ErrorKind::InvalidState => "InvalidStateError",
            ErrorKind::Backend => "OperationError",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_map_to_host_exception_names() {
        assert_eq!(PressureError::InvalidSampleInterval(-2).dom_name(), "TypeError");
        assert_eq!(PressureError::UnknownSource("gpu".into()).dom_name(), "TypeError");
        assert_eq!(
            PressureError::NotSupported(PressureSource::Cpu).dom_name(),
            "NotSupportedError"
        );
        assert_eq!(PressureError::Aborted(PressureSource::Cpu).dom_name(), "AbortError");
        assert_eq!(
            PressureError::SourceNotFound(PressureSource::Thermals).kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_messages_name_the_source() {
        let msg = PressureError::Aborted(PressureSource::Cpu).to_string();
        assert_eq!(msg, "observation of \"cpu\" was aborted");
    }
}
