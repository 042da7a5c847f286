//! Error taxonomy for the render pipeline

use std::io;
use std::path::PathBuf;

/// The document could not be opened or its pages counted.
#[derive(Debug, thiserror::Error)]
#[error("cannot open document {path:?}: {reason}")]
pub struct DocumentOpenError {
    pub path: PathBuf,
    pub reason: String,
}

impl DocumentOpenError {
    pub fn new(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Rasterizing one page failed.
#[derive(Debug, thiserror::Error)]
#[error("failed to render page {page}: {reason}")]
pub struct RenderError {
    pub page: usize,
    pub reason: String,
}

impl RenderError {
    pub fn new(page: usize, reason: impl Into<String>) -> Self {
        Self {
            page,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the pipeline on either side of the worker boundary
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    DocumentOpen(#[from] DocumentOpenError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("frame of {len} bytes exceeds frame buffer capacity of {capacity} bytes")]
    BufferOverflow { len: usize, capacity: usize },

    #[error("protocol violation: {detail}")]
    ProtocolViolation { detail: String },

    #[error("a render session is already alive, stop it before starting another")]
    SessionAlive,

    #[error("control channel closed by peer")]
    ChannelClosed,

    #[error("shared memory: {0}")]
    SharedMemory(#[source] io::Error),

    #[error("I/O: {0}")]
    Io(#[from] io::Error),

    #[error("render worker panicked")]
    WorkerPanicked,
}

impl PipelineError {
    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            detail: detail.into(),
        }
    }

    /// Failure kind recorded in the exit record when this error ends a session
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::DocumentOpen(_) => FailureKind::DocumentOpen,
            Self::Render(_) => FailureKind::Render,
            Self::BufferOverflow { .. } => FailureKind::BufferOverflow,
            Self::ProtocolViolation { .. } => FailureKind::ProtocolViolation,
            Self::SessionAlive
            | Self::ChannelClosed
            | Self::SharedMemory(_)
            | Self::Io(_)
            | Self::WorkerPanicked => FailureKind::Channel,
        }
    }
}

/// Why a worker ended its session early.
///
/// Stored as a `u32` in the shared region header, so the numeric codes are
/// part of the process boundary and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    DocumentOpen,
    Render,
    BufferOverflow,
    ProtocolViolation,
    Channel,
}

impl FailureKind {
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::DocumentOpen => 1,
            Self::Render => 2,
            Self::BufferOverflow => 3,
            Self::ProtocolViolation => 4,
            Self::Channel => 5,
        }
    }

    /// Decode a header value; `0` means no failure was recorded.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::DocumentOpen),
            2 => Some(Self::Render),
            3 => Some(Self::BufferOverflow),
            4 => Some(Self::ProtocolViolation),
            5 => Some(Self::Channel),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DocumentOpen => "document open",
            Self::Render => "render",
            Self::BufferOverflow => "buffer overflow",
            Self::ProtocolViolation => "protocol violation",
            Self::Channel => "channel",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_codes_are_stable() {
        for kind in [
            FailureKind::DocumentOpen,
            FailureKind::Render,
            FailureKind::BufferOverflow,
            FailureKind::ProtocolViolation,
            FailureKind::Channel,
        ] {
            assert_eq!(FailureKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(FailureKind::from_code(0), None);
        assert_eq!(FailureKind::BufferOverflow.code(), 3);
    }

    #[test]
    fn overflow_maps_to_its_failure_kind() {
        let err = PipelineError::BufferOverflow {
            len: 10,
            capacity: 4,
        };
        assert_eq!(err.failure_kind(), FailureKind::BufferOverflow);
        assert!(err.to_string().contains("10 bytes"));
    }
}
