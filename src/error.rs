use std::path::PathBuf;

use thiserror::Error;

use crate::codec::fifo::FifoOverflow;
use crate::codec::CodecError;

/// Failures while playing one playlist entry. None of these end the
/// channel; the supervisor logs them and moves on to the next file.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("source {path}: {source}")]
    SourceFile {
        path: PathBuf,
        #[source]
        source: CodecError,
    },
    #[error("source {path}: {reason}")]
    NoStartTimestamp { path: PathBuf, reason: String },
    #[error("{kind} decoder: {source}")]
    Decoder {
        kind: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("{kind} encoder: {source}")]
    Encoder {
        kind: &'static str,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    ResourceExhaustion(#[from] FifoOverflow),
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn source_file(path: impl Into<PathBuf>, source: CodecError) -> Self {
        PipelineError::SourceFile {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("channel '{0}' has no stream parameters yet")]
    NotReady(String),
}
