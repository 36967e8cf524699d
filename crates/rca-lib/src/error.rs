//! Error taxonomy for the analysis engine

use thiserror::Error;

/// Errors raised by graph construction, vertex evaluation and peer transport.
///
/// Only [`RcaError::Configuration`] is allowed to escape to the caller that
/// builds the graph. Evaluation and transport failures are contained within
/// the tick or the send that produced them.
#[derive(Debug, Error)]
pub enum RcaError {
    /// Malformed, cyclic or otherwise unusable graph definition or conf.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A vertex predicate could not produce a verdict from its inputs.
    #[error("evaluation of vertex '{vertex}' failed: {reason}")]
    Evaluation { vertex: String, reason: String },

    /// Encoding, decoding or delivery of flow units to a peer failed.
    #[error("transport error for peer '{peer}': {reason}")]
    Transport { peer: String, reason: String },
}

impl RcaError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        RcaError::Configuration(msg.into())
    }

    pub fn evaluation(vertex: impl Into<String>, reason: impl Into<String>) -> Self {
        RcaError::Evaluation {
            vertex: vertex.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        RcaError::Transport {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Fatal errors must stop startup; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RcaError::Configuration(_))
    }
}

pub type RcaResult<T> = std::result::Result<T, RcaError>;
