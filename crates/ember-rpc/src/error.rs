//! Error types for the RPC client.

use ember_runtime::{Cause, Defect, FiberId};
use serde_json::Value;
use thiserror::Error;

use crate::group::ProcedureKind;

/// Failures reported by a [`Protocol`](crate::protocol::Protocol).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The transport is closed.
    #[error("transport closed")]
    Closed,

    /// The transport failed to deliver or receive a frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded.
    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl From<ProtocolError> for Defect {
    fn from(err: ProtocolError) -> Self {
        Defect::new(err.to_string())
    }
}

/// Errors raised by the client before a request is dispatched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RpcClientError {
    /// The group has no procedure with this tag.
    #[error("unknown procedure `{0}`")]
    UnknownProcedure(String),

    /// The procedure exists but is of the other kind.
    #[error("procedure `{tag}` is {actual}, not {expected}")]
    WrongKind {
        tag: String,
        expected: ProcedureKind,
        actual: ProcedureKind,
    },
}

/// Outcome of a typed invocation that did not produce a response.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RpcError<E> {
    /// The procedure failed with its declared error.
    #[error("procedure failed: {0}")]
    Failure(E),

    /// The server, transport or a middleware failed unexpectedly.
    #[error("procedure died: {0}")]
    Defect(Defect),

    /// The request was interrupted locally, by the server, or by shutdown.
    #[error("request interrupted")]
    Interrupted(Vec<FiberId>),

    /// The request could not be encoded.
    #[error("failed to encode request: {0}")]
    Encode(String),

    /// A response or error value did not decode into the declared type.
    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error(transparent)]
    Client(#[from] RpcClientError),
}

impl<E> RpcError<E> {
    /// Classify a failure cause, decoding typed failures with `decode`.
    ///
    /// Failures win over defects, which win over interruptions.
    pub(crate) fn from_cause(cause: Cause<Value>, decode: impl Fn(Value) -> Result<E, String>) -> Self {
        if let Some(failure) = cause.failures().into_iter().next() {
            return match decode(failure.clone()) {
                Ok(error) => RpcError::Failure(error),
                Err(err) => RpcError::Decode(err),
            };
        }
        if let Some(defect) = cause.defects().into_iter().next() {
            return RpcError::Defect(defect.clone());
        }
        RpcError::Interrupted(cause.interruptors())
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, RpcError::Interrupted(_))
    }
}
