//! Typed errors raised by the OT core.
//!
//! The teacher binary (`edison-note`) leans on `anyhow::Result` throughout
//! because it never needs callers to match on failure kind. A library boundary
//! does, so the core exposes `CoreError` (via `thiserror`, as the `ethersync`
//! and `rustpad` reference stacks do) while still letting `anyhow` wrap it at
//! the application edges.

use thiserror::Error;

use crate::session::Permission;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("operation base length {base} does not match input length {input}")]
    LengthMismatch { base: usize, input: usize },

    #[error("retain of {retain} extends past the end of the base (len {base_len})")]
    OverRetain { retain: usize, base_len: usize },

    #[error("compose target length {lhs_target} does not match rhs base length {rhs_base}")]
    ComposeLengthMismatch { lhs_target: usize, rhs_base: usize },

    #[error("compose underran: left operand exhausted before right operand")]
    ComposeUnderrun,

    #[error("compose overran: right operand exhausted before left operand")]
    ComposeOverrun,

    #[error("transform requires equal base lengths, got {a_base} and {b_base}")]
    TransformLengthMismatch { a_base: usize, b_base: usize },

    #[error("unknown wire atom kind at index {index}")]
    WireFormatError { index: usize },

    #[error("operation boundary at byte {pos} does not fall on a char boundary")]
    InvalidBoundary { pos: usize },

    #[error("session is not ready: no `doc` event has been received yet")]
    NotReady,

    #[error("permission denied for action under note permission {0:?}")]
    PermissionDenied(Permission),

    #[error("position {pos} is out of bounds for document of length {len}")]
    PositionOutOfBounds { pos: usize, len: usize },

    #[error("revision gap: expected {expected}, got {got}")]
    InvalidRevision { expected: u64, got: u64 },

    #[error("received ack but no operation is outstanding")]
    NoPendingOperation,

    #[error("transport is disconnected and reconnection is disabled")]
    Disconnected,

    #[error("reconnection failed after {0} attempts")]
    ReconnectFailed(u32),

    #[error("operation timed out after {0}ms waiting for ack")]
    OperationTimeout(u64),

    #[error("macro `{name}` lost its match and could not relocate `{matched}`")]
    MacroPositionLost { name: String, matched: String },

    #[error("streaming macro insert failed after bounded retries")]
    StreamInsertFailed,

    #[error("transport error: {0}")]
    TransportError(#[from] anyhow::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
