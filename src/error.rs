//! Error types of the convolution path.
//!
//! Only [`ConvError`] reaches callers. [`EngineCompileError`] and
//! [`EngineExecError`] describe a single rejected candidate and are consumed
//! by the selection loop in [`crate::plan`].

use crate::dtype::DataType;

/// A failed convolution call.
#[derive(Debug, thiserror::Error)]
pub enum ConvError {
    /// Operand element type has no convolution descriptor.
    #[error("illegal tensor data type: {0}")]
    UnsupportedDataType(DataType),
    /// Operand shapes, devices or parameters are inconsistent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Autotuning was requested.
    #[error("benchmark mode is not supported")]
    BenchmarkUnsupported,
    /// The operation graph could not be assembled.
    #[error(transparent)]
    GraphAssembly(#[from] GraphAssemblyError),
    /// No execution context could be created for the device.
    #[error("device unavailable: {0}")]
    Device(String),
    /// Every candidate engine was filtered out or failed.
    #[error("unable to find an engine to execute this computation ({candidates} candidates tried)")]
    NoViableEngine {
        /// Candidates that survived policy filtering.
        candidates: usize,
    },
    /// A runtime invariant unrelated to engine choice was broken.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A malformed operation graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphAssemblyError {
    #[error("operation graph has no execution context")]
    MissingContext,
    #[error("operation graph has no operations")]
    NoOperations,
    #[error("operand uid {0} is bound more than once")]
    DuplicateUid(i64),
    #[error("operand ranks disagree: input {input}, weight {weight}, output {output}")]
    RankMismatch { input: usize, weight: usize, output: usize },
    #[error("operand types disagree: expected {expected}, found {found}")]
    DataTypeMismatch { expected: DataType, found: DataType },
    #[error("convolution descriptor has {descriptor} spatial dims, operands have {operands}")]
    SpatialRankMismatch { descriptor: usize, operands: usize },
}

/// A candidate engine that cannot be built for this exact problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("engine {engine} failed to compile: {reason}")]
pub struct EngineCompileError {
    pub engine: i64,
    pub reason: String,
}

impl EngineCompileError {
    pub fn new(engine: i64, reason: impl Into<String>) -> Self {
        Self { engine, reason: reason.into() }
    }
}

/// A compiled plan that failed during dispatch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("engine {engine} failed to execute: {reason}")]
pub struct EngineExecError {
    pub engine: i64,
    pub reason: String,
}

impl EngineExecError {
    pub fn new(engine: i64, reason: impl Into<String>) -> Self {
        Self { engine, reason: reason.into() }
    }
}

/// Outcome of a failed plan execution.
#[derive(Debug, thiserror::Error)]
pub enum ExecFailure {
    /// The engine itself failed; the next candidate may succeed.
    #[error(transparent)]
    Engine(#[from] EngineExecError),
    /// Anything else; aborts the call.
    #[error(transparent)]
    Fatal(#[from] ConvError),
}
