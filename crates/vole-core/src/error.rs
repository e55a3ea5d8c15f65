// Error — Single error enum for the whole evaluator
//
// Every failure mode has a kind: uninitialized variables, missing feeds,
// matmul shape mismatches, rank limits, kernel build failures, and raw
// device errors. Op computations are additionally wrapped with the
// offending node's identity (`Eval`), once, at the dispatch boundary.

/// All errors that can occur within vole.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A variable read before any assignment and with no initial value.
    #[error("variable '{name}' used before assignment and has no initial value")]
    UninitializedVariable { name: String },

    /// A placeholder with no entry in the feed map.
    #[error("placeholder '{name}' has no entry in the feed map")]
    MissingPlaceholder { name: String },

    /// Matrix multiplication inner dimensions disagree.
    #[error("matmul shape mismatch: [{m}x{k1}] @ [{k2}x{n}] — inner dims must match")]
    ShapeMismatch {
        m: usize,
        k1: usize,
        k2: usize,
        n: usize,
    },

    /// An operand rank outside what an operation supports (matmul needs
    /// rank >= 2; broadcast kernels handle rank <= 2).
    #[error("rank {got} unsupported for {context}")]
    RankError { context: &'static str, got: usize },

    /// A dtype tag outside {fp32, int32, bool}.
    #[error("unsupported dtype '{0}'")]
    UnsupportedDtype(String),

    /// An operation tag the dispatcher does not know.
    #[error("unknown operation '{0}'")]
    UnknownOp(String),

    /// Device program compilation failed; carries the device build log.
    #[error("kernel build failed for '{op}':\n{log}")]
    KernelBuildFailure { op: String, log: String },

    /// Any underlying OpenCL failure.
    #[error("device error: {0}")]
    Device(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),

    /// An op computation failed; carries the offending node's identity.
    #[error("evaluation of node '{node}' ({op}) failed: {cause}")]
    Eval {
        node: String,
        op: String,
        cause: Box<Error>,
    },
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Map an underlying device-library error.
    pub fn device(e: impl std::fmt::Display) -> Self {
        Error::Device(e.to_string())
    }

    /// Wrap a failure with the offending node's identity. Errors that are
    /// already wrapped pass through unchanged, so the envelope names the
    /// innermost failing node.
    pub fn at_node(node: impl Into<String>, source: impl Into<String>, cause: Error) -> Self {
        match cause {
            wrapped @ Error::Eval { .. } => wrapped,
            cause => Error::Eval {
                node: node.into(),
                op: source.into(),
                cause: Box::new(cause),
            },
        }
    }

    /// Walk through `Eval` wrappers to the underlying failure.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Eval { cause, .. } => cause.root_cause(),
            other => other,
        }
    }
}

/// Convenience Result type used throughout vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
