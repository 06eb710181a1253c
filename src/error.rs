//! Error type for the whole pipeline.

/// An error produced while lowering, encoding, or serializing.
///
/// Internal invariant violations (unknown opcode shapes, unsupported AST
/// kinds reaching the backend) indicate a compiler bug upstream; they are
/// reported instead of panicking so the driver can fail with a diagnostic.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    /// The encoder was handed a (mnemonic, operand-shape) combination it
    /// does not support.
    #[error("cannot encode `{0}`")]
    Encode(String),

    /// A construct reached the backend that the type checker should have
    /// rejected.
    #[error("unsupported construct at line {line}: {what}")]
    Unsupported { what: String, line: u32 },

    /// A hard implementation limit was exceeded.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// The textual-assembly parser rejected its input.
    #[error("assembly parse error at line {line}: {what}")]
    AsmParse { what: String, line: u32 },

    /// An internal invariant did not hold.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CodegenResult<T> = Result<T, CodegenError>;
