use thiserror::Error;

pub type Result<T> = std::result::Result<T, PathfinderError>;

#[derive(Debug, Error)]
pub enum PathfinderError {
    #[error("invalid bytecode hex: {0}")]
    InvalidHex(String),
    #[error("bytecode is empty")]
    EmptyCode,
    #[error("no basic block starts at {0:#x}")]
    BlockNotFound(usize),
    #[error("no instruction at {0:#x}")]
    InstructionNotFound(usize),
    #[error("malformed cfg json: {0}")]
    MalformedCfg(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("concrete execution failed: {0}")]
    Concrete(String),
}
