use std::{
    error::Error,
    fmt::{self, Display},
    io,
};

use crate::optimization::OptimizerErr;

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug)]
pub enum MlErr {
    SizeMismatch {
        a: &'static str,
        b: &'static str,
        got: usize,
        expected: usize,
    },
    UnknownTensor(String),
    LayoutMismatch(String),
    TokenOutOfRange {
        what: &'static str,
        token: i64,
        vocab_size: usize,
    },
    InvalidBatch(String),
    InvalidConfig(String),
    Optimizer(OptimizerErr),
    Io(io::Error),
    Json(serde_json::Error),
    SafeTensors(safetensors::SafeTensorError),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                a,
                b,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch between {a} and {b}, got {got} and expected {expected}"
            ),
            MlErr::UnknownTensor(name) => write!(f, "There's no tensor named {name}"),
            MlErr::LayoutMismatch(detail) => write!(f, "Parameter layouts differ: {detail}"),
            MlErr::TokenOutOfRange {
                what,
                token,
                vocab_size,
            } => write!(
                f,
                "The {what} token {token} is outside of the vocabulary of size {vocab_size}"
            ),
            MlErr::InvalidBatch(detail) => write!(f, "Invalid batch: {detail}"),
            MlErr::InvalidConfig(detail) => write!(f, "Invalid model configuration: {detail}"),
            MlErr::Optimizer(e) => write!(f, "optimizer error: {e}"),
            MlErr::Io(e) => write!(f, "io error: {e}"),
            MlErr::Json(e) => write!(f, "json error: {e}"),
            MlErr::SafeTensors(e) => write!(f, "safetensors error: {e}"),
        }
    }
}

impl Error for MlErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MlErr::Optimizer(e) => Some(e),
            MlErr::Io(e) => Some(e),
            MlErr::Json(e) => Some(e),
            MlErr::SafeTensors(e) => Some(e),
            _ => None,
        }
    }
}

impl From<OptimizerErr> for MlErr {
    fn from(value: OptimizerErr) -> Self {
        Self::Optimizer(value)
    }
}

impl From<io::Error> for MlErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for MlErr {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<safetensors::SafeTensorError> for MlErr {
    fn from(value: safetensors::SafeTensorError) -> Self {
        Self::SafeTensors(value)
    }
}
