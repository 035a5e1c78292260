use std::{error::Error, fmt, io, path::PathBuf};

use machine_learning::MlErr;

use crate::config::ConfigErr;

/// The trainer's result type.
pub type Result<T> = std::result::Result<T, TrainErr>;

/// Training run failures.
#[derive(Debug)]
pub enum TrainErr {
    Config(ConfigErr),
    Ml(MlErr),
    Io(io::Error),
    Dataset {
        path: PathBuf,
        line: usize,
        msg: String,
    },
    /// A peer sent something the protocol doesn't allow at this point.
    Protocol {
        rank: usize,
        msg: String,
    },
    /// A peer aborted and told us why.
    Peer {
        rank: usize,
        msg: String,
    },
    /// The training loader yields no batch even right after a restart.
    EmptyLoader,
}

impl fmt::Display for TrainErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainErr::Config(e) => write!(f, "configuration error: {e}"),
            TrainErr::Ml(e) => write!(f, "{e}"),
            TrainErr::Io(e) => write!(f, "io error: {e}"),
            TrainErr::Dataset { path, line, msg } => {
                write!(f, "bad example at {}:{line}: {msg}", path.display())
            }
            TrainErr::Protocol { rank, msg } => {
                write!(f, "protocol violation by worker {rank}: {msg}")
            }
            TrainErr::Peer { rank, msg } => write!(f, "worker {rank} failed: {msg}"),
            TrainErr::EmptyLoader => write!(f, "the training loader has no batches"),
        }
    }
}

impl Error for TrainErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TrainErr::Config(e) => Some(e),
            TrainErr::Ml(e) => Some(e),
            TrainErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigErr> for TrainErr {
    fn from(value: ConfigErr) -> Self {
        Self::Config(value)
    }
}

impl From<MlErr> for TrainErr {
    fn from(value: MlErr) -> Self {
        Self::Ml(value)
    }
}

impl From<io::Error> for TrainErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<TrainErr> for io::Error {
    fn from(value: TrainErr) -> Self {
        match value {
            TrainErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
