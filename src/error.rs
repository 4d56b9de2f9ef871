//! Error taxonomy for the control server

use imgoverlay_proto::WireError;
use thiserror::Error;

/// Everything that can go wrong while serving a producer.
///
/// Every variant ends the session: the server replies `Error` where a reply
/// is possible, then tears the connection down together with its images.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("invalid size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("invalid shared memory size {size} (expected {expected}, limit {limit})")]
    InvalidBufferSize { size: u32, expected: u64, limit: u32 },

    #[error("invalid DMA-BUF plane count {0}")]
    InvalidPlaneCount(u8),

    #[error("already have image with id {0}")]
    DuplicateId(u8),

    #[error("unknown image id {0}")]
    UnknownId(u8),

    #[error("invalid buffer half {0}")]
    InvalidBufferHalf(u8),

    #[error("image limit reached ({0})")]
    CapacityExceeded(usize),

    #[error("fd transfer failed: {0}")]
    FdTransferFailed(String),

    #[error("mmap of image {id} failed: {reason}")]
    MappingFailed { id: u8, reason: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] WireError),

    #[error("peer disconnected")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for ControlError {
    fn from(errno: nix::errno::Errno) -> Self {
        ControlError::Io(std::io::Error::from(errno))
    }
}
