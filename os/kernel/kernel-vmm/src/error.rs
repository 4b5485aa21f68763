use kernel_alloc::PmmError;
use kernel_info::LayoutError;
use kernel_vmem::{MapError, QueryError};

/// Recoverable failures of the address-space manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmmError {
    #[error("out of memory")]
    NoMemory,
    #[error("no region or mapping at that address")]
    NotFound,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("range is already allocated")]
    AlreadyAllocated,
}

impl From<PmmError> for VmmError {
    fn from(value: PmmError) -> Self {
        match value {
            PmmError::NoMemory => Self::NoMemory,
            PmmError::InvalidArgument => Self::InvalidArgument,
            PmmError::AlreadyAllocated => Self::AlreadyAllocated,
        }
    }
}

impl From<MapError> for VmmError {
    fn from(value: MapError) -> Self {
        match value {
            MapError::NoMemory { .. } => Self::NoMemory,
            MapError::InvalidArgument(_) => Self::InvalidArgument,
        }
    }
}

impl From<QueryError> for VmmError {
    fn from(value: QueryError) -> Self {
        match value {
            QueryError::NotFound(_) => Self::NotFound,
            QueryError::OutOfRange(_) => Self::InvalidArgument,
        }
    }
}

impl From<LayoutError> for VmmError {
    fn from(_: LayoutError) -> Self {
        Self::InvalidArgument
    }
}
