use thiserror::Error;

use crate::{data::ObjectType, device::DeviceError};

/// Errors raised while allocating, synchronizing or launching on the accelerator.
///
/// Every variant is fatal to the graph run that produced it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device allocation of {bytes} bytes for {object_type} failed: {source}")]
    Allocation {
        object_type: ObjectType,
        bytes: usize,
        source: DeviceError,
    },

    #[error("{op} transfer for {object_type} failed: {source}")]
    Transfer {
        object_type: ObjectType,
        op: &'static str,
        source: DeviceError,
    },

    #[error("{op} doesn't support object type {object_type} ({name})")]
    UnsupportedObjectType {
        object_type: ObjectType,
        op: &'static str,
        name: String,
    },

    #[error("image dimensions {found:?} differ from {expected:?} inside group #{group}")]
    DimensionMismatch {
        group: usize,
        expected: (u32, u32),
        found: (u32, u32),
    },

    #[error("max input hierarchical level {max_input} exceeds min output level {min_output} inside group #{group}")]
    HierarchyViolation {
        group: usize,
        max_input: u32,
        min_output: u32,
    },

    #[error("kernel {kernel} exec failed ({status})")]
    KernelFailed { kernel: String, status: i32 },

    #[error("kernel {kernel} is not implemented for the device")]
    NotImplemented { kernel: String },

    #[error("kernel {kernel} cannot be merged into a device supernode")]
    UnsupportedKernel { kernel: String },

    #[error("{op} failed: {source}")]
    Runtime {
        op: &'static str,
        source: DeviceError,
    },

    #[error("device {requested} not found ({available} devices available)")]
    DeviceNotFound { requested: usize, available: usize },

    #[error("{object_type} {name} has no host buffer")]
    MissingHostBuffer { object_type: ObjectType, name: String },

    #[error("{len} bytes do not fit in {name} ({size} bytes)")]
    OutOfBounds {
        name: String,
        len: usize,
        size: usize,
    },

    #[error("{name} was waited on without a pending launch")]
    NotLaunched { name: String },

    #[error("unable to write kernel dump: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Emit the failure on the log before it is handed back to the caller.
    pub(crate) fn report(self) -> Self {
        match &self {
            Error::Allocation {
                object_type,
                bytes,
                source,
            } => tracing::error!(
                object_type = %object_type,
                op = "alloc",
                code = source.code,
                bytes,
                "{self}"
            ),
            Error::Transfer {
                object_type,
                op,
                source,
            } => tracing::error!(object_type = %object_type, op, code = source.code, "{self}"),
            Error::UnsupportedObjectType {
                object_type, op, ..
            } => tracing::error!(object_type = %object_type, op, "{self}"),
            Error::Runtime { op, source } => {
                tracing::error!(op, code = source.code, "{self}")
            }
            Error::KernelFailed { status, .. } => {
                tracing::error!(op = "launch", code = status, "{self}")
            }
            _ => tracing::error!("{self}"),
        }
        self
    }
}
