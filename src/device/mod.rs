mod host;
pub use host::*;

#[cfg(feature = "cuda")]
mod cuda;
#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;

use std::fmt::Debug;

use thiserror::Error;

/// Raw device address handed out by a backend. Carries no ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(pub u64);

/// Command stream handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Completion marker handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerId(pub u64);

/// Runtime failure reported by the accelerator backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{op} => {code}")]
pub struct DeviceError {
    pub op: &'static str,
    pub code: i32,
}

impl DeviceError {
    pub fn new(op: &'static str, code: i32) -> Self {
        Self { op, code }
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Shape of a strided host->device copy. Pitches are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Copy2d {
    pub dst_pitch: usize,
    pub src_pitch: usize,
    pub width: usize,
    pub height: usize,
}

/// The accelerator runtime. All work for a graph is enqueued on a single stream,
/// so ordering between a launch and its transfers comes from enqueue order.
pub trait Device: Debug + Send + Sync {
    fn name(&self) -> String;

    /// Number of devices the runtime enumerates.
    fn device_count(&self) -> DeviceResult<usize>;
    /// Bind subsequent work to the given ordinal.
    fn set_device(&self, ordinal: usize) -> DeviceResult<()>;

    fn alloc(&self, bytes: usize) -> DeviceResult<DevicePtr>;
    fn free(&self, ptr: DevicePtr) -> DeviceResult<()>;
    fn memset(&self, ptr: DevicePtr, value: u8, bytes: usize) -> DeviceResult<()>;

    fn copy_htod(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()>;
    fn copy_htod_2d(
        &self,
        dst: DevicePtr,
        offset: usize,
        src: &[u8],
        shape: Copy2d,
    ) -> DeviceResult<()>;
    fn copy_dtoh(&self, src: DevicePtr, offset: usize, dst: &mut [u8]) -> DeviceResult<()>;

    fn create_stream(&self) -> DeviceResult<StreamId>;
    fn destroy_stream(&self, stream: StreamId) -> DeviceResult<()>;
    /// Block until everything enqueued on `stream` has finished.
    fn synchronize(&self, stream: StreamId) -> DeviceResult<()>;

    fn create_marker(&self) -> DeviceResult<MarkerId>;
    fn destroy_marker(&self, marker: MarkerId) -> DeviceResult<()>;
    fn record_marker(&self, marker: MarkerId, stream: StreamId) -> DeviceResult<()>;
    /// Block until the marker has been reached by its stream.
    fn wait_marker(&self, marker: MarkerId) -> DeviceResult<()>;
    /// Milliseconds between two recorded markers.
    fn elapsed_ms(&self, start: MarkerId, stop: MarkerId) -> DeviceResult<f32>;
}
