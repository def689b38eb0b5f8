use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use cudarc::driver::{
    result::{self, DriverError},
    sys, CudaDevice, CudaSlice, CudaStream, DevicePtr as _, DevicePtrMut as _,
};
use rustc_hash::FxHashMap;

use super::*;

fn code(op: &'static str) -> impl Fn(DriverError) -> DeviceError {
    move |e| DeviceError::new(op, e.0 as i32)
}

struct Event(sys::CUevent);
// Events are only touched behind the backend mutex
unsafe impl Send for Event {}

#[derive(Default)]
struct CudaState {
    device: Option<Arc<CudaDevice>>,
    memory: FxHashMap<u64, CudaSlice<u8>>,
    streams: FxHashMap<u64, CudaStream>,
    events: FxHashMap<u64, Event>,
    next_handle: u64,
}

/// CUDA driver backend
pub struct CudaBackend {
    state: Mutex<CudaState>,
}

impl Debug for CudaBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CudaBackend")
    }
}

impl Default for CudaBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(CudaState {
                next_handle: 1,
                ..Default::default()
            }),
        }
    }
}

impl CudaBackend {
    fn state(&self) -> MutexGuard<'_, CudaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn device(state: &mut CudaState, op: &'static str) -> DeviceResult<Arc<CudaDevice>> {
        if state.device.is_none() {
            state.device = Some(CudaDevice::new(0).map_err(code(op))?);
        }
        state
            .device
            .clone()
            .ok_or(DeviceError::new(op, super::ERROR_INVALID_DEVICE))
    }

    fn handle(state: &mut CudaState) -> u64 {
        let h = state.next_handle;
        state.next_handle += 1;
        h
    }
}

impl Device for CudaBackend {
    fn name(&self) -> String {
        "cuda".to_string()
    }

    fn device_count(&self) -> DeviceResult<usize> {
        CudaDevice::count()
            .map(|c| c as usize)
            .map_err(code("device_count"))
    }

    fn set_device(&self, ordinal: usize) -> DeviceResult<()> {
        self.state().device = Some(CudaDevice::new(ordinal).map_err(code("set_device"))?);
        Ok(())
    }

    fn alloc(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        let mut state = self.state();
        let dev = Self::device(&mut state, "alloc")?;
        let slice = unsafe { dev.alloc::<u8>(bytes) }.map_err(code("alloc"))?;
        let ptr = *slice.device_ptr();
        state.memory.insert(ptr, slice);
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> DeviceResult<()> {
        // Dropping the slice releases the allocation
        self.state()
            .memory
            .remove(&ptr.0)
            .map(|_| ())
            .ok_or(DeviceError::new("free", super::ERROR_INVALID_VALUE))
    }

    fn memset(&self, ptr: DevicePtr, value: u8, bytes: usize) -> DeviceResult<()> {
        let mut state = self.state();
        let slice = state
            .memory
            .get_mut(&ptr.0)
            .ok_or(DeviceError::new("memset", super::ERROR_INVALID_VALUE))?;
        unsafe { result::memset_d8_sync(*slice.device_ptr_mut(), value, bytes) }
            .map_err(code("memset"))
    }

    fn copy_htod(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()> {
        let mut state = self.state();
        let dev = Self::device(&mut state, "copy_htod")?;
        let slice = state
            .memory
            .get_mut(&dst.0)
            .ok_or(DeviceError::new("copy_htod", super::ERROR_INVALID_VALUE))?;
        let mut view = slice
            .try_slice_mut(offset..offset + src.len())
            .ok_or(DeviceError::new("copy_htod", super::ERROR_INVALID_VALUE))?;
        dev.htod_sync_copy_into(src, &mut view)
            .map_err(code("copy_htod"))
    }

    fn copy_htod_2d(
        &self,
        dst: DevicePtr,
        offset: usize,
        src: &[u8],
        shape: Copy2d,
    ) -> DeviceResult<()> {
        for row in 0..shape.height {
            let s = row * shape.src_pitch;
            let row_src = src
                .get(s..s + shape.width)
                .ok_or(DeviceError::new("copy_htod_2d", super::ERROR_INVALID_VALUE))?;
            self.copy_htod(dst, offset + row * shape.dst_pitch, row_src)?;
        }
        Ok(())
    }

    fn copy_dtoh(&self, src: DevicePtr, offset: usize, dst: &mut [u8]) -> DeviceResult<()> {
        let mut state = self.state();
        let dev = Self::device(&mut state, "copy_dtoh")?;
        let slice = state
            .memory
            .get(&src.0)
            .ok_or(DeviceError::new("copy_dtoh", super::ERROR_INVALID_VALUE))?;
        let view = slice
            .try_slice(offset..offset + dst.len())
            .ok_or(DeviceError::new("copy_dtoh", super::ERROR_INVALID_VALUE))?;
        dev.dtoh_sync_copy_into(&view, dst)
            .map_err(code("copy_dtoh"))
    }

    fn create_stream(&self) -> DeviceResult<StreamId> {
        let mut state = self.state();
        let dev = Self::device(&mut state, "create_stream")?;
        let stream = dev.fork_default_stream().map_err(code("create_stream"))?;
        let h = Self::handle(&mut state);
        state.streams.insert(h, stream);
        Ok(StreamId(h))
    }

    fn destroy_stream(&self, stream: StreamId) -> DeviceResult<()> {
        self.state()
            .streams
            .remove(&stream.0)
            .map(|_| ())
            .ok_or(DeviceError::new("destroy_stream", super::ERROR_INVALID_HANDLE))
    }

    fn synchronize(&self, stream: StreamId) -> DeviceResult<()> {
        let state = self.state();
        let stream = state
            .streams
            .get(&stream.0)
            .ok_or(DeviceError::new("synchronize", super::ERROR_INVALID_HANDLE))?;
        unsafe { result::stream::synchronize(stream.stream) }.map_err(code("synchronize"))
    }

    fn create_marker(&self) -> DeviceResult<MarkerId> {
        let event = result::event::create(sys::CUevent_flags::CU_EVENT_DEFAULT)
            .map_err(code("create_marker"))?;
        let mut state = self.state();
        let h = Self::handle(&mut state);
        state.events.insert(h, Event(event));
        Ok(MarkerId(h))
    }

    fn destroy_marker(&self, marker: MarkerId) -> DeviceResult<()> {
        let event = self
            .state()
            .events
            .remove(&marker.0)
            .ok_or(DeviceError::new("destroy_marker", super::ERROR_INVALID_HANDLE))?;
        unsafe { result::event::destroy(event.0) }.map_err(code("destroy_marker"))
    }

    fn record_marker(&self, marker: MarkerId, stream: StreamId) -> DeviceResult<()> {
        let state = self.state();
        let (Some(event), Some(stream)) = (state.events.get(&marker.0), state.streams.get(&stream.0))
        else {
            return Err(DeviceError::new("record_marker", super::ERROR_INVALID_HANDLE));
        };
        unsafe { result::event::record(event.0, stream.stream) }.map_err(code("record_marker"))
    }

    fn wait_marker(&self, marker: MarkerId) -> DeviceResult<()> {
        let state = self.state();
        let event = state
            .events
            .get(&marker.0)
            .ok_or(DeviceError::new("wait_marker", super::ERROR_INVALID_HANDLE))?;
        unsafe { sys::cuEventSynchronize(event.0) }
            .result()
            .map_err(code("wait_marker"))
    }

    fn elapsed_ms(&self, start: MarkerId, stop: MarkerId) -> DeviceResult<f32> {
        let state = self.state();
        let (Some(a), Some(b)) = (state.events.get(&start.0), state.events.get(&stop.0)) else {
            return Err(DeviceError::new("elapsed_ms", super::ERROR_INVALID_HANDLE));
        };
        unsafe { result::event::elapsed(a.0, b.0) }.map_err(code("elapsed_ms"))
    }
}
