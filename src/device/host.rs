use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use rustc_hash::FxHashMap;

use super::*;

// Runtime codes mirrored from the HIP/CUDA error tables
pub const ERROR_INVALID_VALUE: i32 = 1;
pub const ERROR_OUT_OF_MEMORY: i32 = 2;
pub const ERROR_INVALID_DEVICE: i32 = 101;
pub const ERROR_INVALID_HANDLE: i32 = 400;

const ALLOC_ALIGN: u64 = 256;

/// Transfer and allocation counters kept by [`HostDevice`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostDeviceStats {
    pub allocs: usize,
    pub frees: usize,
    pub htod_copies: usize,
    pub htod_bytes: usize,
    pub dtoh_copies: usize,
    pub dtoh_bytes: usize,
    pub synchronizes: usize,
}

#[derive(Debug, Default)]
struct HostState {
    current: usize,
    next_ptr: u64,
    live_bytes: usize,
    memory: FxHashMap<u64, Vec<u8>>,
    streams: FxHashMap<u64, usize>,
    markers: FxHashMap<u64, Option<Instant>>,
    next_handle: u64,
    injected: FxHashMap<&'static str, i32>,
    stats: HostDeviceStats,
}

/// Accelerator simulated in host memory.
///
/// Every enqueued operation completes immediately, which keeps the stream
/// ordering trivially satisfied. Used as the default backend and as the test
/// double for the coherence machinery.
#[derive(Debug)]
pub struct HostDevice {
    num_devices: usize,
    capacity: Option<usize>,
    state: Mutex<HostState>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new(1)
    }
}

impl HostDevice {
    pub fn new(num_devices: usize) -> Self {
        Self {
            num_devices,
            capacity: None,
            state: Mutex::new(HostState {
                next_ptr: ALLOC_ALIGN,
                next_handle: 1,
                ..Default::default()
            }),
        }
    }

    /// Limit the amount of live device memory
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next call of `op` fail with `code`.
    pub fn inject_failure(&self, op: &'static str, code: i32) {
        self.state().injected.insert(op, code);
    }

    pub fn stats(&self) -> HostDeviceStats {
        self.state().stats
    }

    pub fn current_device(&self) -> usize {
        self.state().current
    }

    pub fn live_allocations(&self) -> usize {
        self.state().memory.len()
    }

    /// Snapshot of `len` bytes starting at `offset` within an allocation.
    pub fn read(&self, ptr: DevicePtr, offset: usize, len: usize) -> Option<Vec<u8>> {
        self.state()
            .memory
            .get(&ptr.0)
            .and_then(|m| m.get(offset..offset + len))
            .map(<[u8]>::to_vec)
    }

    /// Direct access to an allocation, bypassing the transfer counters.
    /// This is how simulated kernels touch device memory.
    pub fn with_memory<R>(&self, ptr: DevicePtr, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.state().memory.get_mut(&ptr.0).map(|m| f(m))
    }

    fn take_injected(state: &mut HostState, op: &'static str) -> DeviceResult<()> {
        match state.injected.remove(op) {
            Some(code) => Err(DeviceError::new(op, code)),
            None => Ok(()),
        }
    }

    fn region<'a>(
        state: &'a mut HostState,
        op: &'static str,
        ptr: DevicePtr,
        offset: usize,
        len: usize,
    ) -> DeviceResult<&'a mut [u8]> {
        state
            .memory
            .get_mut(&ptr.0)
            .ok_or(DeviceError::new(op, ERROR_INVALID_VALUE))?
            .get_mut(offset..offset + len)
            .ok_or(DeviceError::new(op, ERROR_INVALID_VALUE))
    }

    fn handle(state: &mut HostState) -> u64 {
        let h = state.next_handle;
        state.next_handle += 1;
        h
    }
}

impl Device for HostDevice {
    fn name(&self) -> String {
        "host".to_string()
    }

    fn device_count(&self) -> DeviceResult<usize> {
        Ok(self.num_devices)
    }

    fn set_device(&self, ordinal: usize) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "set_device")?;
        if ordinal >= self.num_devices {
            return Err(DeviceError::new("set_device", ERROR_INVALID_DEVICE));
        }
        state.current = ordinal;
        Ok(())
    }

    fn alloc(&self, bytes: usize) -> DeviceResult<DevicePtr> {
        let mut state = self.state();
        Self::take_injected(&mut state, "alloc")?;
        if let Some(cap) = self.capacity {
            if state.live_bytes + bytes > cap {
                return Err(DeviceError::new("alloc", ERROR_OUT_OF_MEMORY));
            }
        }
        let ptr = state.next_ptr;
        state.next_ptr += (bytes.max(1) as u64).div_ceil(ALLOC_ALIGN) * ALLOC_ALIGN;
        // Fresh allocations are deliberately not zeroed
        state.memory.insert(ptr, vec![0xcd; bytes]);
        state.live_bytes += bytes;
        state.stats.allocs += 1;
        Ok(DevicePtr(ptr))
    }

    fn free(&self, ptr: DevicePtr) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "free")?;
        let mem = state
            .memory
            .remove(&ptr.0)
            .ok_or(DeviceError::new("free", ERROR_INVALID_VALUE))?;
        state.live_bytes -= mem.len();
        state.stats.frees += 1;
        Ok(())
    }

    fn memset(&self, ptr: DevicePtr, value: u8, bytes: usize) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "memset")?;
        Self::region(&mut state, "memset", ptr, 0, bytes)?.fill(value);
        Ok(())
    }

    fn copy_htod(&self, dst: DevicePtr, offset: usize, src: &[u8]) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "copy_htod")?;
        Self::region(&mut state, "copy_htod", dst, offset, src.len())?.copy_from_slice(src);
        state.stats.htod_copies += 1;
        state.stats.htod_bytes += src.len();
        Ok(())
    }

    fn copy_htod_2d(
        &self,
        dst: DevicePtr,
        offset: usize,
        src: &[u8],
        shape: Copy2d,
    ) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "copy_htod_2d")?;
        if shape.height == 0
            || (shape.height > 1 && (shape.width > shape.src_pitch || shape.width > shape.dst_pitch))
        {
            return Err(DeviceError::new("copy_htod_2d", ERROR_INVALID_VALUE));
        }
        let span = shape.dst_pitch * (shape.height - 1) + shape.width;
        let region = Self::region(&mut state, "copy_htod_2d", dst, offset, span)?;
        for row in 0..shape.height {
            let s = row * shape.src_pitch;
            let d = row * shape.dst_pitch;
            let src_row = src
                .get(s..s + shape.width)
                .ok_or(DeviceError::new("copy_htod_2d", ERROR_INVALID_VALUE))?;
            region[d..d + shape.width].copy_from_slice(src_row);
        }
        state.stats.htod_copies += 1;
        state.stats.htod_bytes += shape.width * shape.height;
        Ok(())
    }

    fn copy_dtoh(&self, src: DevicePtr, offset: usize, dst: &mut [u8]) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "copy_dtoh")?;
        dst.copy_from_slice(Self::region(&mut state, "copy_dtoh", src, offset, dst.len())?);
        state.stats.dtoh_copies += 1;
        state.stats.dtoh_bytes += dst.len();
        Ok(())
    }

    fn create_stream(&self) -> DeviceResult<StreamId> {
        let mut state = self.state();
        Self::take_injected(&mut state, "create_stream")?;
        let h = Self::handle(&mut state);
        let current = state.current;
        state.streams.insert(h, current);
        Ok(StreamId(h))
    }

    fn destroy_stream(&self, stream: StreamId) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "destroy_stream")?;
        state
            .streams
            .remove(&stream.0)
            .map(|_| ())
            .ok_or(DeviceError::new("destroy_stream", ERROR_INVALID_HANDLE))
    }

    fn synchronize(&self, stream: StreamId) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "synchronize")?;
        if !state.streams.contains_key(&stream.0) {
            return Err(DeviceError::new("synchronize", ERROR_INVALID_HANDLE));
        }
        state.stats.synchronizes += 1;
        Ok(())
    }

    fn create_marker(&self) -> DeviceResult<MarkerId> {
        let mut state = self.state();
        Self::take_injected(&mut state, "create_marker")?;
        let h = Self::handle(&mut state);
        state.markers.insert(h, None);
        Ok(MarkerId(h))
    }

    fn destroy_marker(&self, marker: MarkerId) -> DeviceResult<()> {
        self.state()
            .markers
            .remove(&marker.0)
            .map(|_| ())
            .ok_or(DeviceError::new("destroy_marker", ERROR_INVALID_HANDLE))
    }

    fn record_marker(&self, marker: MarkerId, stream: StreamId) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "record_marker")?;
        if !state.streams.contains_key(&stream.0) {
            return Err(DeviceError::new("record_marker", ERROR_INVALID_HANDLE));
        }
        let slot = state
            .markers
            .get_mut(&marker.0)
            .ok_or(DeviceError::new("record_marker", ERROR_INVALID_HANDLE))?;
        *slot = Some(Instant::now());
        Ok(())
    }

    fn wait_marker(&self, marker: MarkerId) -> DeviceResult<()> {
        let mut state = self.state();
        Self::take_injected(&mut state, "wait_marker")?;
        match state.markers.get(&marker.0) {
            Some(Some(_)) => Ok(()),
            _ => Err(DeviceError::new("wait_marker", ERROR_INVALID_HANDLE)),
        }
    }

    fn elapsed_ms(&self, start: MarkerId, stop: MarkerId) -> DeviceResult<f32> {
        let state = self.state();
        match (state.markers.get(&start.0), state.markers.get(&stop.0)) {
            (Some(Some(a)), Some(Some(b))) => {
                Ok(b.saturating_duration_since(*a).as_secs_f32() * 1000.0)
            }
            _ => Err(DeviceError::new("elapsed_ms", ERROR_INVALID_HANDLE)),
        }
    }
}
