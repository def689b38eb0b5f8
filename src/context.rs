use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};

use tracing::{debug, trace};

use crate::{
    config::Config,
    data::{DeviceMemory, ObjectType},
    device::Device,
    error::{Error, Result},
};

/// Device memory accounting. Only the allocator updates it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    pub alloc_count: usize,
    pub alloc_size: usize,
    pub release_count: usize,
}

/// Owns the accelerator binding shared by every graph created from it
#[derive(Debug)]
pub struct Context {
    device: Arc<dyn Device>,
    ordinal: usize,
    config: Config,
    stats: Mutex<AllocStats>,
    dump_counter: AtomicUsize,
}

impl Context {
    /// Bind the device ordinal requested by `config`, or the first device.
    ///
    /// An ordinal outside the enumerated devices is an error, no fallback device is picked.
    pub fn new(device: Arc<dyn Device>, config: Config) -> Result<Arc<Self>> {
        let available = device.device_count().map_err(|source| {
            Error::Runtime {
                op: "device_count",
                source,
            }
            .report()
        })?;
        let ordinal = config.device_index.unwrap_or(0);
        if ordinal >= available {
            return Err(Error::DeviceNotFound {
                requested: ordinal,
                available,
            }
            .report());
        }
        device.set_device(ordinal).map_err(|source| {
            Error::Runtime {
                op: "set_device",
                source,
            }
            .report()
        })?;
        debug!(device = %device.name(), ordinal, "context created");
        Ok(Arc::new(Self {
            device,
            ordinal,
            config,
            stats: Mutex::default(),
            dump_counter: AtomicUsize::new(0),
        }))
    }

    pub fn device(&self) -> &dyn Device {
        self.device.as_ref()
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn stats_mut(&self) -> MutexGuard<'_, AllocStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> AllocStats {
        *self.stats_mut()
    }

    pub(crate) fn alloc(&self, object_type: ObjectType, bytes: usize) -> Result<DeviceMemory> {
        let ptr = self.device.alloc(bytes).map_err(|source| {
            Error::Allocation {
                object_type,
                bytes,
                source,
            }
            .report()
        })?;
        let mut stats = self.stats_mut();
        stats.alloc_count += 1;
        stats.alloc_size += bytes;
        trace!(%object_type, bytes, ptr = ptr.0, "device alloc");
        Ok(DeviceMemory::new(ptr, bytes))
    }

    /// Free an owned allocation. Consuming the handle makes a second release impossible;
    /// on failure the handle comes back with the error so the owner keeps it.
    pub(crate) fn release(
        &self,
        memory: DeviceMemory,
    ) -> std::result::Result<(), (DeviceMemory, Error)> {
        if let Err(source) = self.device.free(memory.ptr()) {
            return Err((memory, Error::Runtime { op: "free", source }.report()));
        }
        self.stats_mut().release_count += 1;
        Ok(())
    }

    pub(crate) fn next_dump_index(&self) -> usize {
        self.dump_counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostDevice;

    #[test]
    fn test_device_selection() {
        let dev = Arc::new(HostDevice::new(3));
        let cx = Context::new(dev.clone(), Config::default().with_device(2)).unwrap();
        assert_eq!(cx.ordinal(), 2);
        assert_eq!(dev.current_device(), 2);

        let cx = Context::new(dev.clone(), Config::default()).unwrap();
        assert_eq!(cx.ordinal(), 0);
    }

    // A requested ordinal that is not enumerated must not fall back to another device.
    #[test]
    fn test_missing_device_is_not_replaced() {
        let dev = Arc::new(HostDevice::new(2));
        dev.set_device(1).unwrap();
        let err = Context::new(dev.clone(), Config::default().with_device(5)).unwrap_err();
        assert!(matches!(
            err,
            Error::DeviceNotFound {
                requested: 5,
                available: 2
            }
        ));
        // Binding is left as it was
        assert_eq!(dev.current_device(), 1);
    }

    #[test]
    fn test_alloc_accounting() {
        let dev = Arc::new(HostDevice::default());
        let cx = Context::new(dev.clone(), Config::default()).unwrap();
        let a = cx.alloc(ObjectType::Image, 100).unwrap();
        let b = cx.alloc(ObjectType::Array, 28).unwrap();
        cx.release(a).unwrap();
        assert_eq!(
            cx.stats(),
            AllocStats {
                alloc_count: 2,
                alloc_size: 128,
                release_count: 1
            }
        );
        dev.inject_failure("alloc", 2);
        assert!(matches!(
            cx.alloc(ObjectType::Tensor, 8),
            Err(Error::Allocation { bytes: 8, .. })
        ));
        assert_eq!(cx.stats().alloc_count, 2);
        cx.release(b).unwrap();
    }
}
