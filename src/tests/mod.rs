mod test_fusion;

use std::sync::Arc;

use rand::{rngs::StdRng, Rng};

use crate::prelude::*;

pub fn random_bytes(rng: &mut StdRng, n: usize) -> Vec<u8> {
    (0..n).map(|_| rng.gen()).collect()
}

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::new("devsync=trace"))
        .try_init();
}

pub fn setup(config: Config) -> (Arc<HostDevice>, Graph) {
    init_logging();
    let dev = Arc::new(HostDevice::default());
    let cx = Context::new(dev.clone(), config).unwrap();
    (dev, Graph::new(cx).unwrap())
}

/// Device kernel writing `f(x)` for every byte `x` of argument 0 into argument 1
pub fn map_kernel(dev: &Arc<HostDevice>, name: &str, f: fn(u8) -> u8) -> impl Kernel {
    let dev = dev.clone();
    FnKernel::new(name, move |a: &LaunchArgs| {
        let (Some(src), Some(dst)) = (a.arg(0), a.arg(1)) else {
            return KernelStatus::Failed(1);
        };
        let (Some(src_ptr), Some(dst_ptr)) = (src.ptr, dst.ptr) else {
            return KernelStatus::Failed(2);
        };
        let Some(input) = dev.read(src_ptr, src.offset, src.size) else {
            return KernelStatus::Failed(3);
        };
        dev.with_memory(dst_ptr, |m| {
            for (o, i) in m[dst.offset..].iter_mut().zip(input) {
                *o = f(i);
            }
        });
        KernelStatus::Success
    })
}

/// Snapshot of every buffer's coherence flags
pub fn sync_state(g: &Graph) -> Vec<SyncFlags> {
    g.data.ids().map(|id| g.data[id].sync).collect()
}
