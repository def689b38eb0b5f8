use std::time::Instant;

use tracing::trace;

use crate::{
    context::Context,
    data::{DataArena, DataId, DataKind, SyncFlags},
    error::{Error, Result},
    pipeline::GraphPerf,
};

/// Record that a kernel left the authoritative copy of `id` on the device.
///
/// Pure state transition: the device to host copy waits until someone reads.
pub fn mark_output_dirty(
    arena: &mut DataArena,
    id: DataId,
    need_access: bool,
    need_write_access: bool,
) {
    if !(need_access && need_write_access) {
        return;
    }
    let target = match arena[id].kind {
        DataKind::Image { .. } | DataKind::Tensor { .. } => arena.master_of(id),
        DataKind::Array { .. } | DataKind::Matrix { .. } => id,
        _ => return,
    };
    arena[target].sync.mark(SyncFlags::DIRTY_BY_NODE_REMOTE);
}

/// Pull the device-side item count (or stack top) of an array-like object back to the host.
///
/// The whole allocation, header included, lands in the host mirror. The count is stored as
/// reported, clamping is left to the caller.
pub fn readback(
    cx: &Context,
    arena: &mut DataArena,
    perf: &mut GraphPerf,
    id: DataId,
) -> Result<()> {
    if !matches!(
        arena[id].kind,
        DataKind::Array { .. } | DataKind::CannyStack { .. }
    ) {
        return Ok(());
    }
    let Some(ptr) = arena[id].device_ptr() else {
        return Ok(());
    };
    let object_type = arena[id].object_type();
    let bytes = arena[id].offset + arena[id].size;
    let Some(host) = arena[id].host.as_mut() else {
        return Err(Error::MissingHostBuffer {
            object_type,
            name: arena[id].name.clone(),
        }
        .report());
    };

    let start = Instant::now();
    cx.device()
        .copy_dtoh(ptr, 0, &mut host[..bytes])
        .map_err(|source| {
            Error::Transfer {
                object_type,
                op: "copy_dtoh",
                source,
            }
            .report()
        })?;
    perf.buffer_read += start.elapsed();
    let count = u32::from_le_bytes([host[0], host[1], host[2], host[3]]);

    let data = &mut arena[id];
    match &mut data.kind {
        DataKind::Array { num_items, .. } => *num_items = count as usize,
        DataKind::CannyStack { stack_top, .. } => *stack_top = count,
        _ => {}
    }
    data.sync.set_synced();
    trace!(name = %data.name, count, "read back item count");
    Ok(())
}
