use tracing::debug;

use crate::{
    context::Context,
    data::{DataArena, DataId, DataKind, DeviceBinding, SyncFlags},
    error::{Error, Result},
};

/// Reserve device memory for a data object, `size + offset` bytes on its master.
///
/// Idempotent: buffers that already hold (or import) device memory are left alone.
/// ROI children never allocate, they alias the master at their own offset.
pub fn allocate(cx: &Context, arena: &mut DataArena, id: DataId) -> Result<()> {
    match arena[id].kind.clone() {
        DataKind::Image { .. } | DataKind::Tensor { .. } => {
            let master = arena.master_of(id);
            allocate_master(cx, arena, master)?;
            bind_regions(arena, master);
        }
        DataKind::Array { .. } | DataKind::CannyStack { .. } => {
            if arena[id].device == DeviceBinding::None {
                let bytes = arena[id].size + arena[id].offset;
                let memory = cx.alloc(arena[id].object_type(), bytes)?;
                let ptr = memory.ptr();
                arena[id].device = DeviceBinding::Owned(memory);
                // Header holds the live item count / stack top
                cx.device().memset(ptr, 0, bytes).map_err(|source| {
                    Error::Transfer {
                        object_type: arena[id].object_type(),
                        op: "memset",
                        source,
                    }
                    .report()
                })?;
            }
        }
        DataKind::Scalar | DataKind::Threshold | DataKind::Convolution => {}
        DataKind::Lut { .. } | DataKind::Remap { .. } | DataKind::Matrix { .. } => {
            allocate_master(cx, arena, id)?;
        }
        DataKind::Container { children, .. } => {
            for child in children {
                allocate(cx, arena, child)?;
            }
        }
    }
    Ok(())
}

fn allocate_master(cx: &Context, arena: &mut DataArena, id: DataId) -> Result<()> {
    if arena[id].device != DeviceBinding::None {
        return Ok(());
    }
    let data = &arena[id];
    let memory = cx.alloc(data.object_type(), data.size + data.offset)?;
    debug!(name = %data.name, bytes = memory.bytes(), "allocated device buffer");
    arena[id].device = DeviceBinding::Owned(memory);

    if let DataKind::Image { uniform: true, .. } = arena[id].kind {
        prime_uniform(cx, arena, id)?;
    }
    Ok(())
}

/// Uniform images are never committed to, so their value goes up right away.
fn prime_uniform(cx: &Context, arena: &mut DataArena, id: DataId) -> Result<()> {
    let data = &arena[id];
    let payload = data.payload().ok_or_else(|| {
        Error::MissingHostBuffer {
            object_type: data.object_type(),
            name: data.name.clone(),
        }
        .report()
    })?;
    if let Some(ptr) = data.device_ptr() {
        cx.device()
            .copy_htod(ptr, data.offset, payload)
            .map_err(|source| {
                Error::Transfer {
                    object_type: data.object_type(),
                    op: "copy_htod",
                    source,
                }
                .report()
            })?;
    }
    arena[id].sync.mark(SyncFlags::DIRTY_BY_COMMIT);
    arena[id].sync.set_synced();
    Ok(())
}

fn bind_regions(arena: &mut DataArena, master: DataId) {
    let Some(ptr) = arena[master].device_ptr() else {
        return;
    };
    for child in arena[master].roi_children.clone() {
        arena[child].device = DeviceBinding::Alias(ptr);
    }
}

/// Give back the device memory of a data object. Owned memory is freed exactly once,
/// aliases and imported memory are only unbound.
pub fn release(cx: &Context, arena: &mut DataArena, id: DataId) -> Result<()> {
    match std::mem::take(&mut arena[id].device) {
        DeviceBinding::Owned(memory) => match cx.release(memory) {
            Ok(()) => {
                for child in arena[id].roi_children.clone() {
                    arena[child].device = DeviceBinding::None;
                }
                Ok(())
            }
            Err((memory, e)) => {
                arena[id].device = DeviceBinding::Owned(memory);
                Err(e)
            }
        },
        DeviceBinding::None | DeviceBinding::Imported(_) | DeviceBinding::Alias(_) => Ok(()),
    }
}
