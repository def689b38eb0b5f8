use std::time::Instant;

use tracing::trace;

use crate::{
    context::Context,
    data::{DataArena, DataId, DataKind, DeviceBinding, LutElem, SyncFlags, LUT_U8_ENTRIES},
    device::Copy2d,
    error::{Error, Result},
    pipeline::GraphPerf,
};

enum Layout {
    Flat,
    Pitched(Copy2d),
}

/// Make the device copy of `id` current before a kernel reads it.
///
/// Only host-side dirt (node or commit) triggers a copy, and only while the synced bit is clear,
/// so repeated calls without an intervening write transfer nothing.
pub fn sync_input(
    cx: &Context,
    arena: &mut DataArena,
    perf: &mut GraphPerf,
    id: DataId,
    need_access: bool,
    need_read_access: bool,
) -> Result<()> {
    // Ring slots change identity between runs
    if arena[id].is_delayed {
        arena[id].need_as_argument = true;
    }
    if !need_access {
        return Ok(());
    }
    match arena[id].kind.clone() {
        DataKind::Scalar | DataKind::Threshold | DataKind::Convolution => Ok(()),
        DataKind::Image { .. } | DataKind::Tensor { .. } => {
            let master = arena.master_of(id);
            if let DeviceBinding::Imported(_) = arena[master].device {
                arena[id].need_as_argument = true;
                return Ok(());
            }
            if need_read_access {
                upload(cx, arena, perf, master, Layout::Flat)?;
            }
            Ok(())
        }
        DataKind::Array {
            item_size,
            num_items,
            ..
        } => {
            if !need_read_access {
                return Ok(());
            }
            if num_items * item_size > 0 {
                upload(cx, arena, perf, id, Layout::Flat)
            } else {
                if arena[id].sync.needs_upload() {
                    arena[id].sync.set_synced();
                }
                Ok(())
            }
        }
        DataKind::CannyStack { .. } => {
            if need_read_access {
                return Err(unsupported(arena, id, "sync_input"));
            }
            Ok(())
        }
        DataKind::Lut { elem, .. } if need_read_access => {
            let layout = match elem {
                LutElem::U8 => Layout::Pitched(Copy2d {
                    dst_pitch: LUT_U8_ENTRIES,
                    src_pitch: LUT_U8_ENTRIES,
                    width: LUT_U8_ENTRIES,
                    height: 1,
                }),
                LutElem::I16 => Layout::Flat,
            };
            upload(cx, arena, perf, id, layout)
        }
        DataKind::Remap { .. } | DataKind::Matrix { .. } if need_read_access => {
            upload(cx, arena, perf, id, Layout::Flat)
        }
        DataKind::Lut { .. } | DataKind::Remap { .. } | DataKind::Matrix { .. } => Ok(()),
        DataKind::Container { .. } => Err(unsupported(arena, id, "sync_input")),
    }
}

fn unsupported(arena: &DataArena, id: DataId, op: &'static str) -> Error {
    Error::UnsupportedObjectType {
        object_type: arena[id].object_type(),
        op,
        name: arena[id].name.clone(),
    }
    .report()
}

fn missing_host(arena: &DataArena, id: DataId) -> Error {
    Error::MissingHostBuffer {
        object_type: arena[id].object_type(),
        name: arena[id].name.clone(),
    }
    .report()
}

fn upload(
    cx: &Context,
    arena: &mut DataArena,
    perf: &mut GraphPerf,
    id: DataId,
    layout: Layout,
) -> Result<()> {
    let data = &arena[id];
    if !data.sync.needs_upload() {
        return Ok(());
    }
    // Not resident yet, the copy happens once memory exists
    let Some(ptr) = data.device_ptr() else {
        return Ok(());
    };
    let payload = data.payload().ok_or_else(|| missing_host(arena, id))?;

    let start = Instant::now();
    let (op, res) = match layout {
        Layout::Flat => ("copy_htod", cx.device().copy_htod(ptr, data.offset, payload)),
        Layout::Pitched(shape) => (
            "copy_htod_2d",
            cx.device().copy_htod_2d(ptr, data.offset, payload, shape),
        ),
    };
    res.map_err(|source| {
        Error::Transfer {
            object_type: data.object_type(),
            op,
            source,
        }
        .report()
    })?;
    perf.buffer_write += start.elapsed();
    trace!(name = %data.name, bytes = data.size, op, "uploaded");

    arena[id].sync.set_synced();
    Ok(())
}

/// Write application data into the host mirror and flag the device copy stale.
///
/// Region children write into their master's mirror row by row, leaving the pixels between
/// rows alone. `bytes` is the region packed without gaps.
/// Arrays take the item count from the number of whole items written.
pub fn commit(arena: &mut DataArena, id: DataId, bytes: &[u8]) -> Result<()> {
    if let DataKind::Container { .. } = arena[id].kind {
        return Err(unsupported(arena, id, "commit"));
    }
    let master = arena.master_of(id);
    let (spans, size) = (arena[id].spans(), arena[id].packed_len());
    if bytes.len() > size {
        return Err(Error::OutOfBounds {
            name: arena[id].name.clone(),
            len: bytes.len(),
            size,
        }
        .report());
    }
    let num_items = match arena[id].kind {
        DataKind::Array { item_size, .. } => Some(bytes.len() / item_size.max(1)),
        _ => None,
    };
    let host = match arena[master].host.as_mut() {
        Some(host) => host,
        None => return Err(missing_host(arena, master)),
    };
    let mut rest = bytes;
    for span in spans {
        if rest.is_empty() {
            break;
        }
        let n = rest.len().min(span.len());
        host[span.start..span.start + n].copy_from_slice(&rest[..n]);
        rest = &rest[n..];
    }
    if let Some(n) = num_items {
        host[..4].copy_from_slice(&(n as u32).to_le_bytes());
        if let DataKind::Array { num_items, .. } = &mut arena[id].kind {
            *num_items = n;
        }
    }
    arena[master].sync.mark(SyncFlags::DIRTY_BY_COMMIT);
    Ok(())
}

/// Copy the device result back into the host mirror if the device holds the newer copy.
pub fn writeback(
    cx: &Context,
    arena: &mut DataArena,
    perf: &mut GraphPerf,
    id: DataId,
) -> Result<()> {
    let master = arena.master_of(id);
    let data = &arena[master];
    if !data.sync.needs_download() {
        return Ok(());
    }
    let Some(ptr) = data.device_ptr() else {
        return Ok(());
    };
    let (offset, size, object_type) = (data.offset, data.size, data.object_type());
    let host = match arena[master].host.as_mut() {
        Some(host) => host,
        None => return Err(missing_host(arena, master)),
    };

    let start = Instant::now();
    cx.device()
        .copy_dtoh(ptr, offset, &mut host[offset..offset + size])
        .map_err(|source| {
            Error::Transfer {
                object_type,
                op: "copy_dtoh",
                source,
            }
            .report()
        })?;
    perf.buffer_read += start.elapsed();
    arena[master].sync.set_synced();
    Ok(())
}
