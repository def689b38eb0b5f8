use std::{fmt::Display, time::Duration};

use colored::Colorize;
use itertools::Itertools;
use tracing::{debug, trace};

use crate::{
    alloc::allocate,
    coherence::sync_input,
    config::ExecutionMode,
    context::Context,
    data::{DataArena, DataId, DataKind},
    device::{DeviceError, MarkerId, StreamId},
    error::{Error, Result},
    node::{Direction, KernelArg, KernelStatus, LaunchArgs, LaunchState, Node},
    output::{mark_output_dirty, readback},
    supernode::{Supernode, SupernodeEntry},
};

/// Time accumulated by a graph across runs
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GraphPerf {
    /// Milliseconds between start and stop markers at launch
    pub kernel_enqueue: f32,
    /// Milliseconds between start and stop markers once completed
    pub kernel_wait: f32,
    pub buffer_write: Duration,
    pub buffer_read: Duration,
}

fn pretty_duration(d: Duration) -> String {
    if d.as_secs() > 0 {
        format!("{:.2}s", d.as_secs_f32())
    } else if d.as_millis() > 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}µs", d.as_micros())
    }
}

impl Display for GraphPerf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rows = [
            ("Kernel enqueue", format!("{:.3}ms", self.kernel_enqueue)),
            ("Kernel wait", format!("{:.3}ms", self.kernel_wait)),
            ("Buffer write", pretty_duration(self.buffer_write)),
            ("Buffer read", pretty_duration(self.buffer_read)),
        ];
        for (name, value) in rows {
            writeln!(
                f,
                "{}{:.>2$}",
                name.bold().bright_green(),
                value.bold(),
                32 - name.len()
            )?;
        }
        Ok(())
    }
}

fn runtime(op: &'static str) -> impl FnOnce(DeviceError) -> Error {
    move |source| Error::Runtime { op, source }.report()
}

fn check_status(kernel: &str, status: KernelStatus) -> Result<()> {
    match status {
        KernelStatus::Success => Ok(()),
        KernelStatus::NotImplemented => Err(Error::NotImplemented {
            kernel: kernel.to_string(),
        }
        .report()),
        KernelStatus::Failed(status) => Err(Error::KernelFailed {
            kernel: kernel.to_string(),
            status,
        }
        .report()),
    }
}

/// Runs the launch/wait pair for nodes and supernodes of one graph.
///
/// Everything is enqueued on `stream`; only `wait` blocks, unless the mode flushes each node.
pub struct Executor<'a> {
    pub cx: &'a Context,
    pub data: &'a mut DataArena,
    pub perf: &'a mut GraphPerf,
    pub stream: StreamId,
    pub mode: ExecutionMode,
}

impl Executor<'_> {
    fn markers(&self, slot: &mut Option<(MarkerId, MarkerId)>) -> Result<(MarkerId, MarkerId)> {
        if let Some(markers) = *slot {
            return Ok(markers);
        }
        let device = self.cx.device();
        let start = device.create_marker().map_err(runtime("create_marker"))?;
        let stop = device.create_marker().map_err(runtime("create_marker"))?;
        *slot = Some((start, stop));
        Ok((start, stop))
    }

    fn arg(&self, data: DataId, direction: Direction, need_access: bool) -> KernelArg {
        let d = &self.data[data];
        KernelArg {
            data,
            object_type: d.object_type(),
            ptr: if need_access { d.device_ptr() } else { None },
            offset: d.offset,
            size: d.size,
            num_items: d.num_items(),
            direction,
        }
    }

    /// Elapsed time between two markers. Markers that cannot be timed yet are skipped.
    fn elapsed(&self, (start, stop): (MarkerId, MarkerId)) -> f32 {
        self.cx.device().elapsed_ms(start, stop).unwrap_or_default()
    }

    /// Entries elided by fusion stay off the argument list unless the buffer itself insists
    fn needed(&self, entry: &SupernodeEntry) -> bool {
        entry.needed_as_argument || self.data[entry.data].need_as_argument
    }

    fn clamp_items(&mut self, id: DataId) {
        if let DataKind::Array {
            capacity,
            num_items,
            ..
        } = &mut self.data[id].kind
        {
            *num_items = (*num_items).min(*capacity);
        }
    }

    /// Sync inputs, enqueue the kernel and mark what it writes as dirty on the device.
    pub fn launch(&mut self, node: &mut Node) -> Result<()> {
        let bound = node.bound().collect_vec();
        for &(id, direction) in &bound {
            allocate(self.cx, self.data, id)?;
            sync_input(self.cx, self.data, self.perf, id, true, direction.reads())?;
        }

        let device = self.cx.device();
        let markers = self.markers(&mut node.markers)?;
        device
            .record_marker(markers.0, self.stream)
            .map_err(runtime("record_marker"))?;

        let args = node
            .params
            .iter()
            .map(|p| p.data.map(|d| self.arg(d, p.direction, true)))
            .collect_vec();
        let status = node.kernel.execute(&LaunchArgs {
            device,
            stream: self.stream,
            args: &args,
        });
        check_status(&node.name, status)?;

        if self.mode == ExecutionMode::FlushEachNode {
            device
                .synchronize(self.stream)
                .map_err(runtime("synchronize"))?;
        }
        device
            .record_marker(markers.1, self.stream)
            .map_err(runtime("record_marker"))?;
        self.perf.kernel_enqueue += self.elapsed(markers);

        for (id, direction) in bound {
            mark_output_dirty(self.data, id, true, direction.writes());
        }
        node.state = LaunchState::Launched;
        trace!(node = %node.name, "launched");
        Ok(())
    }

    /// Block on the node's stop marker, then pull back device-side item counts.
    pub fn wait(&mut self, node: &mut Node) -> Result<()> {
        let markers = match (node.state, node.markers) {
            (LaunchState::Launched, Some(markers)) => markers,
            _ => {
                return Err(Error::NotLaunched {
                    name: node.name.clone(),
                }
                .report())
            }
        };
        self.cx
            .device()
            .wait_marker(markers.1)
            .map_err(runtime("wait_marker"))?;
        self.perf.kernel_wait += self.elapsed(markers);

        for (id, direction) in node.bound().collect_vec() {
            if direction.writes() {
                readback(self.cx, self.data, self.perf, id)?;
                self.clamp_items(id);
            }
        }
        node.state = LaunchState::Completed;
        Ok(())
    }

    /// Launch a fused group. Only entries still needed as arguments are synced and passed.
    pub fn launch_supernode(&mut self, sn: &mut Supernode) -> Result<()> {
        let Some(kernel) = sn.kernel.as_mut() else {
            return Err(Error::NotImplemented {
                kernel: format!("supernode#{}", sn.group),
            }
            .report());
        };
        for entry in &sn.entries {
            let needed = self.needed(entry);
            if needed {
                allocate(self.cx, self.data, entry.data)?;
            }
            sync_input(
                self.cx,
                self.data,
                self.perf,
                entry.data,
                needed,
                entry.usage.reads(),
            )?;
        }

        let device = self.cx.device();
        let stream = sn.stream.unwrap_or(self.stream);
        let markers = self.markers(&mut sn.markers)?;
        device
            .record_marker(markers.0, stream)
            .map_err(runtime("record_marker"))?;

        let args = sn
            .entries
            .iter()
            .map(|e| {
                let direction = match (e.usage.reads(), e.usage.writes()) {
                    (true, true) => Direction::Bidirectional,
                    (false, true) => Direction::Output,
                    _ => Direction::Input,
                };
                Some(self.arg(e.data, direction, self.needed(e)))
            })
            .collect_vec();
        let status = kernel.execute(&LaunchArgs {
            device,
            stream,
            args: &args,
        });
        check_status(kernel.name(), status)?;

        device
            .record_marker(markers.1, stream)
            .map_err(runtime("record_marker"))?;
        self.perf.kernel_enqueue += self.elapsed(markers);

        for entry in sn.entries.iter().filter(|e| !e.discard) {
            let needed = self.needed(entry);
            mark_output_dirty(self.data, entry.data, needed, entry.usage.writes());
        }
        sn.state = LaunchState::Launched;
        debug!(group = sn.group, nodes = sn.nodes.len(), "launched supernode");
        Ok(())
    }

    pub fn wait_supernode(&mut self, sn: &mut Supernode) -> Result<()> {
        let markers = match (sn.state, sn.markers) {
            (LaunchState::Launched, Some(markers)) => markers,
            _ => {
                return Err(Error::NotLaunched {
                    name: format!("supernode#{}", sn.group),
                }
                .report())
            }
        };
        self.cx
            .device()
            .wait_marker(markers.1)
            .map_err(runtime("wait_marker"))?;
        self.perf.kernel_wait += self.elapsed(markers);

        for entry in &sn.entries {
            if self.needed(entry) && entry.usage.writes() {
                readback(self.cx, self.data, self.perf, entry.data)?;
                self.clamp_items(entry.data);
            }
        }
        sn.state = LaunchState::Completed;
        Ok(())
    }
}
