use std::{
    ops::{Deref, DerefMut},
    path::PathBuf,
    sync::Arc,
};

use colored::Colorize;
use itertools::Itertools;
use petgraph::stable_graph::StableGraph;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, warn};

use crate::{
    alloc::release,
    coherence,
    config::ExecutionMode,
    context::Context,
    data::{DataArena, DataId, Delay, UsageCounts},
    device::{DeviceError, StreamId},
    error::{Error, Result},
    node::{Kernel, Node},
    pipeline::{Executor, GraphPerf},
    supernode::Supernode,
};

pub type NodeGraph = StableGraph<Node, Dependency>;
pub use petgraph::stable_graph::NodeIndex;

/// A dependency between two nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// The destination reads a buffer written by the source
    Data(DataId),
    /// Explicit dependency for ordering. No buffer flows through it
    Schedule,
}

/// Nodes, the buffers they touch and the command stream they run on.
#[derive(Debug)]
pub struct Graph {
    pub cx: Arc<Context>,
    pub data: DataArena,
    pub graph: NodeGraph,
    /// Execution order. Nodes run in insertion order unless replaced
    pub schedule: Vec<NodeIndex>,
    pub supernodes: Vec<Supernode>,
    pub stream: StreamId,
    pub perf: GraphPerf,
    pub mode: ExecutionMode,
}

impl Graph {
    /// Create an empty graph with its own command stream
    pub fn new(cx: Arc<Context>) -> Result<Self> {
        let stream = cx.device().create_stream().map_err(|source| {
            Error::Runtime {
                op: "create_stream",
                source,
            }
            .report()
        })?;
        let mode = cx.config().mode;
        Ok(Self {
            cx,
            data: DataArena::new(),
            graph: NodeGraph::default(),
            schedule: vec![],
            supernodes: vec![],
            stream,
            perf: GraphPerf::default(),
            mode,
        })
    }

    /// Add a node after every node already scheduled. Reads of buffers written earlier become
    /// data dependencies.
    pub fn add_node(&mut self, node: Node) -> NodeIndex {
        let writers = node
            .bound()
            .filter(|(_, dir)| dir.reads())
            .filter_map(|(d, _)| {
                self.schedule
                    .iter()
                    .rev()
                    .find(|n| self.graph[**n].bound().any(|(w, dir)| w == d && dir.writes()))
                    .map(|n| (*n, d))
            })
            .collect_vec();
        for (d, dir) in node.bound() {
            self.data[d].usage.add(dir);
        }
        let id = self.graph.add_node(node);
        for (src, d) in writers {
            self.graph.add_edge(src, id, Dependency::Data(d));
        }
        self.schedule.push(id);
        id
    }

    pub fn add_schedule_dependency(&mut self, before: NodeIndex, after: NodeIndex) {
        self.graph.add_edge(before, after, Dependency::Schedule);
    }

    /// Replace the execution order. The order must already be valid for the dependencies.
    pub fn set_schedule(&mut self, schedule: Vec<NodeIndex>) {
        self.schedule = schedule;
    }

    /// Recount every buffer's usage over all nodes of the graph
    pub fn update_usage_counts(&mut self) {
        for id in self.data.ids().collect_vec() {
            self.data[id].usage = UsageCounts::default();
        }
        for node in self.graph.node_weights() {
            for (d, dir) in node.bound() {
                self.data[d].usage.add(dir);
            }
        }
    }

    /// Derive pipeline stages along the schedule: a node sits at the highest level of what it
    /// reads, and what it writes lands one level further.
    pub fn assign_hierarchical_levels(&mut self) {
        for n in self.schedule.clone() {
            let level = self.graph[n]
                .bound()
                .filter(|(_, dir)| dir.reads())
                .map(|(d, _)| self.data[d].hierarchical_level)
                .max()
                .unwrap_or_default();
            self.graph[n].hierarchical_level = level;
            for (d, dir) in self.graph[n].bound().collect_vec() {
                if dir.writes() && !dir.reads() {
                    self.data[d].hierarchical_level = level + 1;
                }
            }
        }
    }

    /// Start an empty fusion group and return its index
    pub fn create_supernode(&mut self, kernel: Option<Box<dyn Kernel>>) -> usize {
        let group = self.supernodes.len();
        let mut sn = Supernode::new(group);
        sn.kernel = kernel;
        self.supernodes.push(sn);
        group
    }

    /// Give a group its own command stream instead of the graph's
    pub fn attach_stream(&mut self, group: usize) -> Result<()> {
        if self.supernodes[group].stream.is_none() {
            let stream = self.cx.device().create_stream().map_err(|source| {
                Error::Runtime {
                    op: "create_stream",
                    source,
                }
                .report()
            })?;
            self.supernodes[group].stream = Some(stream);
        }
        Ok(())
    }

    pub fn merge(&mut self, group: usize, node: NodeIndex) -> Result<()> {
        self.supernodes[group].merge(node, &self.graph[node])?;
        self.graph[node].supernode = Some(group);
        Ok(())
    }

    pub fn finalize_group(&mut self, group: usize) -> Result<()> {
        self.supernodes[group].finalize_group(&self.data)
    }

    /// Validate every group and write out kernel sources when dumping is enabled
    pub fn finalize(&mut self) -> Result<()> {
        for n in self.schedule.clone() {
            self.finalize_node(n)?;
        }
        for group in 0..self.supernodes.len() {
            self.finalize_group(group)?;
        }
        Ok(())
    }

    /// Dump the node's device source to `<prefix>-0.<counter>.cu`
    pub fn finalize_node(&self, node: NodeIndex) -> Result<()> {
        let Some(prefix) = &self.cx.config().dump_kernels else {
            return Ok(());
        };
        let Some(code) = self.graph[node].kernel.device_code() else {
            return Ok(());
        };
        let path = PathBuf::from(format!(
            "{}-0.{:04}.cu",
            prefix.display(),
            self.cx.next_dump_index()
        ));
        std::fs::write(&path, code).map_err(|e| Error::from(e).report())?;
        debug!(node = %self.graph[node].name, path = %path.display(), "dumped kernel source");
        Ok(())
    }

    fn split(&mut self) -> (Executor<'_>, &mut NodeGraph, &mut [Supernode]) {
        (
            Executor {
                cx: &self.cx,
                data: &mut self.data,
                perf: &mut self.perf,
                stream: self.stream,
                mode: self.mode,
            },
            &mut self.graph,
            &mut self.supernodes,
        )
    }

    pub fn launch(&mut self, node: NodeIndex) -> Result<()> {
        let (mut ex, graph, _) = self.split();
        ex.launch(&mut graph[node])
    }

    pub fn wait(&mut self, node: NodeIndex) -> Result<()> {
        let (mut ex, graph, _) = self.split();
        ex.wait(&mut graph[node])
    }

    pub fn launch_supernode(&mut self, group: usize) -> Result<()> {
        let (mut ex, _, supernodes) = self.split();
        ex.launch_supernode(&mut supernodes[group])
    }

    pub fn wait_supernode(&mut self, group: usize) -> Result<()> {
        let (mut ex, _, supernodes) = self.split();
        ex.wait_supernode(&mut supernodes[group])
    }

    /// Run the schedule once. Members of a group run through their supernode, once per run.
    pub fn execute(&mut self) -> Result<()> {
        let mut groups_done = FxHashSet::default();
        for n in self.schedule.clone() {
            match self.graph[n].supernode {
                Some(group) => {
                    if groups_done.insert(group) {
                        self.launch_supernode(group)?;
                        self.wait_supernode(group)?;
                    }
                }
                None => {
                    self.launch(n)?;
                    self.wait(n)?;
                }
            }
        }
        Ok(())
    }

    /// Write application data into a buffer's host mirror
    pub fn commit(&mut self, id: DataId, bytes: &[u8]) -> Result<()> {
        coherence::commit(&mut self.data, id, bytes)
    }

    /// Bring a buffer's host mirror up to date and return a copy of its payload. Regions come
    /// back packed, without the master's pixels between their rows.
    pub fn read(&mut self, id: DataId) -> Result<Vec<u8>> {
        coherence::writeback(&self.cx, &mut self.data, &mut self.perf, id)?;
        self.data.gather(id).ok_or_else(|| {
            Error::MissingHostBuffer {
                object_type: self.data[id].object_type(),
                name: self.data[id].name.clone(),
            }
            .report()
        })
    }

    /// Rotate a delay ring: slot `i` now holds what slot `i - 1` held. Node parameters and
    /// group entries follow the slots.
    pub fn age_delay(&mut self, delay: &mut Delay) {
        if delay.slots.len() < 2 {
            return;
        }
        let old = delay.slots.clone();
        delay.slots.rotate_right(1);
        let remap: FxHashMap<DataId, DataId> =
            old.into_iter().zip(delay.slots.iter().copied()).collect();

        for node in self.graph.node_weights_mut() {
            for param in &mut node.params {
                if let Some(d) = param.data.as_mut() {
                    if let Some(new) = remap.get(d) {
                        *d = *new;
                    }
                }
            }
        }
        for sn in &mut self.supernodes {
            for entry in &mut sn.entries {
                if let Some(new) = remap.get(&entry.data) {
                    entry.data = *new;
                }
            }
        }
        self.update_usage_counts();
    }

    pub fn print_perf(&self) {
        println!("{:->2$} Graph Perf {:->2$}", "", "", 12);
        print!("{}", self.perf);
        let stats = self.cx.stats();
        println!(
            "{} {} buffers, {} bytes, {} released",
            "Device memory:".bold(),
            stats.alloc_count,
            stats.alloc_size,
            stats.release_count
        );
    }
}

impl Deref for Graph {
    type Target = NodeGraph;
    fn deref(&self) -> &Self::Target {
        &self.graph
    }
}

impl DerefMut for Graph {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.graph
    }
}

fn log_teardown(op: &'static str) -> impl Fn(DeviceError) {
    move |e| warn!(op, code = e.code, "teardown failed")
}

impl Drop for Graph {
    fn drop(&mut self) {
        for id in self.data.ids().collect_vec() {
            if let Err(e) = release(&self.cx, &mut self.data, id) {
                warn!(name = %self.data[id].name, "unable to release: {e}");
            }
        }
        let device = self.cx.device();
        let markers = self
            .graph
            .node_weights()
            .filter_map(|n| n.markers)
            .chain(self.supernodes.iter().filter_map(|s| s.markers))
            .flat_map(|(a, b)| [a, b]);
        for marker in markers {
            device
                .destroy_marker(marker)
                .unwrap_or_else(log_teardown("destroy_marker"));
        }
        for stream in self.supernodes.iter().filter_map(|s| s.stream) {
            device
                .destroy_stream(stream)
                .unwrap_or_else(log_teardown("destroy_stream"));
        }
        device
            .destroy_stream(self.stream)
            .unwrap_or_else(log_teardown("destroy_stream"));
    }
}
