use itertools::Itertools;
use petgraph::stable_graph::NodeIndex;
use tracing::debug;

use crate::{
    data::{DataArena, DataId, DataKind, ObjectType, UsageCounts},
    device::{MarkerId, StreamId},
    error::{Error, Result},
    node::{Direction, Kernel, LaunchState, Node, Target},
};

/// A buffer taking part in a fused group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupernodeEntry {
    pub data: DataId,
    /// Usage accumulated over the nodes of the group
    pub usage: UsageCounts,
    /// Cleared when the buffer never escapes the group
    pub needed_as_argument: bool,
    /// Contents are thrown away after the launch, never marked dirty
    pub discard: bool,
}

/// Several nodes fused into one device launch
#[derive(Debug)]
pub struct Supernode {
    pub group: usize,
    pub nodes: Vec<NodeIndex>,
    pub levels: Vec<u32>,
    pub entries: Vec<SupernodeEntry>,
    /// Common size of the images written by the group
    pub width: u32,
    pub height: u32,
    pub hierarchical_level_start: u32,
    pub hierarchical_level_end: u32,
    pub kernel: Option<Box<dyn Kernel>>,
    pub markers: Option<(MarkerId, MarkerId)>,
    pub state: LaunchState,
    /// Auxiliary stream owned by the group
    pub stream: Option<StreamId>,
}

impl Supernode {
    pub fn new(group: usize) -> Self {
        Self {
            group,
            nodes: vec![],
            levels: vec![],
            entries: vec![],
            width: 0,
            height: 0,
            hierarchical_level_start: 0,
            hierarchical_level_end: 0,
            kernel: None,
            markers: None,
            state: LaunchState::Idle,
            stream: None,
        }
    }

    pub fn with_kernel(mut self, kernel: impl Kernel + 'static) -> Self {
        self.kernel = Some(Box::new(kernel));
        self
    }

    pub fn entry(&self, data: DataId) -> Option<&SupernodeEntry> {
        self.entries.iter().find(|e| e.data == data)
    }

    /// Flag a buffer whose contents nobody reads after the group ran
    pub fn discard(&mut self, data: DataId) {
        if let Some(e) = self.entries.iter_mut().find(|e| e.data == data) {
            e.discard = true;
        }
    }

    /// Append a node's parameters, deduplicating buffers and accumulating their usage.
    pub fn merge(&mut self, index: NodeIndex, node: &Node) -> Result<()> {
        if node.kernel.target() != Target::Device {
            return Err(Error::UnsupportedKernel {
                kernel: node.name.clone(),
            }
            .report());
        }
        self.nodes.push(index);
        self.levels.push(node.hierarchical_level);
        for (data, direction) in node.bound() {
            let pos = match self.entries.iter().position(|e| e.data == data) {
                Some(pos) => pos,
                None => {
                    self.entries.push(SupernodeEntry {
                        data,
                        usage: UsageCounts::default(),
                        needed_as_argument: true,
                        discard: false,
                    });
                    self.entries.len() - 1
                }
            };
            self.entries[pos].usage.add(direction);
        }
        Ok(())
    }

    /// Validate the group and elide buffers internal to it.
    ///
    /// Nothing is modified when validation fails.
    pub fn finalize_group(&mut self, arena: &DataArena) -> Result<()> {
        // Images only written inside the group must agree on their size
        let dims = self
            .entries
            .iter()
            .filter(|e| {
                e.usage.get(Direction::Input) == 0 && e.usage.get(Direction::Bidirectional) == 0
            })
            .filter_map(|e| match arena[e.data].kind {
                DataKind::Image { width, height, .. } => Some((width, height)),
                _ => None,
            })
            .collect_vec();
        if let Some(&expected) = dims.first() {
            if let Some(&found) = dims.iter().find(|d| **d != expected) {
                return Err(Error::DimensionMismatch {
                    group: self.group,
                    expected,
                    found,
                }
                .report());
            }
        }

        let max_input = self
            .entries
            .iter()
            .filter(|e| e.usage.reads() && !e.usage.writes())
            .map(|e| arena[e.data].hierarchical_level)
            .max();
        let min_output = self
            .entries
            .iter()
            .filter(|e| e.usage.writes())
            .map(|e| arena[e.data].hierarchical_level)
            .min();
        if let (Some(max_input), Some(min_output)) = (max_input, min_output) {
            if max_input > min_output {
                return Err(Error::HierarchyViolation {
                    group: self.group,
                    max_input,
                    min_output,
                }
                .report());
            }
        }

        for entry in &mut self.entries {
            let data = &arena[entry.data];
            // Delay slots change identity between runs and are always passed
            if data.is_virtual
                && !data.is_delayed
                && data.object_type() != ObjectType::Scalar
                && data.usage == entry.usage
            {
                entry.needed_as_argument = false;
            }
        }
        (self.width, self.height) = dims.first().copied().unwrap_or_default();
        self.hierarchical_level_start = self.levels.iter().copied().min().unwrap_or_default();
        self.hierarchical_level_end = self.levels.iter().copied().max().unwrap_or_default();
        debug!(
            group = self.group,
            nodes = self.nodes.len(),
            internal = self.entries.iter().filter(|e| !e.needed_as_argument).count(),
            "finalized supernode"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FnKernel, KernelStatus, Param};

    fn node(name: &str, level: u32, params: Vec<Param>) -> Node {
        let mut node = Node::new(FnKernel::new(name, |_| KernelStatus::Success), params);
        node.hierarchical_level = level;
        node
    }

    /// Graph-wide usage, normally computed by the graph
    fn count_usage(arena: &mut DataArena, nodes: &[&Node]) {
        for n in nodes {
            for (d, dir) in n.bound() {
                arena[d].usage.add(dir);
            }
        }
    }

    #[test]
    fn test_merge_dedups() {
        let mut arena = DataArena::new();
        let a = arena.image("a", 4, 4, 1);
        let b = arena.image("b", 4, 4, 1);
        let n0 = node("n0", 0, vec![Param::input(a), Param::output(b)]);
        let n1 = node("n1", 1, vec![Param::input(b), Param::bidirectional(a)]);
        let mut sn = Supernode::new(0);
        sn.merge(NodeIndex::new(0), &n0).unwrap();
        sn.merge(NodeIndex::new(1), &n1).unwrap();
        assert_eq!(sn.entries.len(), 2);
        assert_eq!(sn.entry(a).unwrap().usage, UsageCounts([1, 0, 1]));
        assert_eq!(sn.entry(b).unwrap().usage, UsageCounts([1, 1, 0]));
        assert!(sn.entries.iter().all(|e| e.needed_as_argument));
    }

    #[test]
    fn test_host_kernel_rejected() {
        let mut sn = Supernode::new(0);
        let n = Node::new(
            FnKernel::new("cpu", |_| KernelStatus::Success).on_host(),
            vec![],
        );
        assert!(matches!(
            sn.merge(NodeIndex::new(0), &n),
            Err(Error::UnsupportedKernel { .. })
        ));
        assert!(sn.nodes.is_empty());
    }

    #[test]
    fn test_escape_analysis() {
        let mut arena = DataArena::new();
        let src = arena.image("src", 8, 8, 1);
        let tmp = arena.image("tmp", 8, 8, 1);
        arena[tmp].is_virtual = true;
        let dst = arena.image("dst", 8, 8, 1);
        let n0 = node("n0", 0, vec![Param::input(src), Param::output(tmp)]);
        let n1 = node("n1", 1, vec![Param::input(tmp), Param::output(dst)]);
        count_usage(&mut arena, &[&n0, &n1]);

        let mut sn = Supernode::new(3);
        sn.merge(NodeIndex::new(0), &n0).unwrap();
        sn.merge(NodeIndex::new(1), &n1).unwrap();
        sn.finalize_group(&arena).unwrap();
        assert!(!sn.entry(tmp).unwrap().needed_as_argument);
        assert!(sn.entry(src).unwrap().needed_as_argument);
        assert!(sn.entry(dst).unwrap().needed_as_argument);
        assert_eq!((sn.width, sn.height), (8, 8));
        assert_eq!(
            (sn.hierarchical_level_start, sn.hierarchical_level_end),
            (0, 1)
        );
    }

    #[test]
    fn test_escaping_buffer_kept() {
        let mut arena = DataArena::new();
        let src = arena.image("src", 8, 8, 1);
        let tmp = arena.image("tmp", 8, 8, 1);
        arena[tmp].is_virtual = true;
        let d0 = arena.image("d0", 8, 8, 1);
        let d1 = arena.image("d1", 8, 8, 1);
        let n0 = node("n0", 0, vec![Param::input(src), Param::output(tmp)]);
        let n1 = node("n1", 1, vec![Param::input(tmp), Param::output(d0)]);
        let n2 = node("n2", 1, vec![Param::input(d0), Param::output(d1)]);
        // Consumer outside the group
        let outside = node("outside", 2, vec![Param::input(tmp)]);
        count_usage(&mut arena, &[&n0, &n1, &n2, &outside]);

        let mut sn = Supernode::new(0);
        for (i, n) in [&n0, &n1, &n2].into_iter().enumerate() {
            sn.merge(NodeIndex::new(i), n).unwrap();
        }
        sn.finalize_group(&arena).unwrap();
        assert!(sn.entry(tmp).unwrap().needed_as_argument);
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut arena = DataArena::new();
        let src = arena.image("src", 8, 8, 1);
        let a = arena.image("a", 8, 8, 1);
        let b = arena.image("b", 16, 8, 1);
        arena[a].is_virtual = true;
        let n = node(
            "n",
            0,
            vec![Param::input(src), Param::output(a), Param::output(b)],
        );
        count_usage(&mut arena, &[&n]);
        let mut sn = Supernode::new(1);
        sn.merge(NodeIndex::new(0), &n).unwrap();
        let err = sn.finalize_group(&arena).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                group: 1,
                expected: (8, 8),
                found: (16, 8)
            }
        ));
        assert!(sn.entries.iter().all(|e| e.needed_as_argument));
        assert_eq!((sn.width, sn.height), (0, 0));
    }

    #[test]
    fn test_hierarchy_violation() {
        let mut arena = DataArena::new();
        let late = arena.image("late", 4, 4, 1);
        arena[late].hierarchical_level = 3;
        let early = arena.image("early", 4, 4, 1);
        arena[early].hierarchical_level = 1;
        let n = node("n", 0, vec![Param::input(late), Param::output(early)]);
        let mut sn = Supernode::new(2);
        sn.merge(NodeIndex::new(0), &n).unwrap();
        assert!(matches!(
            sn.finalize_group(&arena),
            Err(Error::HierarchyViolation {
                max_input: 3,
                min_output: 1,
                ..
            })
        ));
    }
}
