use std::{cell::Cell, rc::Rc, sync::Arc};

use super::{map_kernel, setup, sync_state};
use crate::prelude::*;

/// Fused `dst = (src + 1) * 2` over entries `[src, tmp, dst]`, refusing a materialized `tmp`
fn fused_inc_double(dev: &Arc<HostDevice>, calls: Rc<Cell<usize>>) -> Box<dyn Kernel> {
    let dev = dev.clone();
    Box::new(FnKernel::new("inc_double", move |a: &LaunchArgs| {
        calls.set(calls.get() + 1);
        let (Some(src), Some(tmp), Some(dst)) = (a.arg(0), a.arg(1), a.arg(2)) else {
            return KernelStatus::Failed(1);
        };
        if tmp.ptr.is_some() {
            return KernelStatus::Failed(2);
        }
        let input = dev.read(src.ptr.unwrap(), src.offset, src.size).unwrap();
        dev.with_memory(dst.ptr.unwrap(), |m| {
            for (o, i) in m.iter_mut().zip(input) {
                *o = (i + 1) * 2;
            }
        });
        KernelStatus::Success
    }))
}

#[test]
fn test_fused_pair_elides_intermediate() {
    let (dev, mut g) = setup(Config::default());
    let src = g.data.image("src", 8, 8, 1);
    let tmp = g.data.image("tmp", 8, 8, 1);
    g.data[tmp].is_virtual = true;
    let dst = g.data.image("dst", 8, 8, 1);
    g.commit(src, &[10; 64]).unwrap();
    let n0 = g.add_node(Node::new(
        map_kernel(&dev, "inc", |x| x + 1),
        vec![Param::input(src), Param::output(tmp)],
    ));
    let n1 = g.add_node(Node::new(
        map_kernel(&dev, "double", |x| x * 2),
        vec![Param::input(tmp), Param::output(dst)],
    ));
    g.assign_hierarchical_levels();

    let calls = Rc::new(Cell::new(0));
    let group = g.create_supernode(Some(fused_inc_double(&dev, calls.clone())));
    g.merge(group, n0).unwrap();
    g.merge(group, n1).unwrap();
    g.finalize().unwrap();
    let sn = &g.supernodes[group];
    assert!(!sn.entry(tmp).unwrap().needed_as_argument);
    assert!(sn.entry(src).unwrap().needed_as_argument);
    assert_eq!(
        (sn.hierarchical_level_start, sn.hierarchical_level_end),
        (0, 1)
    );

    g.execute().unwrap();
    g.execute().unwrap();
    assert_eq!(calls.get(), 2);
    assert_eq!(g[n0].state, LaunchState::Idle);
    // The intermediate never reaches the device
    assert!(g.data[tmp].device_ptr().is_none());
    assert_eq!(g.cx.stats().alloc_count, 2);
    assert_eq!(dev.stats().htod_copies, 1);
    assert_eq!(g.read(dst).unwrap(), &[22; 64]);
}

#[test]
fn test_escaping_buffer_stays_argument() {
    let (dev, mut g) = setup(Config::default());
    let src = g.data.image("src", 8, 8, 1);
    let [tmp, d0] = ["tmp", "d0"].map(|name| {
        let id = g.data.image(name, 8, 8, 1);
        g.data[id].is_virtual = true;
        id
    });
    let d1 = g.data.image("d1", 8, 8, 1);
    let out = g.data.image("out", 8, 8, 1);
    let nodes = [(src, tmp), (tmp, d0), (d0, d1)]
        .map(|(i, o)| g.add_node(Node::new(map_kernel(&dev, "k", |x| x), vec![Param::input(i), Param::output(o)])));
    g.add_node(Node::new(
        map_kernel(&dev, "outside", |x| x),
        vec![Param::input(tmp), Param::output(out)],
    ));

    let group = g.create_supernode(None);
    for n in nodes {
        g.merge(group, n).unwrap();
    }
    g.finalize_group(group).unwrap();
    let sn = &g.supernodes[group];
    assert!(sn.entry(tmp).unwrap().needed_as_argument);
    assert!(!sn.entry(d0).unwrap().needed_as_argument);
    assert_eq!(sn.entry(tmp).unwrap().usage, UsageCounts([1, 1, 0]));
    assert_eq!(g.data[tmp].usage, UsageCounts([2, 1, 0]));
}

#[test]
fn test_dimension_mismatch_leaves_state() {
    let (dev, mut g) = setup(Config::default());
    let src = g.data.image("src", 8, 8, 1);
    let narrow = g.data.image("narrow", 8, 8, 1);
    let wide = g.data.image("wide", 12, 8, 1);
    g.data[narrow].is_virtual = true;
    g.commit(src, &[1; 64]).unwrap();
    let a = g.add_node(Node::new(
        map_kernel(&dev, "a", |x| x),
        vec![Param::input(src), Param::output(narrow)],
    ));
    let b = g.add_node(Node::new(
        map_kernel(&dev, "b", |x| x),
        vec![Param::input(src), Param::output(wide)],
    ));
    let group = g.create_supernode(None);
    g.merge(group, a).unwrap();
    g.merge(group, b).unwrap();

    let flags = sync_state(&g);
    let entries = g.supernodes[group].entries.clone();
    let err = g.finalize().unwrap_err();
    assert!(matches!(
        err,
        Error::DimensionMismatch {
            expected: (8, 8),
            found: (12, 8),
            ..
        }
    ));
    assert_eq!(sync_state(&g), flags);
    assert_eq!(g.supernodes[group].entries, entries);
}

#[test]
fn test_hierarchy_violation_rejected_at_finalize() {
    let (dev, mut g) = setup(Config::default());
    let [a, b, c, d] = ["a", "b", "c", "d"].map(|name| g.data.image(name, 4, 4, 1));
    let early = g.add_node(Node::new(
        map_kernel(&dev, "early", |x| x),
        vec![Param::input(a), Param::output(b)],
    ));
    g.add_node(Node::new(
        map_kernel(&dev, "between", |x| x),
        vec![Param::input(b), Param::output(c)],
    ));
    let late = g.add_node(Node::new(
        map_kernel(&dev, "late", |x| x),
        vec![Param::input(c), Param::output(d)],
    ));
    g.assign_hierarchical_levels();

    // `late` reads what `between` produces from the group's own output
    let group = g.create_supernode(None);
    g.merge(group, early).unwrap();
    g.merge(group, late).unwrap();
    let err = g.finalize().unwrap_err();
    assert!(matches!(
        err,
        Error::HierarchyViolation {
            max_input: 2,
            min_output: 1,
            ..
        }
    ));
    let sn = &g.supernodes[group];
    assert!(sn.entries.iter().all(|e| e.needed_as_argument));
    assert_eq!(
        (sn.hierarchical_level_start, sn.hierarchical_level_end),
        (0, 0)
    );
}

#[test]
fn test_fused_delay_slot_stays_argument() {
    let (dev, mut g) = setup(Config::default());
    let src = g.data.image("src", 4, 4, 1);
    let slots = ["d0", "d1"].map(|name| {
        let id = g.data.image(name, 4, 4, 1);
        g.data[id].is_virtual = true;
        id
    });
    let mut delay = g.data.delay(slots.to_vec());
    let dst = g.data.image("dst", 4, 4, 1);
    g.commit(src, &[3; 16]).unwrap();
    let n0 = g.add_node(Node::new(
        map_kernel(&dev, "inc", |x| x + 1),
        vec![Param::input(src), Param::output(slots[0])],
    ));
    let n1 = g.add_node(Node::new(
        map_kernel(&dev, "copy", |x| x),
        vec![Param::input(slots[0]), Param::output(dst)],
    ));

    let calls = Rc::new(Cell::new(0));
    let counter = calls.clone();
    let fused_dev = dev.clone();
    let fused = FnKernel::new("inc_copy", move |a: &LaunchArgs| {
        let (Some(src), Some(slot), Some(dst)) = (a.arg(0), a.arg(1), a.arg(2)) else {
            return KernelStatus::Failed(1);
        };
        let (Some(input), Some(slot_ptr), Some(dst_ptr)) = (src.ptr, slot.ptr, dst.ptr) else {
            return KernelStatus::Failed(2);
        };
        counter.set(counter.get() + 1);
        let input = fused_dev.read(input, src.offset, src.size).unwrap();
        for ptr in [slot_ptr, dst_ptr] {
            fused_dev.with_memory(ptr, |m| {
                for (o, i) in m.iter_mut().zip(&input) {
                    *o = i + 1;
                }
            });
        }
        KernelStatus::Success
    });
    let group = g.create_supernode(Some(Box::new(fused)));
    g.merge(group, n0).unwrap();
    g.merge(group, n1).unwrap();
    g.finalize().unwrap();
    // Virtual and internal to the group, yet kept for the ring
    assert!(g.supernodes[group].entry(slots[0]).unwrap().needed_as_argument);

    g.execute().unwrap();
    assert_eq!(calls.get(), 1);
    assert!(g.data[slots[0]].need_as_argument);
    assert_eq!(g.read(slots[0]).unwrap(), &[4; 16]);

    g.age_delay(&mut delay);
    assert!(g.supernodes[group].entry(slots[1]).is_some());
    g.commit(src, &[7; 16]).unwrap();
    g.execute().unwrap();
    assert_eq!(calls.get(), 2);
    assert_eq!(g.read(slots[1]).unwrap(), &[8; 16]);
    assert_eq!(g.read(dst).unwrap(), &[8; 16]);
    // The previous run's slot is left alone
    assert_eq!(g.read(slots[0]).unwrap(), &[4; 16]);
}

#[test]
fn test_discarded_entry_not_dirtied() {
    let (dev, mut g) = setup(Config::default());
    let src = g.data.image("src", 4, 4, 1);
    let scratch = g.data.image("scratch", 4, 4, 1);
    let dst = g.data.image("dst", 4, 4, 1);
    let n = g.add_node(Node::new(
        FnKernel::new("two_outputs", |_| KernelStatus::Success),
        vec![Param::input(src), Param::output(scratch), Param::output(dst)],
    ));
    let fused = FnKernel::new("fused", |_: &LaunchArgs| KernelStatus::Success);
    let group = g.create_supernode(Some(Box::new(fused)));
    g.merge(group, n).unwrap();
    g.finalize().unwrap();
    g.supernodes[group].discard(scratch);
    g.attach_stream(group).unwrap();

    g.launch_supernode(group).unwrap();
    assert_eq!(g.data[scratch].sync, SyncFlags::default());
    assert!(g.data[dst].sync.needs_download());
    g.wait_supernode(group).unwrap();
    assert!(matches!(
        g.wait_supernode(group),
        Err(Error::NotLaunched { .. })
    ));
    assert_eq!(dev.live_allocations(), 3);
}

#[test]
fn test_host_node_not_fused() {
    let (_, mut g) = setup(Config::default());
    let a = g.data.matrix("a", 2, 2, 4);
    let n = g.add_node(Node::new(
        FnKernel::new("cpu_only", |_| KernelStatus::Success).on_host(),
        vec![Param::bidirectional(a)],
    ));
    let group = g.create_supernode(None);
    assert!(matches!(
        g.merge(group, n),
        Err(Error::UnsupportedKernel { ref kernel }) if kernel == "cpu_only"
    ));
    assert_eq!(g[n].supernode, None);
    assert!(g.supernodes[group].entries.is_empty());
}
