use std::sync::Arc;

use anyhow::{ensure, Result};
use blstrs::Scalar as Fr;
use ff::Field;

use crate::params::exact_log;
use crate::utils::SharedBuf;

pub type BufId = usize;

/// One unit of hashing work for a stream. Leaf-group items hash a batch of
/// contiguous input positions; interior items hash the outputs of the
/// `arity` immediately preceding items at the child layer.
#[derive(Debug, Clone, Default)]
pub struct WorkItem {
    /// Layer of the produced nodes; leaf groups produce layer 1.
    pub layer: u32,
    /// Group index of the produced nodes within this stream's subtree.
    pub node: u64,
    pub is_leaf: bool,
    /// Arena handle of the output buffer.
    pub buf: BufId,
    /// Arena handles of the input buffers (interior items only).
    pub inputs: Vec<BufId>,
}

/// Fixed arena of result buffers lent out to work items. A buffer produced
/// at layer L is consumed as one of its parent's inputs at layer L+1 and
/// only then returns to the free list, so no item ever aliases a live
/// buffer.
#[derive(Debug)]
pub struct BufArena {
    bufs: Vec<SharedBuf<Fr>>,
}

impl BufArena {
    fn new(count: usize, len: usize) -> Self {
        BufArena {
            bufs: (0..count).map(|_| SharedBuf::new(len, Fr::ZERO)).collect(),
        }
    }

    pub fn buf_len(&self) -> usize {
        self.bufs[0].len()
    }

    /// Safety: `id` must come from a work item whose access rules (one op in
    /// flight, inputs live until the item completes) the caller upholds.
    pub unsafe fn slice(&self, id: BufId) -> &[Fr] {
        self.bufs[id].slice()
    }

    /// Safety: `id` must be the output buffer of the item being executed.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, id: BufId) -> &mut [Fr] {
        self.bufs[id].slice_mut()
    }
}

/// Produces the work-item sequence for one stream's subtree: `leaves /
/// batch` leaf groups, then one interior item for every `arity` completed
/// items of a layer, carried upwards until a single item tops out the
/// subtree. `next` returns `false` on the final item.
pub struct Scheduler {
    arity: usize,
    leaf_groups: u64,
    total_items: u64,
    emitted: u64,
    next_leaf: u64,
    /// Completed but unconsumed outputs per layer; index 0 is unused.
    pending: Vec<Vec<(u64, BufId)>>,
    free: Vec<BufId>,
    retired: Vec<BufId>,
    arena: Arc<BufArena>,
}

impl Scheduler {
    pub fn new(leaves: u64, batch: usize, arity: usize, sectors: usize) -> Result<Self> {
        ensure!(arity >= 2, "invalid arity: {}", arity);
        ensure!(
            batch % arity == 0,
            "batch {} does not divide by arity {}",
            batch,
            arity
        );
        ensure!(
            leaves % batch as u64 == 0,
            "{} leaves do not divide into batches of {}",
            leaves,
            batch
        );
        let leaf_groups = leaves / batch as u64;
        let rows = exact_log(arity, leaf_groups).ok_or_else(|| {
            anyhow::format_err!(
                "{} leaf groups is not a power of arity {}",
                leaf_groups,
                arity
            )
        })? as usize
            + 1;

        let mut total_items = 0u64;
        let mut n = leaf_groups;
        loop {
            total_items += n;
            if n == 1 {
                break;
            }
            n /= arity as u64;
        }

        // Worst case per layer: arity-1 pending plus the item in flight.
        let capacity = rows * arity + 2;
        let arena = Arc::new(BufArena::new(capacity, sectors * batch / arity));

        Ok(Scheduler {
            arity,
            leaf_groups,
            total_items,
            emitted: 0,
            next_leaf: 0,
            pending: vec![Vec::new(); rows + 1],
            free: (0..capacity).rev().collect(),
            retired: Vec::new(),
            arena,
        })
    }

    pub fn arena(&self) -> &Arc<BufArena> {
        &self.arena
    }

    pub fn total_items(&self) -> u64 {
        self.total_items
    }

    /// Fill `work` with the next item. Returns `false` when `work` is the
    /// final item of the sequence.
    pub fn next(&mut self, work: &mut WorkItem) -> bool {
        assert!(self.emitted < self.total_items, "scheduler exhausted");
        // The previous item has completed by now, so its inputs are free.
        self.free.extend(self.retired.drain(..));
        work.inputs.clear();

        // Carry first: an interior node fires as soon as its children exist.
        let carry = (1..self.pending.len()).find(|&l| self.pending[l].len() == self.arity);
        match carry {
            Some(layer) => {
                work.layer = layer as u32 + 1;
                work.is_leaf = false;
                let children = &mut self.pending[layer];
                work.node = children[0].0 / self.arity as u64;
                for (_, id) in children.drain(..) {
                    work.inputs.push(id);
                    self.retired.push(id);
                }
            }
            None => {
                debug_assert!(self.next_leaf < self.leaf_groups);
                work.layer = 1;
                work.node = self.next_leaf;
                work.is_leaf = true;
                self.next_leaf += 1;
            }
        }
        work.buf = self.free.pop().expect("buffer arena exhausted");

        self.emitted += 1;
        let more = self.emitted < self.total_items;
        if more {
            self.pending[work.layer as usize].push((work.node, work.buf));
        }
        more
    }

    pub fn reset(&mut self) {
        self.emitted = 0;
        self.next_leaf = 0;
        for level in &mut self.pending {
            level.clear();
        }
        self.retired.clear();
        self.free = (0..self.arena.bufs.len()).rev().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn drain(scheduler: &mut Scheduler) -> Vec<WorkItem> {
        let mut items = Vec::new();
        let mut work = WorkItem::default();
        loop {
            let more = scheduler.next(&mut work);
            items.push(work.clone());
            if !more {
                break;
            }
        }
        items
    }

    #[test]
    fn test_sequence_shape() {
        let mut scheduler = Scheduler::new(4096, 64, 8, 2).expect("new failure");
        let items = drain(&mut scheduler);

        // 64 leaf groups + 8 + 1
        assert_eq!(items.len() as u64, scheduler.total_items());
        assert_eq!(items.len(), 73);
        assert_eq!(items.iter().filter(|i| i.is_leaf).count(), 64);

        let last = items.last().expect("no items");
        assert!(!last.is_leaf);
        assert_eq!(last.layer, 3);
        assert_eq!(last.node, 0);
    }

    #[test]
    fn test_interior_inputs_are_the_preceding_children() {
        let mut scheduler = Scheduler::new(512, 8, 2, 1).expect("new failure");
        let items = drain(&mut scheduler);

        // Map each produced (layer, node) to its output buffer as the
        // sequence runs; every interior item must consume exactly its
        // children's buffers, in node order.
        let mut produced: HashMap<(u32, u64), BufId> = HashMap::new();
        for item in &items {
            if !item.is_leaf {
                assert_eq!(item.inputs.len(), 2);
                for (k, input) in item.inputs.iter().enumerate() {
                    let child = (item.layer - 1, item.node * 2 + k as u64);
                    assert_eq!(produced.get(&child), Some(input), "wrong child buffer");
                }
            }
            produced.insert((item.layer, item.node), item.buf);
        }
    }

    #[test]
    fn test_no_aliasing_while_in_flight() {
        let mut scheduler = Scheduler::new(4096, 64, 8, 1).expect("new failure");
        let mut work = WorkItem::default();
        let mut live: HashSet<BufId> = HashSet::new();

        loop {
            let more = scheduler.next(&mut work);
            // Inputs were live until now; they retire with this item.
            for input in &work.inputs {
                assert!(live.remove(input), "input was not live");
            }
            assert!(live.insert(work.buf), "output buffer aliases a live one");
            if !more {
                break;
            }
        }
    }

    #[test]
    fn test_reset_repeats_the_sequence() {
        let mut scheduler = Scheduler::new(512, 8, 8, 1).expect("new failure");
        let first: Vec<(u32, u64, bool)> = drain(&mut scheduler)
            .iter()
            .map(|i| (i.layer, i.node, i.is_leaf))
            .collect();
        scheduler.reset();
        let second: Vec<(u32, u64, bool)> = drain(&mut scheduler)
            .iter()
            .map(|i| (i.layer, i.node, i.is_leaf))
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_single_item_tree() {
        let mut scheduler = Scheduler::new(64, 64, 8, 1).expect("new failure");
        let mut work = WorkItem::default();
        assert!(!scheduler.next(&mut work));
        assert!(work.is_leaf);
        assert_eq!(work.layer, 1);
    }
}
