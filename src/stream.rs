use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use blstrs::Scalar as Fr;
use crossbeam::channel::{bounded, Sender};
use ff::Field;
use log::debug;

use crate::batch_hasher::BatchHasher;
use crate::buffer_pool::{Batcher, BufToDisk, HostStorage};
use crate::params::NODE_SIZE;
use crate::reader::LayerReader;
use crate::scheduler::{BufArena, BufId};
use crate::utils::SharedBuf;

/// State shared between the orchestrator and every stream worker. The
/// orchestrator keeps exactly one operation in flight per resource and only
/// observes completion through `async_done`, so each worker has exclusive
/// access to its resource's buffers while an op runs.
pub struct StreamShared {
    pub sectors: usize,
    pub batch: usize,
    pub arity: usize,
    pub num_layers: usize,
    /// Per-resource column-hash output (`sectors * batch`, sector-major).
    pub col_out: Vec<SharedBuf<Fr>>,
    /// Per-resource last-layer staging (`sectors * batch`, node-major).
    pub replica: Vec<SharedBuf<Fr>>,
    pub arena_c: Vec<Arc<BufArena>>,
    pub arena_r: Vec<Arc<BufArena>>,
    /// Final leaf outputs of every stream, consumed by the top hasher.
    pub gpu_results_c: SharedBuf<Fr>,
    pub gpu_results_r: SharedBuf<Fr>,
    /// Completion flag per resource, the only signal the orchestrator polls.
    pub async_done: Vec<AtomicBool>,
    pub batcher: Arc<Batcher>,
    pub storage: Arc<HostStorage>,
}

pub enum StreamOp {
    /// Column-hash the freshly loaded slot and route the hashes to disk.
    Columns { resource: usize, to_disk: BufToDisk },
    /// Hash the tree leaves: tree-c from the column hashes, tree-r from the
    /// (possibly encoded) replica staging.
    Leaves {
        resource: usize,
        out_c: Option<BufId>,
        out_r: BufId,
        to_disk_c: Option<BufToDisk>,
        to_disk_r: Option<BufToDisk>,
        stash: bool,
    },
    /// Hash one interior level from previously produced buffers.
    Inner {
        resource: usize,
        inputs_c: Vec<BufId>,
        out_c: Option<BufId>,
        inputs_r: Vec<BufId>,
        out_r: BufId,
        to_disk_c: Option<BufToDisk>,
        to_disk_r: Option<BufToDisk>,
        stash: bool,
    },
}

/// Handle to one hashing stream: a dedicated worker thread executing ops in
/// submission order, which is what makes per-stream results ready before
/// their parents consume them.
pub struct HashStream {
    tx: Option<Sender<StreamOp>>,
    handle: Option<JoinHandle<()>>,
}

impl HashStream {
    pub fn spawn<R: LayerReader>(
        id: usize,
        shared: Arc<StreamShared>,
        reader: Arc<R>,
        mut hasher: Box<dyn BatchHasher>,
    ) -> Self {
        let (tx, rx) = bounded::<StreamOp>(2);
        let handle = thread::Builder::new()
            .name(format!("pc2-stream-{}", id))
            .spawn(move || {
                let mut gather = vec![Fr::ZERO; shared.sectors * shared.batch];
                for op in rx.iter() {
                    run_op(id, &shared, reader.as_ref(), hasher.as_mut(), &mut gather, op);
                }
                debug!("stream {} exiting", id);
            })
            .expect("failed to spawn stream worker");

        HashStream {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn send(&self, op: StreamOp) {
        self.tx
            .as_ref()
            .expect("stream closed")
            .send(op)
            .expect("stream worker gone");
    }
}

impl Drop for HashStream {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_op<R: LayerReader>(
    id: usize,
    shared: &StreamShared,
    reader: &R,
    hasher: &mut dyn BatchHasher,
    gather: &mut [Fr],
    op: StreamOp,
) {
    match op {
        StreamOp::Columns { resource, to_disk } => {
            debug_assert_eq!(resource, id);
            // Safety: the load completed before this op was submitted and no
            // new load starts until it finishes.
            let slot = unsafe { reader.slot(resource) };
            let out = unsafe { shared.col_out[resource].slice_mut() };
            hasher.hash_columns(slot, shared.num_layers, shared.batch, shared.sectors, out);
            let mut to_disk = to_disk;
            stage(shared, &mut to_disk, out);
            shared.batcher.enqueue(to_disk);
            shared.async_done[resource].store(true, SeqCst);
        }
        StreamOp::Leaves {
            resource,
            out_c,
            out_r,
            to_disk_c,
            to_disk_r,
            stash,
        } => {
            debug_assert_eq!(resource, id);
            if let Some(out_c) = out_c {
                // Safety: the column op of this resource already completed
                // on this very thread.
                let input = unsafe { shared.col_out[resource].slice() };
                let out = unsafe { shared.arena_c[resource].slice_mut(out_c) };
                hasher.hash_tree_level(input, shared.arity, shared.sectors, out);
                finish(shared, resource, &shared.gpu_results_c, out, to_disk_c, stash);
            }

            // Safety: the orchestrator finished staging the replica before
            // submitting this op.
            let replica = unsafe { shared.replica[resource].slice() };
            let out = unsafe { shared.arena_r[resource].slice_mut(out_r) };
            hasher.hash_interleaved_leaves(replica, shared.arity, shared.sectors, out);
            finish(shared, resource, &shared.gpu_results_r, out, to_disk_r, stash);

            shared.async_done[resource].store(true, SeqCst);
        }
        StreamOp::Inner {
            resource,
            inputs_c,
            out_c,
            inputs_r,
            out_r,
            to_disk_c,
            to_disk_r,
            stash,
        } => {
            debug_assert_eq!(resource, id);
            if let Some(out_c) = out_c {
                gather_inputs(shared, &shared.arena_c[resource], &inputs_c, gather);
                let out = unsafe { shared.arena_c[resource].slice_mut(out_c) };
                hasher.hash_tree_level(gather, shared.arity, shared.sectors, out);
                finish(shared, resource, &shared.gpu_results_c, out, to_disk_c, stash);
            }

            gather_inputs(shared, &shared.arena_r[resource], &inputs_r, gather);
            let out = unsafe { shared.arena_r[resource].slice_mut(out_r) };
            hasher.hash_tree_level(gather, shared.arity, shared.sectors, out);
            finish(shared, resource, &shared.gpu_results_r, out, to_disk_r, stash);

            shared.async_done[resource].store(true, SeqCst);
        }
    }
}

/// Route a finished level: serialize it into its disk buffer (if any), hand
/// the buffer to the batcher, and stash the final leaf output for the CPU
/// top-hash.
fn finish(
    shared: &StreamShared,
    resource: usize,
    results: &SharedBuf<Fr>,
    data: &[Fr],
    to_disk: Option<BufToDisk>,
    stash: bool,
) {
    if let Some(mut to_disk) = to_disk {
        stage(shared, &mut to_disk, data);
        shared.batcher.enqueue(to_disk);
    }
    if stash {
        // Safety: streams write disjoint windows and the results gate keeps
        // the previous partition's consumer out.
        let out = unsafe { results.slice_mut() };
        out[resource * data.len()..][..data.len()].copy_from_slice(data);
    }
}

/// Serialize hashes into the buffer's backing region (the host-side copy of
/// a device deployment's D→H transfer).
fn stage(shared: &StreamShared, buf: &mut BufToDisk, data: &[Fr]) {
    // Safety: a dequeued buffer's region belongs to this op until enqueue.
    let region = unsafe { shared.storage.region_mut(buf.buf) };
    for (i, element) in data.iter().enumerate() {
        region[i * NODE_SIZE..][..NODE_SIZE].copy_from_slice(&element.to_bytes_le());
    }
    buf.len = data.len();
}

/// Concatenate the child buffers sector-major so one level reduction sees
/// `batch` contiguous child nodes per sector.
fn gather_inputs(shared: &StreamShared, arena: &BufArena, inputs: &[BufId], gather: &mut [Fr]) {
    let group = shared.batch / shared.arity;
    debug_assert_eq!(inputs.len(), shared.arity);
    for (b, id) in inputs.iter().enumerate() {
        // Safety: inputs stay live until the item they feed completes.
        let child = unsafe { arena.slice(*id) };
        for s in 0..shared.sectors {
            gather[s * shared.batch + b * group..][..group]
                .copy_from_slice(&child[s * group..][..group]);
        }
    }
}
