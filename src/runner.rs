use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use blstrs::Scalar as Fr;
use ff::Field;
use log::{info, trace, warn};

use crate::cores::{bind_core, CoreIndex};
use crate::disk_writer::WriterPool;
use crate::engine::StreamEngine;
use crate::file_layout::SectorFile;
use crate::hash::hash_children;
use crate::params::{Pc2Config, Pc2Topology, SectorParams, NODE_SIZE};
use crate::reader::LayerReader;
use crate::settings::SETTINGS;
use crate::top_hasher::hash_top;
use crate::tree_address::TreeAddress;

/// Per-sector roots as they land in `p_aux`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PersistentAux {
    pub comm_c: Fr,
    pub comm_r_last: Fr,
}

/// Run the whole second phase: every partition of every sector is streamed
/// through the engine, the tree tops are hashed on a dedicated CPU thread
/// overlapped with the next partition, and the final roots are aggregated
/// into the per-sector `p_aux` files. Returns the roots.
pub fn run_pc2<R: LayerReader>(
    reader: Arc<R>,
    params: &SectorParams,
    topology: &Pc2Topology,
    config: &Pc2Config,
) -> Result<Vec<PersistentAux>> {
    let mut engine = StreamEngine::new(params, config, reader)?;
    let geo = engine.geometry_info();
    let partitions = params.num_partitions;
    let sectors = params.parallel_sectors;
    let arity = params.arity;
    let group = geo.batch / arity;

    let writer_threads = if topology.writer_threads > 0 {
        topology.writer_threads
    } else {
        std::cmp::max(1, SETTINGS.writer_threads)
    };
    let writers = WriterPool::spawn(
        engine.pool(),
        writer_threads,
        topology.writer_core,
        SETTINGS.max_write_size,
    );

    let top_c = TreeAddress::new(geo.top_leaves, arity, NODE_SIZE as u64, 0)?;
    let top_skips = (params.discard_rows + 1).saturating_sub(geo.gpu_rows);
    let top_r = TreeAddress::new(geo.top_leaves, arity, NODE_SIZE as u64, top_skips)?;

    // Single-slot handoff: the main loop only streams partition p+1 while
    // the hasher works on p, and waits for p's roots before going further.
    let (job_tx, job_rx) = sync_channel::<usize>(1);
    let (done_tx, done_rx) = sync_channel::<(usize, Vec<Fr>, Vec<Fr>)>(1);

    let hasher = {
        let shared = engine.shared();
        let gate = engine.gate();
        let (addr_c, addr_r) = engine.addresses();
        let tree_r_only = config.tree_r_only;
        let hasher_core = topology.hasher_core;

        let files_c: Vec<Vec<Arc<SectorFile>>> = (0..partitions)
            .map(|p| {
                engine
                    .files()
                    .tree_c
                    .iter()
                    .map(|per_sector| Arc::clone(&per_sector[p]))
                    .collect()
            })
            .collect();
        let files_r: Vec<Vec<Arc<SectorFile>>> = (0..partitions)
            .map(|p| {
                engine
                    .files()
                    .tree_r
                    .iter()
                    .map(|per_sector| Arc::clone(&per_sector[p]))
                    .collect()
            })
            .collect();

        thread::Builder::new()
            .name("pc2-hasher".to_string())
            .spawn(move || {
                let _cleanup = hasher_core.and_then(|core| match bind_core(CoreIndex::new(core)) {
                    Ok(cleanup) => Some(cleanup),
                    Err(err) => {
                        warn!("hasher: failed to bind core: {:?}", err);
                        None
                    }
                });

                for p in job_rx.iter() {
                    // Copy the stash out, then release the claim so the next
                    // partition's final items can overwrite it.
                    let local_c = unsafe { shared.gpu_results_c.slice() }.to_vec();
                    let local_r = unsafe { shared.gpu_results_r.slice() }.to_vec();
                    gate.release();

                    let mut roots_c = vec![Fr::ZERO; sectors];
                    let mut roots_r = vec![Fr::ZERO; sectors];
                    if !tree_r_only {
                        hash_top(
                            &local_c, sectors, group, arity, &addr_c, &top_c, &files_c[p],
                            &mut roots_c,
                        );
                    }
                    hash_top(
                        &local_r, sectors, group, arity, &addr_r, &top_r, &files_r[p],
                        &mut roots_r,
                    );
                    trace!("partition {} top hashed", p);
                    if done_tx.send((p, roots_c, roots_r)).is_err() {
                        break;
                    }
                }
            })
            .expect("failed to spawn top hasher")
    };

    let mut part_roots_c = vec![vec![Fr::ZERO; sectors]; partitions];
    let mut part_roots_r = vec![vec![Fr::ZERO; sectors]; partitions];
    for p in 0..partitions {
        // Streaming partition p overlaps with the hasher topping out p-1;
        // the stash handoff itself is serialized by the results gate.
        engine.hash_streams(p)?;
        if p > 0 {
            let (done, roots_c, roots_r) = done_rx.recv().expect("top hasher gone");
            part_roots_c[done] = roots_c;
            part_roots_r[done] = roots_r;
        }
        job_tx.send(p).expect("top hasher gone");
    }
    let (done, roots_c, roots_r) = done_rx.recv().expect("top hasher gone");
    part_roots_c[done] = roots_c;
    part_roots_r[done] = roots_r;

    drop(job_tx);
    hasher.join().expect("top hasher panicked");

    // Everything is flushed; spin until the writers drained the queue.
    writers.terminate();
    while writers.active() > 0 {
        thread::yield_now();
    }
    writers.join();

    let aux = write_roots(
        &engine,
        &part_roots_c,
        &part_roots_r,
        config.tree_r_only,
    )?;
    info!("pc2 complete: {} sectors, {} partitions", sectors, partitions);
    Ok(aux)
}

/// Aggregate the partition roots and emit the 64-byte `p_aux` files. With
/// more than one partition the per-partition roots are themselves hashed;
/// in tree-r-only mode the tree-c root is zeroed.
fn write_roots<R: LayerReader>(
    engine: &StreamEngine<R>,
    part_roots_c: &[Vec<Fr>],
    part_roots_r: &[Vec<Fr>],
    tree_r_only: bool,
) -> Result<Vec<PersistentAux>> {
    let sectors = engine.params().parallel_sectors;
    let partitions = part_roots_c.len();

    let mut aux = Vec::with_capacity(sectors);
    for s in 0..sectors {
        let comm_c = if tree_r_only {
            Fr::ZERO
        } else if partitions > 1 {
            let parts: Vec<Fr> = (0..partitions).map(|p| part_roots_c[p][s]).collect();
            hash_children(&parts)
        } else {
            part_roots_c[0][s]
        };
        let comm_r_last = if partitions > 1 {
            let parts: Vec<Fr> = (0..partitions).map(|p| part_roots_r[p][s]).collect();
            hash_children(&parts)
        } else {
            part_roots_r[0][s]
        };

        let path = engine.layout().p_aux_path(s);
        let mut bytes = Vec::with_capacity(2 * NODE_SIZE);
        bytes.extend_from_slice(&comm_c.to_bytes_le());
        bytes.extend_from_slice(&comm_r_last.to_bytes_le());
        std::fs::write(&path, &bytes).with_context(|| format!("failed to write {:?}", path))?;

        aux.push(PersistentAux {
            comm_c,
            comm_r_last,
        });
    }
    Ok(aux)
}
