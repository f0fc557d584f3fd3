use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::sync::{Arc, Mutex};
use std::thread;

use anyhow::{ensure, Result};
use blstrs::Scalar as Fr;
use ff::Field;
use log::{info, trace};

use crate::batch_hasher::CpuBatchHasher;
use crate::buffer_pool::{Batcher, BufToDisk, BufferPool};
use crate::file_layout::{open_files, FileLayout, SectorFile, SectorFiles};
use crate::hash::encode_fr;
use crate::params::{exact_log, Pc2Config, SectorParams, NODE_SIZE};
use crate::reader::LayerReader;
use crate::scheduler::{Scheduler, WorkItem};
use crate::stream::{HashStream, StreamOp, StreamShared};
use crate::tree_address::TreeAddress;
use crate::utils::SharedBuf;

/// Phase of one stream resource within the per-partition pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceState {
    Idle,
    DataRead,
    DataWait,
    HashColumn,
    HashColumnLeaves,
    HashLeaf,
    HashWait,
    Done,
}

/// Claim on the shared final-leaf stash, tagged with the owning partition.
/// All streams of one partition share the claim; the top-hash worker
/// releases it once the stash has been copied out, which is what keeps the
/// next partition's final items from overwriting results still in use.
#[derive(Debug, Default)]
pub struct ResultsGate {
    owner: Mutex<Option<usize>>,
}

impl ResultsGate {
    /// Claim for `partition`; idempotent for streams of the same partition.
    pub fn try_claim(&self, partition: usize) -> bool {
        let mut owner = self.owner.lock().expect("results gate poisoned");
        match *owner {
            None => {
                *owner = Some(partition);
                true
            }
            Some(p) => p == partition,
        }
    }

    pub fn release(&self) {
        *self.owner.lock().expect("results gate poisoned") = None;
    }
}

struct StreamResource {
    id: usize,
    state: ResourceState,
    sched_c: Scheduler,
    sched_r: Scheduler,
    work_c: WorkItem,
    work_r: WorkItem,
    last: bool,
    valid: Arc<AtomicU64>,
    valid_count: u64,
    start_node: u64,
}

/// Geometry derived from the sector parameters and the run configuration.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub batch: usize,
    pub stream_count: usize,
    pub nodes_to_read: u64,
    pub nodes_per_stream: u64,
    /// Tree rows hashed per stream; the final item of a stream produces the
    /// nodes of layer `gpu_rows`.
    pub gpu_rows: usize,
    /// Per-sector leaf count of the CPU top tree.
    pub top_leaves: u64,
}

/// The multi-stream tree builder. `hash_streams` drives all resources'
/// state machines round-robin over one partition: layer pages are pulled
/// from the reader, the last layer is encoded, columns and tree levels are
/// hashed on the streams, and every result buffer is routed through the
/// bounded pool into the disk writers. The only backpressure is
/// `batcher.size()`, which bounds both directions of the pool.
pub struct StreamEngine<R: LayerReader> {
    params: SectorParams,
    geo: Geometry,
    tree_r_only: bool,
    reads_enabled: bool,
    reader: Arc<R>,
    shared: Arc<StreamShared>,
    streams: Vec<HashStream>,
    resources: Vec<StreamResource>,
    pool: BufferPool,
    batcher: Arc<Batcher>,
    files: SectorFiles,
    layout: FileLayout,
    addr_c: TreeAddress,
    addr_r: TreeAddress,
    /// Per-stream node span at every tree layer; stream `i`'s outputs at
    /// layer L start `spans[L] * i` nodes into the layer, which is what
    /// makes all writes disjoint.
    spans: Vec<u64>,
    gate: Arc<ResultsGate>,
}

impl<R: LayerReader> StreamEngine<R> {
    pub fn new(params: &SectorParams, config: &Pc2Config, reader: Arc<R>) -> Result<Self> {
        let geo = Self::geometry(params, config)?;
        ensure!(
            reader.num_layers() == params.num_layers,
            "reader supplies {} layers, expected {}",
            reader.num_layers(),
            params.num_layers
        );
        ensure!(
            config.data_files.is_empty()
                || config.data_files.len() == params.parallel_sectors,
            "expected data files for {} sectors, got {}",
            params.parallel_sectors,
            config.data_files.len()
        );

        let addr_c = TreeAddress::new(geo.nodes_to_read, params.arity, NODE_SIZE as u64, 0)?;
        let addr_r = TreeAddress::new(
            geo.nodes_to_read,
            params.arity,
            NODE_SIZE as u64,
            params.discard_rows + 1,
        )?;

        let layout = FileLayout::new(
            &config.output_dir,
            params.parallel_sectors,
            params.num_partitions,
        );
        let files = open_files(&layout, params, config, &addr_c, &addr_r)?;

        let pool = BufferPool::new(
            config.disk_io_batch_size,
            config.num_host_batches,
            config.num_host_empty_batches,
            params.parallel_sectors * geo.batch * NODE_SIZE,
        );
        let batcher = Arc::new(Batcher::new(&pool));

        let sectors = params.parallel_sectors;
        let group = geo.batch / params.arity;
        let mut resources = Vec::with_capacity(geo.stream_count);
        for id in 0..geo.stream_count {
            resources.push(StreamResource {
                id,
                state: ResourceState::Done,
                sched_c: Scheduler::new(geo.nodes_per_stream, geo.batch, params.arity, sectors)?,
                sched_r: Scheduler::new(geo.nodes_per_stream, geo.batch, params.arity, sectors)?,
                work_c: WorkItem::default(),
                work_r: WorkItem::default(),
                last: false,
                valid: Arc::new(AtomicU64::new(0)),
                valid_count: 0,
                start_node: 0,
            });
        }

        let shared = Arc::new(StreamShared {
            sectors,
            batch: geo.batch,
            arity: params.arity,
            num_layers: params.num_layers,
            col_out: (0..geo.stream_count)
                .map(|_| SharedBuf::new(sectors * geo.batch, Fr::ZERO))
                .collect(),
            replica: (0..geo.stream_count)
                .map(|_| SharedBuf::new(sectors * geo.batch, Fr::ZERO))
                .collect(),
            arena_c: resources.iter().map(|r| Arc::clone(r.sched_c.arena())).collect(),
            arena_r: resources.iter().map(|r| Arc::clone(r.sched_r.arena())).collect(),
            gpu_results_c: SharedBuf::new(
                geo.stream_count * sectors * group,
                Fr::ZERO,
            ),
            gpu_results_r: SharedBuf::new(
                geo.stream_count * sectors * group,
                Fr::ZERO,
            ),
            async_done: (0..geo.stream_count).map(|_| AtomicBool::new(true)).collect(),
            batcher: Arc::clone(&batcher),
            storage: pool.storage(),
        });

        let streams = (0..geo.stream_count)
            .map(|id| {
                HashStream::spawn(
                    id,
                    Arc::clone(&shared),
                    Arc::clone(&reader),
                    Box::new(CpuBatchHasher::default()),
                )
            })
            .collect();

        let spans = (0..=geo.gpu_rows as u32)
            .map(|l| geo.nodes_per_stream / (params.arity as u64).pow(l))
            .collect();

        info!(
            "engine: {} sectors of {} nodes, {} partitions, {} streams, batch {}",
            sectors, params.num_nodes, params.num_partitions, geo.stream_count, geo.batch
        );

        Ok(StreamEngine {
            params: *params,
            geo,
            tree_r_only: config.tree_r_only,
            reads_enabled: !config.disable_page_reads,
            reader,
            shared,
            streams,
            resources,
            pool,
            batcher,
            files,
            layout,
            addr_c,
            addr_r,
            spans,
            gate: Arc::new(ResultsGate::default()),
        })
    }

    fn geometry(params: &SectorParams, config: &Pc2Config) -> Result<Geometry> {
        let batch = config.batch_size;
        let streams = config.stream_count;
        ensure!(streams >= 1, "at least one stream is required");
        ensure!(
            batch % params.arity == 0 && batch >= params.arity,
            "batch {} does not divide by arity {}",
            batch,
            params.arity
        );

        let nodes_to_read = params.nodes_per_partition();
        ensure!(
            nodes_to_read % streams as u64 == 0,
            "{} nodes per partition do not divide across {} streams",
            nodes_to_read,
            streams
        );
        let nodes_per_stream = nodes_to_read / streams as u64;
        ensure!(
            nodes_per_stream % batch as u64 == 0,
            "{} nodes per stream do not divide into batches of {}",
            nodes_per_stream,
            batch
        );
        let leaf_groups = nodes_per_stream / batch as u64;
        let gpu_rows = exact_log(params.arity, leaf_groups).ok_or_else(|| {
            anyhow::format_err!(
                "{} leaf groups per stream is not a power of arity {}",
                leaf_groups,
                params.arity
            )
        })? as usize
            + 1;

        let top_leaves = streams as u64 * (batch / params.arity) as u64;
        ensure!(
            exact_log(params.arity, top_leaves).is_some(),
            "top tree of {} leaves is not a power of arity {}",
            top_leaves,
            params.arity
        );

        Ok(Geometry {
            batch,
            stream_count: streams,
            nodes_to_read,
            nodes_per_stream,
            gpu_rows,
            top_leaves,
        })
    }

    pub fn geometry_info(&self) -> Geometry {
        self.geo
    }

    pub fn params(&self) -> &SectorParams {
        &self.params
    }

    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    pub(crate) fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub(crate) fn shared(&self) -> Arc<StreamShared> {
        Arc::clone(&self.shared)
    }

    pub(crate) fn gate(&self) -> Arc<ResultsGate> {
        Arc::clone(&self.gate)
    }

    pub(crate) fn files(&self) -> &SectorFiles {
        &self.files
    }

    pub(crate) fn addresses(&self) -> (TreeAddress, TreeAddress) {
        (self.addr_c.clone(), self.addr_r.clone())
    }

    /// Build the stream-resident part of both trees for one partition. The
    /// loop visits every resource round-robin and never blocks on a single
    /// one; a resource that cannot advance (incomplete read, no disk
    /// buffers, claimed results gate) is simply revisited.
    pub fn hash_streams(&mut self, partition: usize) -> Result<()> {
        assert!(partition < self.params.num_partitions);
        for resource in &mut self.resources {
            resource.state = ResourceState::Idle;
            resource.last = false;
            resource.sched_c.reset();
            resource.sched_r.reset();
        }
        for flag in &self.shared.async_done {
            flag.store(true, SeqCst);
        }

        let mut resources = std::mem::take(&mut self.resources);
        let mut pending = resources.len();
        while pending > 0 {
            let mut progressed = false;
            let mut starved = false;
            for resource in resources.iter_mut() {
                if resource.state == ResourceState::Done {
                    continue;
                }
                if self.advance(resource, partition, &mut starved)? {
                    progressed = true;
                    if resource.state == ResourceState::Done {
                        pending -= 1;
                    }
                }
            }
            if !progressed {
                if starved {
                    // Every resource is waiting on pool buffers; push the
                    // partial bundle out so the writers can return batches.
                    self.batcher.flush();
                }
                thread::yield_now();
            }
        }
        self.resources = resources;

        // Partial write bundles must keep circulating into the next
        // partition; stranding them would starve the pool.
        self.batcher.flush();
        trace!("partition {} streamed", partition);
        Ok(())
    }

    fn advance(&self, r: &mut StreamResource, partition: usize, starved: &mut bool) -> Result<bool> {
        match r.state {
            ResourceState::Idle => {
                let more = r.sched_c.next(&mut r.work_c);
                let more_r = r.sched_r.next(&mut r.work_r);
                debug_assert_eq!(more, more_r);
                debug_assert_eq!(r.work_c.node, r.work_r.node);
                r.last = !more;
                r.state = if r.work_c.is_leaf {
                    if self.reads_enabled {
                        ResourceState::DataRead
                    } else if self.tree_r_only {
                        ResourceState::HashColumnLeaves
                    } else {
                        ResourceState::HashColumn
                    }
                } else {
                    ResourceState::HashLeaf
                };
                Ok(true)
            }
            ResourceState::DataRead => {
                r.start_node = r.work_c.node * self.geo.batch as u64
                    + self.geo.nodes_per_stream * r.id as u64
                    + partition as u64 * self.geo.nodes_to_read;
                r.valid = Arc::new(AtomicU64::new(0));
                r.valid_count = Arc::clone(&self.reader).load_layers(
                    r.id,
                    0,
                    r.start_node,
                    self.geo.batch,
                    self.params.num_layers,
                    Arc::clone(&r.valid),
                )?;
                r.state = ResourceState::DataWait;
                Ok(true)
            }
            ResourceState::DataWait => {
                if r.valid.load(SeqCst) < r.valid_count {
                    return Ok(false);
                }
                let write_sealed = !self.tree_r_only;
                if write_sealed && self.batcher.size() < 1 {
                    *starved = true;
                    return Ok(false);
                }
                self.encode_replica(r);
                if write_sealed {
                    self.queue_sealed(r);
                    r.state = ResourceState::HashColumn;
                } else {
                    r.state = ResourceState::HashColumnLeaves;
                }
                Ok(true)
            }
            ResourceState::HashColumn => {
                if self.batcher.size() < 1 {
                    *starved = true;
                    return Ok(false);
                }
                let mut to_disk = self.batcher.dequeue();
                to_disk.offset = self.addr_c.address(
                    0,
                    r.work_c.node * self.geo.batch as u64 + self.spans[0] * r.id as u64,
                );
                to_disk.size = (self.geo.batch * NODE_SIZE) as u64;
                to_disk.stride = 1;
                to_disk.reverse = false;
                to_disk.dst = self.tree_c_dst(partition);
                self.shared.async_done[r.id].store(false, SeqCst);
                self.streams[r.id].send(StreamOp::Columns {
                    resource: r.id,
                    to_disk,
                });
                r.state = ResourceState::HashColumnLeaves;
                Ok(true)
            }
            ResourceState::HashColumnLeaves => {
                if !self.shared.async_done[r.id].load(SeqCst) {
                    return Ok(false);
                }
                self.submit_level(r, partition, true, starved)
            }
            ResourceState::HashLeaf => self.submit_level(r, partition, false, starved),
            ResourceState::HashWait => {
                if !self.shared.async_done[r.id].load(SeqCst) {
                    return Ok(false);
                }
                r.state = if r.last {
                    ResourceState::Done
                } else {
                    ResourceState::Idle
                };
                Ok(true)
            }
            ResourceState::Done => Ok(false),
        }
    }

    /// Submit the level hash for the current work item: the leaf level when
    /// `leaves`, otherwise an interior level. Stalls until the pool has a
    /// buffer for every tree whose nodes reach the disk at this layer, and,
    /// for the final item, until the results stash can be claimed.
    fn submit_level(
        &self,
        r: &mut StreamResource,
        partition: usize,
        leaves: bool,
        starved: &mut bool,
    ) -> Result<bool> {
        let layer = r.work_c.layer as usize;
        debug_assert!(!leaves || layer == 1);
        let write_c = !self.tree_r_only;
        let write_r = layer > self.params.discard_rows;
        let needed = write_c as usize + write_r as usize;
        if needed > 0 && self.batcher.size() < needed {
            *starved = true;
            return Ok(false);
        }
        if r.last && !self.gate.try_claim(partition) {
            return Ok(false);
        }

        let group = (self.geo.batch / self.params.arity) as u64;
        let node = r.work_c.node * group + self.spans[layer] * r.id as u64;
        let to_disk_c = if write_c {
            Some(self.route(self.addr_c.address(layer, node), partition, true))
        } else {
            None
        };
        let to_disk_r = if write_r {
            let stored = layer - self.params.discard_rows - 1;
            Some(self.route(self.addr_r.address(stored, node), partition, false))
        } else {
            None
        };

        self.shared.async_done[r.id].store(false, SeqCst);
        let op = if leaves {
            StreamOp::Leaves {
                resource: r.id,
                out_c: if write_c { Some(r.work_c.buf) } else { None },
                out_r: r.work_r.buf,
                to_disk_c,
                to_disk_r,
                stash: r.last,
            }
        } else {
            StreamOp::Inner {
                resource: r.id,
                inputs_c: if write_c {
                    r.work_c.inputs.clone()
                } else {
                    Vec::new()
                },
                out_c: if write_c { Some(r.work_c.buf) } else { None },
                inputs_r: r.work_r.inputs.clone(),
                out_r: r.work_r.buf,
                to_disk_c,
                to_disk_r,
                stash: r.last,
            }
        };
        self.streams[r.id].send(op);
        r.state = ResourceState::HashWait;
        Ok(true)
    }

    fn route(&self, offset: u64, partition: usize, tree_c: bool) -> BufToDisk {
        let mut to_disk = self.batcher.dequeue();
        to_disk.offset = offset;
        to_disk.size = ((self.geo.batch / self.params.arity) * NODE_SIZE) as u64;
        to_disk.stride = 1;
        to_disk.reverse = false;
        to_disk.dst = if tree_c {
            self.tree_c_dst(partition)
        } else {
            self.tree_r_dst(partition)
        };
        to_disk
    }

    fn tree_c_dst(&self, partition: usize) -> Vec<Arc<SectorFile>> {
        self.files
            .tree_c
            .iter()
            .map(|per_sector| Arc::clone(&per_sector[partition]))
            .collect()
    }

    fn tree_r_dst(&self, partition: usize) -> Vec<Arc<SectorFile>> {
        self.files
            .tree_r
            .iter()
            .map(|per_sector| Arc::clone(&per_sector[partition]))
            .collect()
    }

    /// Copy the last layer out of the slot and add the per-sector data-file
    /// nodes into it. The addition runs on decoded elements; the sealed
    /// write re-encodes big-endian on its way out.
    fn encode_replica(&self, r: &StreamResource) {
        let sectors = self.params.parallel_sectors;
        let batch = self.geo.batch;
        // Safety: the load completed and the stream op consuming the replica
        // has not been submitted yet; this thread is the only accessor.
        let slot = unsafe { self.reader.slot(r.id) };
        let replica = unsafe { self.shared.replica[r.id].slice_mut() };
        let last_layer = (self.params.num_layers - 1) * batch * sectors;
        replica.copy_from_slice(&slot[last_layer..][..batch * sectors]);

        let big_endian = self.reader.data_is_big_endian();
        for (s, map) in self.files.data.iter().enumerate() {
            let map = match map {
                Some(map) => map,
                None => continue,
            };
            let base = r.start_node as usize * NODE_SIZE;
            for n in 0..batch {
                let mut repr = [0u8; NODE_SIZE];
                repr.copy_from_slice(&map[base + n * NODE_SIZE..][..NODE_SIZE]);
                let data = if big_endian {
                    Fr::from_bytes_be(&repr)
                } else {
                    Fr::from_bytes_le(&repr)
                };
                let data = Option::from(data).expect("data node is not a valid field element");
                encode_fr(&mut replica[n * sectors + s], data);
            }
        }
    }

    /// Queue the encoded replica ("sealed") bytes: one strided, byte-reversed
    /// write per sector at the node range just read.
    fn queue_sealed(&self, r: &StreamResource) {
        let mut to_disk = self.batcher.dequeue();
        let replica = unsafe { self.shared.replica[r.id].slice() };
        // Safety: the dequeued buffer's region belongs to us until enqueue.
        let region = unsafe { self.shared.storage.region_mut(to_disk.buf) };
        for (i, element) in replica.iter().enumerate() {
            region[i * NODE_SIZE..][..NODE_SIZE].copy_from_slice(&element.to_bytes_le());
        }
        to_disk.len = replica.len();
        to_disk.offset = r.start_node * NODE_SIZE as u64;
        to_disk.size = (self.geo.batch * NODE_SIZE) as u64;
        to_disk.stride = self.params.parallel_sectors;
        to_disk.reverse = true;
        to_disk.dst = self.files.sealed.iter().map(Arc::clone).collect();
        self.batcher.enqueue(to_disk);
    }
}
