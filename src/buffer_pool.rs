use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender};
use log::trace;

use crate::file_layout::SectorFile;
use crate::utils::SharedBuf;

/// One pending disk write. `buf` indexes the backing region inside the pool
/// storage; the destination, placement and gather mode are set by whoever
/// fills the buffer.
#[derive(Debug)]
pub struct BufToDisk {
    pub buf: usize,
    /// Field elements staged in the region; 0 marks an unused slot.
    pub len: usize,
    /// Byte offset inside every destination file.
    pub offset: u64,
    /// Bytes written per sector.
    pub size: u64,
    /// Element stride of the gather; 1 writes each sector's run contiguously,
    /// `parallel_sectors` gathers every n-th element into a staging buffer.
    pub stride: usize,
    /// Reverse the bytes of every element while gathering (big-endian output).
    pub reverse: bool,
    /// Destination handle per sector.
    pub dst: Vec<Arc<SectorFile>>,
}

/// Region index marking a zero-length padding slot.
const PAD: usize = usize::MAX;

impl BufToDisk {
    fn idle(buf: usize) -> Self {
        BufToDisk {
            buf,
            len: 0,
            offset: 0,
            size: 0,
            stride: 1,
            reverse: false,
            dst: Vec::new(),
        }
    }

    /// Zero-length slot used to pad a flushed batch back to full length.
    /// Owns no region; writers skip it and `dequeue` discards it.
    fn padding() -> Self {
        BufToDisk::idle(PAD)
    }

    fn is_padding(&self) -> bool {
        self.buf == PAD
    }

    /// Drop the routing but keep the region, readying the buffer for reuse.
    pub fn clear(&mut self) {
        self.len = 0;
        self.offset = 0;
        self.size = 0;
        self.stride = 1;
        self.reverse = false;
        self.dst.clear();
    }
}

pub type BufToDiskBatch = Vec<BufToDisk>;

/// Backing storage for every buffer region. Registered as page-locked memory
/// in a device deployment; plain host memory otherwise.
#[derive(Debug)]
pub struct HostStorage {
    data: SharedBuf<u8>,
    region_bytes: usize,
}

impl HostStorage {
    fn new(regions: usize, region_bytes: usize) -> Self {
        HostStorage {
            data: SharedBuf::new(regions * region_bytes, 0u8),
            region_bytes,
        }
    }

    pub fn region_bytes(&self) -> usize {
        self.region_bytes
    }

    /// Safety: region `idx` must not be written concurrently.
    pub unsafe fn region(&self, idx: usize) -> &[u8] {
        &self.data.slice()[idx * self.region_bytes..][..self.region_bytes]
    }

    /// Safety: the caller must own the buffer whose region this is.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn region_mut(&self, idx: usize) -> &mut [u8] {
        &mut self.data.slice_mut()[idx * self.region_bytes..][..self.region_bytes]
    }
}

/// The three bounded queues every write batch travels through:
/// `pool_full` (holding reusable buffers) → orchestrator → `to_disk` →
/// writer → back to `pool_full`, with `pool_empty` recirculating the drained
/// batch containers. Every batch is in exactly one queue or held by exactly
/// one thread at any moment.
pub struct BufferPool {
    storage: Arc<HostStorage>,
    batch_size: usize,
    total_batches: usize,
    full_tx: Sender<BufToDiskBatch>,
    full_rx: Receiver<BufToDiskBatch>,
    empty_tx: Sender<BufToDiskBatch>,
    empty_rx: Receiver<BufToDiskBatch>,
    disk_tx: Sender<BufToDiskBatch>,
    disk_rx: Receiver<BufToDiskBatch>,
}

impl BufferPool {
    pub fn new(
        disk_io_batch_size: usize,
        num_host_batches: usize,
        num_host_empty_batches: usize,
        region_bytes: usize,
    ) -> Self {
        assert!(disk_io_batch_size >= 1, "batches must hold buffers");
        assert!(
            num_host_batches * disk_io_batch_size >= 2,
            "fewer buffers than one work item can require"
        );
        // Two spare containers keep the bundling side's `size()` bound above
        // the two buffers a single work item may need, for any batch size:
        // every shipped bundle is paid for by a drained unbundle, so the
        // empty queue never falls more than one container below its start.
        assert!(num_host_empty_batches >= 2, "too few spare batch containers");

        let total_batches = num_host_batches + num_host_empty_batches;
        let (full_tx, full_rx) = bounded(total_batches);
        let (empty_tx, empty_rx) = bounded(total_batches);
        let (disk_tx, disk_rx) = bounded(total_batches);

        let storage = Arc::new(HostStorage::new(
            num_host_batches * disk_io_batch_size,
            region_bytes,
        ));

        for b in 0..num_host_batches {
            let batch: BufToDiskBatch = (0..disk_io_batch_size)
                .map(|j| BufToDisk::idle(b * disk_io_batch_size + j))
                .collect();
            full_tx.send(batch).expect("pool_full closed at init");
        }
        for _ in 0..num_host_empty_batches {
            empty_tx
                .send(Vec::with_capacity(disk_io_batch_size))
                .expect("pool_empty closed at init");
        }
        trace!(
            "buffer pool: {} batches of {} regions, {} bytes each",
            total_batches,
            disk_io_batch_size,
            region_bytes
        );

        BufferPool {
            storage,
            batch_size: disk_io_batch_size,
            total_batches,
            full_tx,
            full_rx,
            empty_tx,
            empty_rx,
            disk_tx,
            disk_rx,
        }
    }

    pub fn storage(&self) -> Arc<HostStorage> {
        Arc::clone(&self.storage)
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    pub(crate) fn disk_rx(&self) -> Receiver<BufToDiskBatch> {
        self.disk_rx.clone()
    }

    pub(crate) fn full_tx(&self) -> Sender<BufToDiskBatch> {
        self.full_tx.clone()
    }

    /// `(pool_full, pool_empty, to_disk)` depths, for accounting checks.
    pub fn queue_depths(&self) -> (usize, usize, usize) {
        (self.full_rx.len(), self.empty_rx.len(), self.disk_rx.len())
    }
}

struct Working {
    /// Batch buffers are handed out of, taken from `pool_full`.
    unbundle: Option<BufToDiskBatch>,
    /// Batch completed buffers are collected into, destined for `to_disk`.
    bundle: Option<BufToDiskBatch>,
}

/// Adapter between the orchestrator, which produces and consumes single
/// buffers, and the queues, which move whole batches.
pub struct Batcher {
    batch_size: usize,
    inner: Mutex<Working>,
    full_rx: Receiver<BufToDiskBatch>,
    full_tx: Sender<BufToDiskBatch>,
    empty_rx: Receiver<BufToDiskBatch>,
    empty_tx: Sender<BufToDiskBatch>,
    disk_tx: Sender<BufToDiskBatch>,
}

impl Batcher {
    pub fn new(pool: &BufferPool) -> Self {
        Batcher {
            batch_size: pool.batch_size,
            inner: Mutex::new(Working {
                unbundle: None,
                bundle: None,
            }),
            full_rx: pool.full_rx.clone(),
            full_tx: pool.full_tx.clone(),
            empty_rx: pool.empty_rx.clone(),
            empty_tx: pool.empty_tx.clone(),
            disk_tx: pool.disk_tx.clone(),
        }
    }

    /// Pop the next reusable buffer. Callers must have checked `size()`
    /// first; only the writers refill `pool_full`, so a positive `size()`
    /// cannot be invalidated by another producer.
    pub fn dequeue(&self) -> BufToDisk {
        let mut w = self.inner.lock().expect("batcher lock poisoned");
        loop {
            if let Some(buf) = w.unbundle.as_mut().and_then(Vec::pop) {
                if w.unbundle.as_ref().map(|b| b.is_empty()).unwrap_or(false) {
                    let drained = w.unbundle.take().expect("checked above");
                    self.empty_tx.send(drained).expect("pool_empty closed");
                }
                return buf;
            }
            if let Some(stale) = w.unbundle.take() {
                self.empty_tx.send(stale).expect("pool_empty closed");
            }
            let mut batch = self.full_rx.recv().expect("pool_full closed");
            // Flush padding kept the batch at full length in the queues; it
            // carries no region and ends here.
            batch.retain(|buf| !buf.is_padding());
            w.unbundle = Some(batch);
        }
    }

    /// Hand a filled buffer towards the writers. Called from the stream
    /// completion path; the lock is only held for the push.
    pub fn enqueue(&self, buf: BufToDisk) {
        let mut w = self.inner.lock().expect("batcher lock poisoned");
        if w.bundle.is_none() {
            let container = self.empty_rx.recv().expect("pool_empty closed");
            debug_assert!(container.is_empty());
            w.bundle = Some(container);
        }
        let bundle = w.bundle.as_mut().expect("just set");
        bundle.push(buf);
        if bundle.len() == self.batch_size {
            let full_bundle = w.bundle.take().expect("just filled");
            self.disk_tx.send(full_bundle).expect("to_disk closed");
        }
    }

    /// Conservative lower bound on both the buffers available to `dequeue`
    /// and the slots available to `enqueue`; the minimum of the two is the
    /// engine's sole backpressure predicate.
    pub fn size(&self) -> usize {
        let w = self.inner.lock().expect("batcher lock poisoned");
        let available =
            self.full_rx.len() * self.batch_size + w.unbundle.as_ref().map_or(0, Vec::len);
        let room = self.empty_rx.len() * self.batch_size
            + w.bundle.as_ref().map_or(0, |b| self.batch_size - b.len());
        std::cmp::min(available, room)
    }

    /// Push out a partially filled bundle, padded with zero-sized buffers,
    /// and return untouched working batches to their original pools.
    /// Idempotent. A partially consumed unbundle is padded the same way so
    /// every queued batch keeps its full length and `size()`'s per-batch
    /// arithmetic stays exact.
    pub fn flush(&self) {
        let mut w = self.inner.lock().expect("batcher lock poisoned");
        if let Some(batch) = w.unbundle.take() {
            if batch.is_empty() {
                self.empty_tx.send(batch).expect("pool_empty closed");
            } else {
                self.full_tx.send(self.pad(batch)).expect("pool_full closed");
            }
        }
        if let Some(bundle) = w.bundle.take() {
            if bundle.is_empty() {
                self.empty_tx.send(bundle).expect("pool_empty closed");
            } else {
                self.disk_tx.send(self.pad(bundle)).expect("to_disk closed");
            }
        }
    }

    fn pad(&self, mut batch: BufToDiskBatch) -> BufToDiskBatch {
        while batch.len() < self.batch_size {
            batch.push(BufToDisk::padding());
        }
        batch
    }

    /// Working batches currently held, for accounting checks.
    pub fn held_batches(&self) -> usize {
        let w = self.inner.lock().expect("batcher lock poisoned");
        w.unbundle.is_some() as usize + w.bundle.is_some() as usize
    }
}
