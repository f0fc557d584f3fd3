use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::buffer_pool::{BufToDisk, BufToDiskBatch, BufferPool, HostStorage};
use crate::cores::{bind_core, CoreIndex};
use crate::params::NODE_SIZE;

/// Pool of threads draining `to_disk`. A writer keeps running until it is
/// told to terminate *and* the queue is empty; drained batches return to
/// `pool_full` with their buffers cleared.
pub struct WriterPool {
    handles: Vec<JoinHandle<()>>,
    terminate: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl WriterPool {
    pub fn spawn(
        pool: &BufferPool,
        threads: usize,
        first_core: Option<usize>,
        max_write_size: usize,
    ) -> Self {
        assert!(threads >= 1, "at least one disk writer is required");
        let terminate = Arc::new(AtomicBool::new(false));
        let active = Arc::new(AtomicUsize::new(threads));

        let handles = (0..threads)
            .map(|w| {
                let disk_rx = pool.disk_rx();
                let full_tx = pool.full_tx();
                let storage = pool.storage();
                let terminate = Arc::clone(&terminate);
                let active = Arc::clone(&active);

                thread::Builder::new()
                    .name(format!("pc2-writer-{}", w))
                    .spawn(move || {
                        let _cleanup = first_core.and_then(|core| {
                            match bind_core(CoreIndex::new(core + w)) {
                                Ok(cleanup) => Some(cleanup),
                                Err(err) => {
                                    warn!("writer {}: failed to bind core: {:?}", w, err);
                                    None
                                }
                            }
                        });
                        writer_loop(w, disk_rx, full_tx, storage, terminate, active, max_write_size);
                    })
                    .expect("failed to spawn disk writer")
            })
            .collect();

        WriterPool {
            handles,
            terminate,
            active,
        }
    }

    pub fn terminate(&self) {
        self.terminate.store(true, SeqCst);
    }

    /// Writers still draining the queue.
    pub fn active(&self) -> usize {
        self.active.load(SeqCst)
    }

    pub fn join(mut self) {
        for handle in self.handles.drain(..) {
            handle.join().expect("disk writer panicked");
        }
    }
}

fn writer_loop(
    id: usize,
    disk_rx: Receiver<BufToDiskBatch>,
    full_tx: Sender<BufToDiskBatch>,
    storage: Arc<HostStorage>,
    terminate: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    max_write_size: usize,
) {
    let mut staging = vec![0u8; max_write_size];
    loop {
        match disk_rx.recv_timeout(Duration::from_millis(10)) {
            Ok(mut batch) => {
                for buf in batch.iter_mut() {
                    if buf.len > 0 {
                        // Safety: a buffer travelling through `to_disk` is
                        // owned by this writer until the batch is returned.
                        let region = unsafe { storage.region(buf.buf) };
                        write_buf(buf, region, &mut staging);
                    }
                    buf.clear();
                }
                full_tx.send(batch).expect("pool_full closed");
            }
            Err(RecvTimeoutError::Timeout) => {
                if terminate.load(SeqCst) && disk_rx.is_empty() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("disk writer {} exiting", id);
    active.fetch_sub(1, SeqCst);
}

/// Issue the writes for one buffer. Contiguous buffers hold one run per
/// sector back to back; strided buffers interleave the sectors per element
/// and are gathered through `staging`. Byte reversal always takes the
/// gather path.
pub(crate) fn write_buf(buf: &BufToDisk, region: &[u8], staging: &mut [u8]) {
    let size = buf.size as usize;
    assert!(
        size <= staging.len(),
        "write of {} bytes exceeds the staging buffer",
        size
    );
    if buf.stride == 1 && !buf.reverse {
        for (i, dst) in buf.dst.iter().enumerate() {
            dst.write_data(buf.offset, &region[i * size..][..size])
                .expect("disk write failed");
        }
    } else {
        let nodes = size / NODE_SIZE;
        for (i, dst) in buf.dst.iter().enumerate() {
            for j in 0..nodes {
                let src = (i + j * buf.stride) * NODE_SIZE;
                let element = &region[src..][..NODE_SIZE];
                let out = &mut staging[j * NODE_SIZE..][..NODE_SIZE];
                if buf.reverse {
                    for (o, b) in out.iter_mut().zip(element.iter().rev()) {
                        *o = *b;
                    }
                } else {
                    out.copy_from_slice(element);
                }
            }
            dst.write_data(buf.offset, &staging[..size])
                .expect("disk write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;

    use crate::file_layout::SectorFile;

    fn make_jobs(dir: &std::path::Path) -> (Vec<BufToDisk>, Vec<u8>) {
        let file_a = Arc::new(
            SectorFile::create(&dir.join("a.dat"), 256, true).expect("create failure"),
        );
        let file_b = Arc::new(
            SectorFile::create(&dir.join("b.dat"), 256, true).expect("create failure"),
        );

        let mut region = vec![0u8; 4 * NODE_SIZE];
        for (i, byte) in region.iter_mut().enumerate() {
            *byte = i as u8;
        }

        let jobs = vec![
            BufToDisk {
                buf: 0,
                len: 4,
                offset: 0,
                size: 2 * NODE_SIZE as u64,
                stride: 1,
                reverse: false,
                dst: vec![Arc::clone(&file_a), Arc::clone(&file_b)],
            },
            BufToDisk {
                buf: 0,
                len: 4,
                offset: 128,
                size: 2 * NODE_SIZE as u64,
                stride: 2,
                reverse: true,
                dst: vec![file_a, file_b],
            },
        ];
        (jobs, region)
    }

    #[test]
    fn test_reordered_writes_commute() {
        // Writes target disjoint ranges, so any execution order must produce
        // identical file contents.
        let dir_fwd = tempfile::tempdir().expect("tempdir failure");
        let dir_rev = tempfile::tempdir().expect("tempdir failure");
        let mut staging = vec![0u8; 1024];

        let (jobs, region) = make_jobs(dir_fwd.path());
        for buf in &jobs {
            write_buf(buf, &region, &mut staging);
        }

        let (jobs, region) = make_jobs(dir_rev.path());
        for buf in jobs.iter().rev() {
            write_buf(buf, &region, &mut staging);
        }

        for name in &["a.dat", "b.dat"] {
            let fwd = fs::read(dir_fwd.path().join(name)).expect("read failure");
            let rev = fs::read(dir_rev.path().join(name)).expect("read failure");
            assert_eq!(fwd, rev);
        }
    }

    #[test]
    fn test_strided_gather_reverses_elements() {
        let dir = tempfile::tempdir().expect("tempdir failure");
        let file = Arc::new(
            SectorFile::create(&dir.path().join("s.dat"), 64, true).expect("create failure"),
        );

        // two sectors interleaved per element; we write sector 1
        let mut region = vec![0u8; 4 * NODE_SIZE];
        region[NODE_SIZE] = 0xaa; // element (node 0, sector 1), first byte
        region[3 * NODE_SIZE + 31] = 0xbb; // element (node 1, sector 1), last byte

        let buf = BufToDisk {
            buf: 0,
            len: 4,
            offset: 0,
            size: 2 * NODE_SIZE as u64,
            stride: 2,
            reverse: true,
            dst: vec![Arc::new(
                SectorFile::create(&dir.path().join("ignored.dat"), 64, true).expect("create failure"),
            ), file],
        };
        let mut staging = vec![0u8; 256];
        write_buf(&buf, &region, &mut staging);

        let bytes = fs::read(dir.path().join("s.dat")).expect("read failure");
        assert_eq!(bytes[31], 0xaa, "element bytes must be reversed");
        assert_eq!(bytes[32], 0xbb);
    }
}
