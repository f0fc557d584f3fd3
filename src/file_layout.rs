use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use fdlimit::raise_fd_limit;
use glob::glob;
use log::{info, trace, warn};
use mapr::{Mmap, MmapOptions};

use crate::params::{Pc2Config, SectorParams};
use crate::tree_address::TreeAddress;

const TREE_C_KEY: &str = "tree-c";
const TREE_R_KEY: &str = "tree-r-last";
const LABEL_LAYER_KEY: &str = "layer";
const P_AUX_KEY: &str = "p_aux";
const SEALED_KEY: &str = "sealed-file";
const REPLICAS_DIR: &str = "replicas";

fn store_file_name(key: &str, partition: Option<usize>) -> String {
    match partition {
        Some(p) => format!("sc-02-data-{}-{}.dat", key, p),
        None => format!("sc-02-data-{}.dat", key),
    }
}

/// Canonical output paths. With more than one parallel sector, every sector
/// gets a three-digit subdirectory of the output dir; the sealed file moves
/// under `replicas/` when that directory exists next to the trees.
#[derive(Debug, Clone)]
pub struct FileLayout {
    output_dir: PathBuf,
    parallel_sectors: usize,
    num_partitions: usize,
}

impl FileLayout {
    pub fn new<P: AsRef<Path>>(output_dir: P, parallel_sectors: usize, num_partitions: usize) -> Self {
        FileLayout {
            output_dir: output_dir.as_ref().to_path_buf(),
            parallel_sectors,
            num_partitions,
        }
    }

    fn sector_dir(&self, sector: usize) -> PathBuf {
        debug_assert!(sector < self.parallel_sectors);
        if self.parallel_sectors == 1 {
            self.output_dir.clone()
        } else {
            self.output_dir.join(format!("{:03}", sector))
        }
    }

    fn replica_dir(&self, sector: usize) -> PathBuf {
        let replicas = self.output_dir.join(REPLICAS_DIR);
        if replicas.is_dir() {
            if self.parallel_sectors == 1 {
                replicas
            } else {
                replicas.join(format!("{:03}", sector))
            }
        } else {
            self.sector_dir(sector)
        }
    }

    fn partition_suffix(&self, partition: usize) -> Option<usize> {
        debug_assert!(partition < self.num_partitions);
        if self.num_partitions > 1 {
            Some(partition)
        } else {
            None
        }
    }

    pub fn tree_c_path(&self, sector: usize, partition: usize) -> PathBuf {
        self.sector_dir(sector)
            .join(store_file_name(TREE_C_KEY, self.partition_suffix(partition)))
    }

    pub fn tree_r_path(&self, sector: usize, partition: usize) -> PathBuf {
        self.sector_dir(sector)
            .join(store_file_name(TREE_R_KEY, self.partition_suffix(partition)))
    }

    pub fn p_aux_path(&self, sector: usize) -> PathBuf {
        self.sector_dir(sector).join(P_AUX_KEY)
    }

    pub fn sealed_path(&self, sector: usize) -> PathBuf {
        self.replica_dir(sector).join(SEALED_KEY)
    }

    /// Label file of one encoding layer, as left behind by the first phase.
    /// Layers are one-based.
    pub fn layer_path(&self, sector: usize, layer: usize) -> PathBuf {
        self.sector_dir(sector)
            .join(format!("sc-02-data-{}-{}.dat", LABEL_LAYER_KEY, layer))
    }
}

/// Write handle for one destination file. All writes go through `pwrite`, so
/// any number of threads may target disjoint ranges concurrently.
#[derive(Debug)]
pub struct SectorFile {
    file: File,
    path: PathBuf,
    writes_enabled: bool,
}

impl SectorFile {
    pub fn create(path: &Path, len: u64, writes_enabled: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {:?}", parent))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open {:?}", path))?;
        file.set_len(len)
            .with_context(|| format!("failed to size {:?}", path))?;
        advise_random(&file);
        trace!("opened {:?} at {} bytes", path, len);

        Ok(SectorFile {
            file,
            path: path.to_path_buf(),
            writes_enabled,
        })
    }

    pub fn write_data(&self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        if !self.writes_enabled {
            return Ok(());
        }
        self.file.write_all_at(buf, offset)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
fn advise_random(file: &File) {
    use std::os::unix::io::AsRawFd;

    let ret = unsafe { libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_RANDOM) };
    if ret != 0 {
        warn!("posix_fadvise failed: {}", ret);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_random(_file: &File) {}

/// Every open output handle of a run.
#[derive(Debug)]
pub struct SectorFiles {
    /// `[sector][partition]`; empty in tree-r-only mode.
    pub tree_c: Vec<Vec<Arc<SectorFile>>>,
    /// `[sector][partition]`.
    pub tree_r: Vec<Vec<Arc<SectorFile>>>,
    /// `[sector]`; absent in tree-r-only mode.
    pub sealed: Vec<Arc<SectorFile>>,
    /// Read-only maps of the per-sector data files (`None` for CC sectors).
    pub data: Vec<Option<Mmap>>,
}

/// Create and pre-size all output files, and map the optional data files.
pub fn open_files(
    layout: &FileLayout,
    params: &SectorParams,
    config: &Pc2Config,
    addr_c: &TreeAddress,
    addr_r: &TreeAddress,
) -> Result<SectorFiles> {
    let _ = raise_fd_limit();

    let sectors = params.parallel_sectors;
    let writes = !config.disable_file_writes;
    info!(
        "opening output files for {} sectors, {} partitions",
        sectors, params.num_partitions
    );

    let mut tree_c = Vec::with_capacity(sectors);
    let mut tree_r = Vec::with_capacity(sectors);
    let mut sealed = Vec::with_capacity(sectors);
    let mut data = Vec::with_capacity(sectors);

    for s in 0..sectors {
        if !config.tree_r_only {
            let per_partition = (0..params.num_partitions)
                .map(|p| {
                    SectorFile::create(&layout.tree_c_path(s, p), addr_c.data_size(), writes)
                        .map(Arc::new)
                })
                .collect::<Result<Vec<_>>>()?;
            tree_c.push(per_partition);
        }

        let per_partition = (0..params.num_partitions)
            .map(|p| {
                SectorFile::create(&layout.tree_r_path(s, p), addr_r.data_size(), writes)
                    .map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        tree_r.push(per_partition);

        if !config.tree_r_only {
            sealed.push(Arc::new(SectorFile::create(
                &layout.sealed_path(s),
                params.sector_size(),
                writes,
            )?));
        }

        let map = match config.data_files.get(s).and_then(|f| f.as_ref()) {
            Some(path) => {
                let file =
                    File::open(path).with_context(|| format!("failed to open {:?}", path))?;
                let len = file.metadata()?.len();
                ensure!(
                    len == params.sector_size(),
                    "data file {:?} is {} bytes, expected {}",
                    path,
                    len,
                    params.sector_size()
                );
                // Safety: the file is opened read-only and never truncated
                // while mapped.
                Some(unsafe { MmapOptions::new().map(&file)? })
            }
            None => None,
        };
        data.push(map);
    }

    Ok(SectorFiles {
        tree_c,
        tree_r,
        sealed,
        data,
    })
}

fn remove_files_with_glob(glob_path: &Path) -> Result<()> {
    let globs = glob(glob_path.to_str().expect("path must be valid UTF-8"))
        .expect("glob pattern must be valid");
    for maybe_path in globs {
        let path = maybe_path?;
        fs::remove_file(&path).with_context(|| format!("failed to delete {:?}", &path))?;
    }
    Ok(())
}

/// Remove exactly the files a run emits: both trees, the sealed data, and
/// `p_aux`, for every sector.
pub fn clear_sector_files(layout: &FileLayout) -> Result<()> {
    for s in 0..layout.parallel_sectors {
        let dir = layout.sector_dir(s);
        // Trees may be split into per-partition files which share the name
        // save for the partition index, hence the glob after the key.
        remove_files_with_glob(&dir.join(format!("sc-02-data-{}*.dat", TREE_C_KEY)))?;
        remove_files_with_glob(&dir.join(format!("sc-02-data-{}*.dat", TREE_R_KEY)))?;
        trace!("trees deleted for sector {}", s);

        let p_aux = layout.p_aux_path(s);
        if p_aux.exists() {
            fs::remove_file(&p_aux).with_context(|| format!("failed to delete {:?}", p_aux))?;
        }
        let sealed = layout.sealed_path(s);
        if sealed.exists() {
            fs::remove_file(&sealed).with_context(|| format!("failed to delete {:?}", sealed))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_single_sector() {
        let layout = FileLayout::new("/cache", 1, 1);
        assert_eq!(
            layout.tree_c_path(0, 0),
            PathBuf::from("/cache/sc-02-data-tree-c.dat")
        );
        assert_eq!(
            layout.tree_r_path(0, 0),
            PathBuf::from("/cache/sc-02-data-tree-r-last.dat")
        );
        assert_eq!(layout.p_aux_path(0), PathBuf::from("/cache/p_aux"));
        assert_eq!(layout.sealed_path(0), PathBuf::from("/cache/sealed-file"));
    }

    #[test]
    fn test_paths_multi_sector_multi_partition() {
        let layout = FileLayout::new("/cache", 4, 8);
        assert_eq!(
            layout.tree_c_path(2, 7),
            PathBuf::from("/cache/002/sc-02-data-tree-c-7.dat")
        );
        assert_eq!(
            layout.tree_r_path(3, 0),
            PathBuf::from("/cache/003/sc-02-data-tree-r-last-0.dat")
        );
        assert_eq!(
            layout.layer_path(1, 11),
            PathBuf::from("/cache/001/sc-02-data-layer-11.dat")
        );
    }

    #[test]
    fn test_clear_removes_outputs() {
        let dir = tempfile::tempdir().expect("tempdir failure");
        let layout = FileLayout::new(dir.path(), 2, 2);
        for s in 0..2 {
            for p in 0..2 {
                SectorFile::create(&layout.tree_c_path(s, p), 64, true).expect("create failure");
                SectorFile::create(&layout.tree_r_path(s, p), 64, true).expect("create failure");
            }
            SectorFile::create(&layout.sealed_path(s), 64, true).expect("create failure");
            fs::write(layout.p_aux_path(s), [0u8; 64]).expect("write failure");
        }

        clear_sector_files(&layout).expect("clear failure");
        for s in 0..2 {
            assert!(!layout.tree_c_path(s, 0).exists());
            assert!(!layout.tree_r_path(s, 1).exists());
            assert!(!layout.sealed_path(s).exists());
            assert!(!layout.p_aux_path(s).exists());
        }
    }
}
