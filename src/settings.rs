use config::{Config, ConfigError, Environment, File};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

lazy_static! {
    pub static ref SETTINGS: Settings = Settings::new().expect("invalid configuration");
}

const SETTINGS_PATH: &str = "./rust-fil-pc2.config.toml";
const PREFIX: &str = "FIL_PC2";

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Leaf nodes hashed per work item and stream.
    pub batch_size: usize,
    pub stream_count: usize,
    /// Buffers aggregated into one disk-write batch.
    pub disk_io_batch_size: usize,
    /// Batches pre-populated with result buffers.
    pub num_host_batches: usize,
    /// Spare batch containers kept for the bundling side.
    pub num_host_empty_batches: usize,
    /// Largest single write a disk writer will stage, in bytes.
    pub max_write_size: usize,
    pub writer_threads: usize,
    /// Keep the full queue flow but skip the actual writes (benchmarking).
    pub disable_file_writes: bool,
    /// Skip layer reads and hash whatever the staging slots hold (benchmarking).
    pub disable_page_reads: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            batch_size: 64,
            stream_count: 8,
            disk_io_batch_size: 8,
            num_host_batches: 32,
            num_host_empty_batches: 4,
            max_write_size: 262_144,
            writer_threads: std::cmp::min(4, num_cpus::get()),
            disable_file_writes: false,
            disable_page_reads: false,
        }
    }
}

impl Settings {
    fn new() -> Result<Settings, ConfigError> {
        let mut s = Config::new();

        s.merge(File::with_name(SETTINGS_PATH).required(false))?;
        s.merge(Environment::with_prefix(PREFIX))?;

        s.try_into()
    }
}
