//! Runtime configuration consumed by the server core

/// Plain settings struct; `main` fills it from CLI flags, tests build it
/// directly.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// Number of SELECT-able databases.
    pub databases: usize,
    /// Cron frequency (ticks per second).
    pub hz: u32,
    /// Quicklist fill factor: positive = entries per node, -1..-5 = byte
    /// ladder 4k/8k/16k/32k/64k.
    pub list_fill: i32,
    /// Quicklist nodes left uncompressed at each end; 0 disables
    /// compression.
    pub list_compress_depth: u32,
    /// Hash stays packed up to this many fields...
    pub hash_max_packed_entries: usize,
    /// ...and while every field/value fits this many bytes.
    pub hash_max_packed_value: usize,
    /// Replica role: reads do not delete logically expired keys, writes
    /// inside transactions are refused.
    pub replica: bool,
    pub max_clients: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 6379,
            databases: 16,
            hz: 10,
            list_fill: -2,
            list_compress_depth: 0,
            hash_max_packed_entries: 128,
            hash_max_packed_value: 64,
            replica: false,
            max_clients: 10_000,
        }
    }
}
