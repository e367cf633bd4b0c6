//! Defaults shared by the command line, the config file and the replay engine
pub const DEFAULT_PACKET_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_LIVE_CONNECTIONS: usize = 65_536;
pub const DEFAULT_REQUEST_TIMEOUT: &str = "30s";
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1024;
pub const DEFAULT_INPUT_BATCH_SIZE: usize = 256;
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const READ_BUFFER_SIZE: usize = 16 * 1024;

pub const EXIT_USAGE: i32 = 2;
pub const EXIT_BAD_TARGET: i32 = 3;
pub const EXIT_TRANSPORT_SETUP: i32 = 4;
pub const EXIT_RUNTIME: i32 = 5;
