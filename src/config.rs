use std::path::PathBuf;
use std::time::Duration;

/// Largest slice the parser requests for body bytes.
pub const CHUNK_LENGTH: usize = 65536;

/// Paths and tunables of the update engine.
///
/// The defaults are the production values; the host process overrides
/// individual fields before constructing the engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the staging partition in the system mtd table.
    pub partition_name: String,
    /// Directory owning the two resume-context files.
    pub resume_dir: PathBuf,
    /// Single-byte download status file.
    pub status_file: PathBuf,
    /// How long to wait for input before reporting a timeout.
    pub read_deadline: Duration,
    /// Wall-clock interval between watchdog kicks while waiting for input.
    pub wdog_kick_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            partition_name: "swifota".to_owned(),
            resume_dir: PathBuf::from("/var/lib/fwupdate"),
            status_file: PathBuf::from("/var/lib/fwupdate/dwl_status"),
            read_deadline: Duration::from_secs(900),
            wdog_kick_interval: Duration::from_secs(30),
        }
    }
}
