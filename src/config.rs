use std::{ffi::OsString, time::Duration};

const DEFAULT_SSH_PROGRAM: &str = "ssh";
const DEFAULT_REQUEST_LEN: u32 = 32 * 1024;
const DEFAULT_MAX_OUTSTANDING: usize = 8;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_MAX_SYMLINK_DEPTH: usize = 32;

/// Environment variable overriding the ssh client program.
pub const SSH_PROGRAM_ENV: &str = "SFTP_VFS_SSH";

/// Tunables of the filesystem backend.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Program spawned to reach the server.
    pub ssh_program: OsString,

    /// Byte length of one READ/WRITE sub-request.
    pub request_len: u32,

    /// Maximum number of sub-requests in flight for one read or write.
    pub max_outstanding: usize,

    /// How long an unused connection is kept before it is closed.
    pub idle_timeout: Duration,

    /// How long to wait for the server or a prompt during login.
    pub prompt_timeout: Duration,

    /// Bound on the number of links followed by one stat.
    pub max_symlink_depth: usize,

    /// Send SYMLINK with the target first, as OpenSSH's server expects.
    pub reverse_symlink_arguments: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ssh_program: DEFAULT_SSH_PROGRAM.into(),
            request_len: DEFAULT_REQUEST_LEN,
            max_outstanding: DEFAULT_MAX_OUTSTANDING,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            max_symlink_depth: DEFAULT_MAX_SYMLINK_DEPTH,
            reverse_symlink_arguments: true,
        }
    }
}

impl Config {
    /// The defaults, with the ssh program taken from `SFTP_VFS_SSH` if set.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(program) = std::env::var_os(SSH_PROGRAM_ENV).filter(|p| !p.is_empty()) {
            config.ssh_program = program;
        }
        config
    }

    /// Preferred I/O size reported in file info.
    pub fn io_block_size(&self) -> u64 {
        u64::from(self.request_len) * self.max_outstanding as u64
    }
}
