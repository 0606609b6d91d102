//! Runtime configuration.
//!
//! The server accepts no arguments in standard operation — the client
//! collaborator simply runs the binary over the secure-shell session.
//! Every flag here is an operator knob with a working default.

use clap::Parser;

/// Remote-side RPC server for editor-integrated remote file access.
#[derive(Debug, Clone, Parser)]
#[command(name = "tramp-rpc-server", version, about)]
pub struct Config {
    /// Number of concurrently executing request handlers.
    #[arg(long, default_value_t = 16)]
    pub workers: usize,

    /// Maximum accepted frame payload, in MiB.
    #[arg(long = "max-frame-mib", default_value_t = 64)]
    pub max_frame_mib: u32,

    /// Concurrency bound for `commands.run_parallel` (0 = number of CPUs).
    #[arg(long, default_value_t = 0)]
    pub parallelism: usize,

    /// Log filter for stderr diagnostics (overridden by RUST_LOG).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Frame cap in bytes.
    pub fn max_payload(&self) -> u32 {
        self.max_frame_mib.saturating_mul(1024 * 1024)
    }

    /// Effective parallelism for `commands.run_parallel`.
    pub fn effective_parallelism(&self) -> usize {
        if self.parallelism > 0 {
            self.parallelism
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 16,
            max_frame_mib: 64,
            parallelism: 0,
            log_level: "info".into(),
        }
    }
}
