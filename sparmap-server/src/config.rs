//! Server configuration.

use clap::Parser;
use std::path::PathBuf;

/// Command-line configuration for the sparmap server.
#[derive(Parser, Debug, Clone)]
#[command(name = "sparmap-server", about = "SPARQL geometry heatmap server")]
pub struct ServerConfig {
    /// SPARQL backend endpoint URL.
    #[arg(long)]
    pub backend_url: String,

    /// Path for the persisted geometry cache; omit to disable persistence.
    #[arg(long)]
    pub cache_path: Option<PathBuf>,

    /// Global memory ceiling in bytes (0 = half of system memory).
    #[arg(long, default_value_t = 0)]
    pub max_memory_bytes: u64,

    /// Threads for parallel sections (0 = hardware concurrency).
    #[arg(long, default_value_t = 0)]
    pub num_threads: usize,

    /// HTTP listen port.
    #[arg(long, default_value_t = 9090)]
    pub listen_port: u16,
}

impl ServerConfig {
    /// The effective memory ceiling; 0 autodetects to half of system
    /// memory, falling back to 4 GiB when detection yields nothing.
    pub fn effective_max_memory(&self) -> u64 {
        if self.max_memory_bytes > 0 {
            return self.max_memory_bytes;
        }
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            4 << 30
        } else {
            total / 2
        }
    }
}
