use serde::Deserialize;
use std::fs;
use std::path::Path;

/// Daemon configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interface to attach the TC filter on.
    #[serde(default)]
    pub interface: Option<String>,

    /// Path to the compiled eBPF object (built via `cargo xtask build-ebpf`).
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: String,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database path for the drop log.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Seconds without a drop before a tracked source is evicted.
    #[serde(default = "default_source_idle_timeout")]
    pub source_idle_timeout: u64,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Drop-log retention in seconds (None = keep forever).
    #[serde(default)]
    pub data_retention_seconds: Option<u64>,

    /// Aggregation window in seconds. 0 = store individual drops.
    #[serde(default)]
    pub aggregation_window_seconds: u64,

    /// Reverse-resolve the source address of dropped datagrams.
    #[serde(default)]
    pub resolve_dns: bool,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_ebpf_object() -> String {
    "icmpgate-ebpf/target/bpfel-unknown-none/debug/icmpgate".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "drops.db".to_string()
}

fn default_source_idle_timeout() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            ebpf_object: default_ebpf_object(),
            port: default_port(),
            db_path: default_db_path(),
            source_idle_timeout: default_source_idle_timeout(),
            quiet: false,
            data_retention_seconds: None,
            aggregation_window_seconds: 0,
            resolve_dns: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.interface.is_some() {
            self.interface = cli.interface.clone();
        }
        if cli.ebpf_object != default_ebpf_object() {
            self.ebpf_object = cli.ebpf_object.clone();
        }
        if cli.port != default_port() {
            self.port = cli.port;
        }
        if cli.db_path != default_db_path() {
            self.db_path = cli.db_path.clone();
        }
        if cli.source_idle_timeout != default_source_idle_timeout() {
            self.source_idle_timeout = cli.source_idle_timeout;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.data_retention.is_some() {
            self.data_retention_seconds = cli.data_retention;
        }
        if cli.aggregation_window != 0 {
            self.aggregation_window_seconds = cli.aggregation_window;
        }
        if cli.resolve_dns {
            self.resolve_dns = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }
}

use clap::Parser;

/// icmpgate: inline filter that drops inbound ICMP echo requests
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network interface to filter (e.g., eth0).
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Path to the compiled eBPF object.
    #[arg(long, default_value = "icmpgate-ebpf/target/bpfel-unknown-none/debug/icmpgate")]
    pub ebpf_object: String,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// SQLite database path for the drop log.
    #[arg(long, default_value = "drops.db")]
    pub db_path: String,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Seconds without a drop before a tracked source is evicted.
    #[arg(long, default_value_t = 300)]
    pub source_idle_timeout: u64,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Drop-log retention in seconds (delete entries older than this).
    #[arg(long)]
    pub data_retention: Option<u64>,

    /// Aggregation window in seconds (0 = store individual drops).
    #[arg(long, default_value_t = 0)]
    pub aggregation_window: u64,

    /// Reverse-resolve the source address of dropped datagrams.
    #[arg(long)]
    pub resolve_dns: bool,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}
