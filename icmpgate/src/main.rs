use clap::Parser;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aya::maps::RingBuf;
use aya::programs::{tc, SchedClassifier, TcAttachType};
use aya::Ebpf;

use icmpgate_common::{FilterEngine, Verdict, VerdictEvent};

mod api;
mod config;
mod dns;
mod state;
mod storage;

use config::{CliArgs, Config};
use state::DropRecord;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── eBPF setup ────────────────────────────────────────────────────
    // The object is produced by `cargo xtask build-ebpf` and loaded from
    // disk at startup, so building the daemon never requires the bpf
    // toolchain.
    let mut bpf = Ebpf::load_file(&config.ebpf_object)?;

    // Attach the TC filter to the target interface.
    let iface = config.interface.as_deref().unwrap_or("eth0");

    // If the clsact qdisc already exists (EEXIST), that is fine.
    if let Err(e) = tc::qdisc_add_clsact(iface) {
        if e.raw_os_error() != Some(17) {
            return Err(e.into());
        }
        tracing::debug!("clsact qdisc already exists on {}, reusing", iface);
    }
    let program: &mut SchedClassifier = bpf.program_mut("icmpgate").unwrap().try_into()?;

    program.load()?;
    program.attach(iface, TcAttachType::Ingress)?;
    tracing::info!(
        "icmpgate attached to {} (ingress): inbound echo requests will be dropped",
        iface
    );

    // ── Engine ────────────────────────────────────────────────────────
    // The filtering session starts here with the counter at zero; it ends
    // at the final report below.
    let engine = Arc::new(FilterEngine::new());

    // ── Channels ──────────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel::<DropRecord>(10000);

    // ── State & Storage ───────────────────────────────────────────────
    let filter_state = Arc::new(state::FilterState::new());
    let storage = Arc::new(storage::Storage::new(&config.db_path)?);

    // ── Storage Writer Task ───────────────────────────────────────────
    let storage_clone = storage.clone();
    let aggregation_window = config.aggregation_window_seconds;
    tokio::spawn(async move {
        storage_clone.run_writer(rx, aggregation_window).await;
    });

    // ── Source Cleanup Task ───────────────────────────────────────────
    let filter_state_cleanup = filter_state.clone();
    let idle_timeout = config.source_idle_timeout;
    tokio::spawn(async move {
        let mut cleanup_interval = interval(Duration::from_secs(10));
        loop {
            cleanup_interval.tick().await;
            filter_state_cleanup.cleanup_stale_sources(Duration::from_secs(idle_timeout));
        }
    });

    // ── Data Retention Task ───────────────────────────────────────────
    if let Some(retention_seconds) = config.data_retention_seconds {
        let storage_retention = storage.clone();
        tokio::spawn(async move {
            let mut retention_interval = interval(Duration::from_secs(60));
            loop {
                retention_interval.tick().await;
                match storage_retention.delete_old_data(retention_seconds) {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!("Drop-log retention: deleted {} old rows", deleted);
                    }
                    Err(e) => {
                        tracing::error!("Drop-log retention cleanup failed: {}", e);
                    }
                    _ => {}
                }
            }
        });
    }

    // ── Final report on shutdown ──────────────────────────────────────
    let engine_shutdown = engine.clone();
    ctrlc::set_handler(move || {
        tracing::info!(
            "icmpgate unloaded. Total packets dropped: {}",
            engine_shutdown.snapshot_count()
        );
        std::process::exit(0);
    })?;

    // ── DNS Cache (optional) ──────────────────────────────────────────
    let dns_cache = if config.resolve_dns {
        tracing::info!("Reverse DNS resolution enabled for dropped sources");
        Some(Arc::new(dns::ReverseDns::new(
            Duration::from_secs(300),
            Duration::from_secs(2),
        )))
    } else {
        None
    };

    // ── RingBuf Poller ────────────────────────────────────────────────
    let events_map = bpf.take_map("EVENTS").unwrap();
    let ring_buf = RingBuf::try_from(events_map)?;
    let tx_ring = tx.clone();
    let engine_ring = engine.clone();
    let filter_state_ring = filter_state.clone();

    tokio::spawn(async move {
        poll_ring_buf(ring_buf, engine_ring, filter_state_ring, tx_ring, dns_cache).await;
    });

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        filter: filter_state.clone(),
        engine: engine.clone(),
        storage: storage.clone(),
        start_time: std::time::Instant::now(),
    });

    let allowed_ips = config.allowed_ips.clone();
    let app = api::router(app_state, &allowed_ips);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Continuously poll the RingBuf for VerdictEvent entries, run each header
/// snapshot through the engine, and fan the decision out to the log, the
/// live state, and the storage writer.
///
/// The TC hook has already enforced the drop on the wire; the engine here
/// renders the same decision over the copied bytes so the counter and the
/// diagnostics come from one place.
async fn poll_ring_buf(
    mut ring_buf: RingBuf<aya::maps::MapData>,
    engine: Arc<FilterEngine>,
    filter_state: Arc<state::FilterState>,
    tx: mpsc::Sender<DropRecord>,
    dns_cache: Option<Arc<dns::ReverseDns>>,
) {
    loop {
        while let Some(item) = ring_buf.next() {
            if item.len() < core::mem::size_of::<VerdictEvent>() {
                continue;
            }
            let event = unsafe { core::ptr::read_unaligned(item.as_ptr() as *const VerdictEvent) };

            let (verdict, diag) = engine.inspect(event.snapshot());
            match verdict {
                Verdict::Pass => {
                    tracing::debug!(
                        "passed ICMP datagram ({}): {} bytes",
                        diag.reason,
                        event.pkt_len
                    );
                    filter_state.note_pass();
                }
                Verdict::Drop => {
                    let Some(mut record) = DropRecord::from_event(&event, &diag) else {
                        continue;
                    };

                    // Enrich with reverse DNS if enabled.
                    if let Some(ref cache) = dns_cache {
                        if let Ok(src) = record.src_ip.parse::<Ipv4Addr>() {
                            record.src_hostname = cache.resolve(src).await;
                        }
                    }

                    tracing::info!(
                        "Dropped ICMP Echo Request: {} bytes from {}",
                        record.length,
                        record.src_ip
                    );

                    let src = record
                        .src_ip
                        .parse::<Ipv4Addr>()
                        .unwrap_or(Ipv4Addr::UNSPECIFIED);
                    filter_state.note_drop(src, &record);
                    let _ = tx.send(record).await;
                }
            }
        }

        // Yield briefly to avoid busy-spinning when the ring buffer is empty.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}
