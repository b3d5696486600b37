//! msingid - farmer-owned proof server
//!
//! Pipeline: serial bytes -> LoRa ingress -> packet verifier (reads the
//! merkle registry, writes the nullifier store) -> prover dispatcher ->
//! external prover. An HTTP/WS surface exposes health, registration,
//! witness retrieval and the reward claim flow.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

mod api;
mod clock;
mod config;
mod counters;
mod error;
mod events;
mod lora;
mod persist;
mod prover;
mod registry;
mod store;
mod verifier;

use crate::api::AppState;
use crate::clock::Clock;
use crate::config::Config;
use crate::counters::Counters;
use crate::error::{MerkleErrorExt, SpendError};
use crate::events::{EventHub, EventKind};
use crate::lora::{Ingress, IngressQueue, INGRESS_QUEUE_CAP};
use crate::prover::{DispatchJob, Dispatcher, DispatcherHandle, OrphanLedger, ProofInputs, ProverClient, Witness};
use crate::registry::RegistryService;
use crate::store::NullifierStore;
use crate::verifier::{EnrollPolicy, PacketVerifier};

/// exit codes: 0 clean, 1 fatal startup, 2 corrupt state, 3 bad config
const EXIT_FATAL: u8 = 1;
const EXIT_CORRUPT: u8 = 2;
const EXIT_CONFIG: u8 = 3;

/// shutdown grace before in-flight work is abandoned
const GRACE: Duration = Duration::from_secs(10);

/// a second signal inside this window aborts immediately
const SECOND_SIGNAL_WINDOW: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "msingid")]
#[command(about = "farmer-owned proof server for LoRa telemetry", long_about = None)]
struct Args {
    /// JSON config file; MSINGI_* environment variables override it
    #[arg(long, env = "MSINGI_CONFIG")]
    config: Option<PathBuf>,

    /// replay a capture file of +RCV= lines instead of a serial port
    #[arg(long)]
    simulate: Option<PathBuf>,
}

/// startup failures that decide the exit code
enum Fatal {
    Startup(String),
    Corrupt(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "msingid=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match run(config, args.simulate).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Fatal::Corrupt(msg)) => {
            error!("corrupt persisted state: {}", msg);
            ExitCode::from(EXIT_CORRUPT)
        }
        Err(Fatal::Startup(msg)) => {
            error!("fatal startup error: {}", msg);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

async fn run(config: Config, simulate: Option<PathBuf>) -> Result<(), Fatal> {
    info!("starting msingid v{}", env!("CARGO_PKG_VERSION"));
    info!("  listen: {}:{}", config.server.bind, config.server.port);
    info!(
        "  lora: {} @ {} ({} MHz, sf{}, bw{})",
        config.lora.port,
        config.lora.baud,
        config.lora.freq_hz / 1_000_000,
        config.lora.sf,
        config.lora.bw_khz
    );
    info!("  epoch length: {}s", config.epoch.len_s);
    info!("  merkle: depth {} at {}", config.merkle.depth, config.merkle.snapshot_path.display());
    info!("  nullifiers: {}", config.nullifier.store_path.display());
    info!(
        "  policy: {}",
        if config.auto_enroll.enabled {
            "auto-enroll"
        } else {
            "strict"
        }
    );
    if config.prover.mock {
        warn!("mock proofs enabled (demo mode): nothing will settle on-chain");
    } else if let Some(url) = &config.prover.url {
        info!("  prover: {}", url);
    }
    if config.demo_mode {
        warn!("demo mode: admin gates relaxed");
    }

    // clock first; everything downstream stamps through it
    let clock = Clock::system(config.epoch.len_s);

    // restore persisted state before anything can mutate it
    let registry = RegistryService::open(&config.merkle.snapshot_path, config.merkle.depth)
        .map_err(|e| {
            if e.is_corrupt() {
                Fatal::Corrupt(e.to_string())
            } else {
                Fatal::Startup(e.to_string())
            }
        })?;
    let (store, latest_spend_ms) = NullifierStore::open(
        &config.nullifier.store_path,
        clock.clone(),
        config.epoch.max_lag,
        config.epoch.max_lead,
    )
    .map_err(|e| match e {
        SpendError::Corrupt { .. } => Fatal::Corrupt(e.to_string()),
        other => Fatal::Startup(other.to_string()),
    })?;
    let store = Arc::new(store);
    clock
        .check_restore(latest_spend_ms)
        .map_err(|e| Fatal::Startup(e.to_string()))?;

    let counters = Arc::new(Counters::default());
    let hub = EventHub::new(clock.clone());
    let orphans = OrphanLedger::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // prover dispatcher
    let client = ProverClient::new(&config.prover);
    let prover_mock = client.is_mock();
    let (dispatcher, worker_handles) = Dispatcher::spawn(
        client,
        store.clone(),
        counters.clone(),
        hub.clone(),
        orphans.clone(),
        clock.clone(),
        config.prover.max_attempts,
        shutdown_rx.clone(),
    );

    // verify pipeline
    let policy = if config.auto_enroll.enabled {
        EnrollPolicy::AutoEnroll
    } else {
        EnrollPolicy::Strict
    };
    let verifier = Arc::new(PacketVerifier::new(
        registry.clone(),
        clock.clone(),
        hub.clone(),
        config.packet.skew_s,
        policy,
        config.auto_enroll.per_src_per_min,
    ));
    let queue = Arc::new(IngressQueue::new(INGRESS_QUEUE_CAP));
    let pipeline_handle = tokio::spawn(run_pipeline(
        queue.clone(),
        verifier,
        dispatcher.clone(),
        counters.clone(),
        hub.clone(),
        shutdown_rx.clone(),
    ));

    // API before ingress so /health answers while the port settles
    let ingress_ready = Arc::new(AtomicBool::new(false));
    let state = Arc::new(AppState {
        registry: registry.clone(),
        store: store.clone(),
        dispatcher,
        orphans,
        hub: hub.clone(),
        counters: counters.clone(),
        clock: clock.clone(),
        admin_mode: config.admin.mode,
        admin_secret: config.admin.secret.clone(),
        demo_mode: config.demo_mode,
        prover_mock,
        ingress_ready: ingress_ready.clone(),
        cors_origins: config.cors.allow_origins.clone(),
        started_at: Instant::now(),
    });
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| Fatal::Startup(format!("bad bind address: {}", e)))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Fatal::Startup(format!("bind {}: {}", addr, e)))?;
    info!("api listening on {}", addr);
    let server_handle = {
        let mut rx = shutdown_rx.clone();
        let app = api::router(state);
        tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            });
            if let Err(e) = serve.await {
                error!("api server error: {}", e);
            }
        })
    };

    // ingress last: state is restored, verifier and API are live
    let ingress = Ingress::new(
        config.lora.clone(),
        queue,
        counters.clone(),
        hub.clone(),
        ingress_ready,
    );
    let ingress_handle = match simulate {
        Some(path) => {
            let capture = lora::load_capture(&path)
                .map_err(|e| Fatal::Startup(format!("capture {}: {}", path.display(), e)))?;
            info!("simulated ingress: replaying {} lines", capture.len());
            let mut rx = shutdown_rx.clone();
            tokio::spawn(async move {
                let transport = lora::replay_transport(capture);
                if let Err(e) = ingress.run_port(transport, &mut rx).await {
                    warn!("replay ingress stopped: {}", e);
                }
            })
        }
        None => {
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { ingress.run_serial(rx).await })
        }
    };

    let snapshot_handle = tokio::spawn(persist::run_snapshotter(
        registry,
        store,
        clock,
        config.nullifier.retention_epochs,
        shutdown_rx.clone(),
    ));

    // signals drive the watch channel
    let sigint = signal(SignalKind::interrupt())
        .map_err(|e| Fatal::Startup(format!("signal handler: {}", e)))?;
    let sigterm = signal(SignalKind::terminate())
        .map_err(|e| Fatal::Startup(format!("signal handler: {}", e)))?;
    tokio::spawn(handle_signals(sigint, sigterm, shutdown_tx));

    // wait for shutdown, then drain within the grace window
    let mut rx = shutdown_rx;
    let _ = rx.changed().await;
    info!("draining: ingress, pipeline, snapshots");

    let mut handles = vec![ingress_handle, pipeline_handle, snapshot_handle, server_handle];
    handles.extend(worker_handles);
    let drain = async {
        for handle in &mut handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(GRACE, drain).await.is_err() {
        // spends are already persisted; in-flight dispatches may be abandoned
        warn!("grace deadline exceeded, abandoning in-flight work");
        for handle in &handles {
            handle.abort();
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// drain the ingress queue through verification into the dispatcher
async fn run_pipeline(
    queue: Arc<IngressQueue>,
    verifier: Arc<PacketVerifier>,
    dispatcher: DispatcherHandle,
    counters: Arc<Counters>,
    hub: EventHub,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            packet = queue.pop() => packet,
            _ = shutdown.changed() => break,
        };
        match verifier.verify(packet) {
            Ok(verified) => {
                let inputs = ProofInputs {
                    data_hash: verified.data_hash,
                    epoch: verified.epoch,
                    merkle_root: verified.proof.root,
                };
                let witness = Witness {
                    commitment: verified.packet.commitment.to_bytes(),
                    pk_placeholder: hex::encode([0u8; 64]),
                    blinding_placeholder: hex::encode([0u8; 32]),
                    siblings: verified.proof.siblings.iter().map(hex::encode).collect(),
                    path_bits: verified.proof.path_bits.clone(),
                    sensor_le: hex::encode(verified.packet.sensor.to_le_bytes()),
                    signature: hex::encode(verified.packet.signature),
                    timestamp_s: verified.packet.timestamp_s,
                };
                if dispatcher
                    .enqueue(DispatchJob::Auto { inputs, witness })
                    .is_err()
                {
                    counters
                        .packets_dropped
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    hub.publish(EventKind::PacketError {
                        detail: "dispatch queue full".into(),
                    });
                }
            }
            Err(reject) => {
                counters
                    .packets_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                debug!("packet rejected: {}", reject);
                hub.publish(EventKind::PacketInvalid {
                    reason: reject.label().into(),
                });
            }
        }
    }
}

/// first signal drains gracefully; a second inside the window aborts
async fn handle_signals(
    mut sigint: Signal,
    mut sigterm: Signal,
    shutdown: watch::Sender<bool>,
) {
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    info!("shutdown signal received");
    let _ = shutdown.send(true);
    let first = Instant::now();
    loop {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        if first.elapsed() <= SECOND_SIGNAL_WINDOW {
            error!("second signal, aborting immediately");
            std::process::exit(i32::from(EXIT_FATAL));
        }
        warn!("still draining; shutdown already in progress");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProverCfg;
    use msingi_core::packet::SensorReading;
    use msingi_core::{Commitment, LoraPacket};
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    const EPOCH_LEN: u64 = 86_400;

    struct Pipeline {
        queue: Arc<IngressQueue>,
        counters: Arc<Counters>,
        events: tokio::sync::broadcast::Receiver<crate::events::Event>,
        _shutdown_tx: watch::Sender<bool>,
    }

    fn spawn_test_pipeline(dir: &std::path::Path, policy: EnrollPolicy) -> Pipeline {
        let clock = Clock::manual(EPOCH_LEN * 100 * 1000, EPOCH_LEN);
        let registry = RegistryService::open(&dir.join("merkle.json"), 20).unwrap();
        let (store, _) =
            NullifierStore::open(&dir.join("nullifiers.log"), clock.clone(), 1, 0).unwrap();
        let store = Arc::new(store);
        let counters = Arc::new(Counters::default());
        let hub = EventHub::new(clock.clone());
        let events = hub.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let client = ProverClient::new(&ProverCfg {
            url: None,
            timeout_ms: 1_000,
            max_attempts: 3,
            mock: true,
        });
        let (dispatcher, _workers) = Dispatcher::spawn(
            client,
            store,
            counters.clone(),
            hub.clone(),
            OrphanLedger::default(),
            clock.clone(),
            3,
            shutdown_rx.clone(),
        );
        let verifier = Arc::new(PacketVerifier::new(
            registry,
            clock,
            hub.clone(),
            300,
            policy,
            5,
        ));
        let queue = Arc::new(IngressQueue::new(INGRESS_QUEUE_CAP));
        tokio::spawn(run_pipeline(
            queue.clone(),
            verifier,
            dispatcher,
            counters.clone(),
            hub,
            shutdown_rx,
        ));
        Pipeline {
            queue,
            counters,
            events,
            _shutdown_tx: shutdown_tx,
        }
    }

    fn packet(commitment_byte: u8, timestamp_s: u32) -> LoraPacket {
        LoraPacket {
            src_addr: 7,
            commitment: Commitment([commitment_byte; 32]),
            sensor: SensorReading {
                temperature_c: 24.0,
                humidity_pct: 55.0,
                pressure_hpa: 1010.0,
                soil_moisture_pct: 33.0,
            },
            signature: [0x5a; 64],
            timestamp_s,
            rssi: -40,
            snr: 10,
        }
    }

    async fn next_event(pipeline: &mut Pipeline) -> crate::events::EventKind {
        tokio::time::timeout(Duration::from_secs(2), pipeline.events.recv())
            .await
            .expect("event deadline")
            .expect("event stream open")
            .kind
    }

    #[tokio::test]
    async fn stale_packet_drops_and_publishes() {
        let dir = tempdir().unwrap();
        let mut pipeline = spawn_test_pipeline(dir.path(), EnrollPolicy::Strict);

        // one second beyond the skew window
        let now_s = (EPOCH_LEN * 100) as u32;
        pipeline.queue.push(packet(1, now_s - 301));

        match next_event(&mut pipeline).await {
            EventKind::PacketInvalid { reason } => assert_eq!(reason, "stale"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(pipeline.counters.packets_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn fresh_packet_enrolls_proves_and_submits() {
        let dir = tempdir().unwrap();
        let mut pipeline = spawn_test_pipeline(dir.path(), EnrollPolicy::AutoEnroll);

        let now_s = (EPOCH_LEN * 100) as u32;
        pipeline.queue.push(packet(2, now_s));

        match next_event(&mut pipeline).await {
            EventKind::RegistryUpdated { leaf_count, .. } => assert_eq!(leaf_count, 1),
            other => panic!("unexpected event {:?}", other),
        }
        match next_event(&mut pipeline).await {
            EventKind::ProofSubmitted { epoch, is_mock, .. } => {
                assert_eq!(epoch, 100);
                assert!(is_mock);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            pipeline.counters.proofs_generated.load(Ordering::Relaxed),
            1
        );
        assert_eq!(pipeline.counters.packets_dropped.load(Ordering::Relaxed), 0);
    }
}
