//! Quill demo: three editors typing random words into one shared document.
//!
//! Usage: `quill-demo [ticks] [port]`
//!
//! Starts a sync server, connects three clients to `DOC0`, lets each make one
//! random word edit per tick, then waits for the traffic to settle and prints
//! whether the replicas agree. Ctrl-C stops the edits early.

use std::time::Duration;

use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::TcpListener;

use quill_sync::workload::{adjust, check_convergence, ConvergenceReport, Scheduler, WorkloadConfig};
use quill_sync::{ServerConfig, SyncClient, SyncServer, TextEngine};

const DEFAULT_TICKS: u64 = 20;
const DEFAULT_PORT: u16 = 9643;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let ticks = args.next().map(|s| s.parse()).transpose()?.unwrap_or(DEFAULT_TICKS);
    let port = args.next().map(|s| s.parse()).transpose()?.unwrap_or(DEFAULT_PORT);

    let workload = WorkloadConfig::default();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..ServerConfig::default()
    };

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Starting Quill demo server on {}", config.bind_addr);
    let server = SyncServer::new(TextEngine, config);
    tokio::spawn(async move {
        if let Err(e) = server.serve(listener).await {
            log::error!("Server stopped: {e}");
        }
    });

    let url = format!("ws://127.0.0.1:{port}");
    let mut clients = Vec::with_capacity(workload.replicas);
    for _ in 0..workload.replicas {
        let mut client = SyncClient::new(TextEngine, workload.doc_id.clone(), url.clone());
        client.connect().await?;
        clients.push(client);
    }

    let mut rng = match workload.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut scheduler = Scheduler::with_limit(ticks);
    let mut interval = tokio::time::interval(Duration::from_millis(workload.tick_interval_ms));
    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    scheduler.start();
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut interrupted => {
                info!("Interrupted after {} ticks", scheduler.ticks());
                scheduler.stop();
            }
        }
        if !scheduler.tick() {
            break;
        }
        for client in &clients {
            let next = adjust(&client.current().await, &mut rng);
            if let Err(e) = client.update(&next).await {
                log::warn!("Edit on tick {} failed: {e}", scheduler.ticks());
            }
        }
        info!("Tick {}: {}", scheduler.ticks(), status(&clients).await);
    }

    let report = settle(&clients).await;
    println!("{report}");
    Ok(())
}

async fn status(clients: &[SyncClient<TextEngine>]) -> ConvergenceReport {
    let mut states = Vec::with_capacity(clients.len());
    for client in clients {
        states.push(client.current().await);
    }
    check_convergence(&states)
}

/// Poll until every client has its edits acknowledged and all states agree.
async fn settle(clients: &[SyncClient<TextEngine>]) -> ConvergenceReport {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    loop {
        let report = status(clients).await;
        let mut idle = true;
        for client in clients {
            idle &= client.is_synchronized().await;
        }
        if (idle && report.is_synchronized()) || tokio::time::Instant::now() >= deadline {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
