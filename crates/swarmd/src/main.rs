//! swarmd - local peer swarm
//!
//! Runs a number of nodes in one process over an in-memory signaling
//! backend and the loopback connection primitive. Every node draws a random
//! value and the swarm converges on the maximum.

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use swarm_core::{ConnectionState, PeerId};
use swarm_net::{
    LoopbackNetwork, MailboxStore, MailboxTransport, RelayHub, RelayTransport, SignalingTransport,
};
use swarmd::config::{Backend, Config};
use swarmd::coordinator::Coordinator;
use swarmd::sink::TracingSink;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    info!("swarmd v{} - peer swarm node", env!("CARGO_PKG_VERSION"));

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = run(config).await {
        error!("swarmd failed: {:#}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn init_tracing(config: &Config) {
    let default = if config.verbose {
        "swarmd=debug,swarm_net=debug"
    } else {
        "swarmd=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log_format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let settings = config.node_settings();
    let network = LoopbackNetwork::new();
    let store = MailboxStore::new();
    let hub = RelayHub::new();
    let mut seeds = config.seed.map(StdRng::seed_from_u64);

    info!(
        "Starting {} peers on {:?} signaling (heartbeat {:?}, timeout {:?})",
        config.peers, config.backend, settings.heartbeat_interval, settings.peer_timeout
    );

    let mut handles = Vec::with_capacity(config.peers);
    let mut sinks = Vec::with_capacity(config.peers);
    let mut tasks = Vec::with_capacity(config.peers);
    for _ in 0..config.peers {
        let peer = PeerId::generate();
        let transport: Box<dyn SignalingTransport> = match config.backend {
            Backend::Mailbox => Box::new(MailboxTransport::new(store.clone())),
            Backend::Relay => Box::new(RelayTransport::new(
                hub.clone(),
                RelayTransport::nick_for(&peer),
            )),
        };
        let mut node_settings = settings.clone();
        node_settings.seed = seeds.as_mut().map(|rng| rng.gen());

        let sink = TracingSink::new(peer.clone());
        let coordinator = Coordinator::new(
            peer,
            node_settings,
            transport,
            Box::new(network.connector()),
            Arc::new(sink.clone()),
        );
        handles.push(coordinator.handle());
        sinks.push(sink);
        tasks.push(tokio::spawn(coordinator.run()));
    }

    // Periodically regenerate a random peer's value
    let regenerator = config.regenerate_secs.map(|secs| {
        let handles = handles.clone();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(secs));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pick = rand::thread_rng().gen_range(0..handles.len());
                info!("Regenerating value of {}", handles[pick].peer_id());
                if handles[pick].regenerate().is_err() {
                    break;
                }
            }
        })
    });

    match config.duration_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("Received shutdown signal");
        }
    }

    if let Some(task) = regenerator {
        task.abort();
    }

    for (handle, sink) in handles.iter().zip(&sinks) {
        let snapshot = sink.snapshot();
        let connected = snapshot
            .peers
            .iter()
            .filter(|p| p.state == ConnectionState::Connected)
            .count();
        info!(
            "{}: local {:?}, maximum {:?}, {} of {} peers connected",
            handle.peer_id(),
            snapshot.local_value,
            snapshot.aggregate,
            connected,
            snapshot.peers.len()
        );
    }

    for handle in &handles {
        if let Err(e) = handle.shutdown() {
            warn!("{} did not accept shutdown: {}", handle.peer_id(), e);
        }
    }
    for (task, handle) in tasks.into_iter().zip(&handles) {
        match task.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("{} failed: {}", handle.peer_id(), e),
            Err(e) => warn!("{} task aborted: {}", handle.peer_id(), e),
        }
    }

    Ok(())
}
