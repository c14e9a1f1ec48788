//! TFS development cluster
//!
//! Runs one name server and a set of data servers in a single process,
//! backed by memory. Everything is lost on exit.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tfs_cluster::{Endpoint, MemoryCluster, StoreConfig, serve};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tfs-devcluster")]
#[command(about = "In-memory TFS cluster for development")]
#[command(version)]
struct Args {
    /// Listen address for the name server
    #[arg(short, long, default_value = "127.0.0.1:8108")]
    listen: String,

    /// Listen addresses for data servers (port 0 picks a free port)
    #[arg(long, num_args = 1.., default_values = ["127.0.0.1:0", "127.0.0.1:0"])]
    data: Vec<String>,

    /// Cluster id stamped into file names
    #[arg(long, default_value = "1")]
    cluster_id: u8,

    /// Server id reported to clients
    #[arg(long, default_value = "1")]
    server_id: u64,

    /// Copies of each block (capped by the number of data servers)
    #[arg(long, default_value = "2")]
    replicas: usize,

    /// Files allocated in a block before a new one is opened
    #[arg(long, default_value = "1024")]
    files_per_block: u32,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

async fn bind(addr: &str) -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    let local = listener.local_addr()?.to_string();
    Ok((listener, local))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if args.data.is_empty() {
        anyhow::bail!("at least one data server is required");
    }

    info!("Starting TFS development cluster");

    let (ns_listener, ns_addr) = bind(&args.listen).await?;
    let mut data_listeners = Vec::with_capacity(args.data.len());
    for addr in &args.data {
        data_listeners.push(bind(addr).await?);
    }
    let data_addrs: Vec<String> = data_listeners.iter().map(|(_, a)| a.clone()).collect();

    let config = StoreConfig {
        cluster_id: args.cluster_id,
        server_id: args.server_id,
        replicas: args.replicas.clamp(1, data_addrs.len()),
        files_per_block: args.files_per_block.max(1),
    };
    info!(
        cluster_id = config.cluster_id,
        replicas = config.replicas,
        "Name server on {}, data servers on {}",
        ns_addr,
        data_addrs.join(", ")
    );
    let cluster = MemoryCluster::new(&ns_addr, data_addrs, config);

    let (shutdown, rx) = watch::channel(false);
    let mut servers = Vec::with_capacity(cluster.data.len() + 1);
    let name = Endpoint {
        name: Some(Arc::clone(&cluster.name) as _),
        data: None,
    };
    servers.push(tokio::spawn(serve(ns_listener, name, rx.clone())));
    for ((listener, _), ds) in data_listeners.into_iter().zip(&cluster.data) {
        let endpoint = Endpoint {
            name: None,
            data: Some(Arc::clone(ds) as _),
        };
        servers.push(tokio::spawn(serve(listener, endpoint, rx.clone())));
    }

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");
    let _ = shutdown.send(true);
    for server in servers {
        server.await.ok();
    }

    info!("Development cluster shut down");
    Ok(())
}
