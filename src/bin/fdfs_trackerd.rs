//
// Main entry point for the tracker daemon
//
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fastdfs::config::{StoreLookup, StorePathPolicy, StoreServerPolicy};
use fastdfs::{TrackerConfig, TrackerServer};

const ABOUT: &str = "\
FastDFS tracker: holds the group and storage registries, elects a leader
among trackers, and answers client store/fetch routing queries.";

#[derive(Parser)]
#[command(name = "fdfs_trackerd", version, about = ABOUT)]
struct Args {
    /// Listener bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listener port
    #[arg(long, default_value_t = fastdfs::types::TRACKER_DEFAULT_PORT)]
    port: u16,

    /// Directory for registry snapshot files
    #[arg(long, default_value = "/var/lib/fastdfs/tracker")]
    base_path: PathBuf,

    /// Every tracker of the cluster, host:port, self included; the order
    /// defines the leader-election tie-break
    #[arg(long = "tracker-peer")]
    tracker_peers: Vec<String>,

    /// Group selection policy: round-robin, spec-group or load-balance
    #[arg(long, default_value = "round-robin")]
    store_lookup: String,

    /// Group used by the spec-group policy
    #[arg(long, default_value = "")]
    store_group: String,

    /// Member selection policy: round-robin, first-alive or priority
    #[arg(long, default_value = "round-robin")]
    store_server: String,

    /// Store path policy: round-robin or most-free-space
    #[arg(long, default_value = "round-robin")]
    store_path: String,

    /// Free-space floor (MB) a member must keep to accept writes
    #[arg(long, default_value_t = 1024)]
    reserved_storage_space_mb: u64,

    /// Heartbeat staleness threshold in seconds; OFFLINE at twice this
    #[arg(long, default_value_t = 30)]
    check_active_interval: u64,

    /// Accepted connection cap
    #[arg(long, default_value_t = 256)]
    max_connections: usize,
}

fn parse_store_lookup(s: &str) -> StoreLookup {
    match s {
        "spec-group" => StoreLookup::SpecGroup,
        "load-balance" => StoreLookup::LoadBalance,
        _ => StoreLookup::RoundRobin,
    }
}

fn parse_store_server(s: &str) -> StoreServerPolicy {
    match s {
        "first-alive" => StoreServerPolicy::FirstAlive,
        "priority" => StoreServerPolicy::Priority,
        _ => StoreServerPolicy::RoundRobin,
    }
}

fn parse_store_path(s: &str) -> StorePathPolicy {
    match s {
        "most-free-space" => StorePathPolicy::MostFree,
        _ => StorePathPolicy::RoundRobin,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let config = TrackerConfig::new(args.bind_addr, args.port)
        .with_base_path(args.base_path)
        .with_peers(args.tracker_peers)
        .with_store_lookup(parse_store_lookup(&args.store_lookup))
        .with_store_group(args.store_group)
        .with_store_server(parse_store_server(&args.store_server))
        .with_store_path(parse_store_path(&args.store_path))
        .with_reserved_space_mb(args.reserved_storage_space_mb)
        .with_check_active_interval(args.check_active_interval)
        .with_max_connections(args.max_connections);

    let server = TrackerServer::new(config)?;
    let addr = server.start().await?;
    info!(%addr, "fdfs_trackerd running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
