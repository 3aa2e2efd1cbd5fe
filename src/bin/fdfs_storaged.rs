//
// Main entry point for the storage daemon
//
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fastdfs::{StorageConfig, StorageServer};

const ABOUT: &str = "\
FastDFS storage node: stores file bytes, appends every mutation to a local
binlog, and replicates it to the other members of its group.";

#[derive(Parser)]
#[command(name = "fdfs_storaged", version, about = ABOUT)]
struct Args {
    /// Group this server belongs to
    #[arg(long, default_value = "group1")]
    group_name: String,

    /// Listener bind address
    #[arg(long, default_value = "0.0.0.0")]
    bind_addr: String,

    /// Listener port
    #[arg(long, default_value_t = fastdfs::types::STORAGE_DEFAULT_PORT)]
    port: u16,

    /// Address advertised to trackers and embedded in generated filenames
    #[arg(long, default_value = "127.0.0.1")]
    advertised_ip: String,

    /// Tracker addresses, host:port; repeatable
    #[arg(long = "tracker-server", required = true)]
    tracker_servers: Vec<String>,

    /// Base path for binlog, mark files and counters
    #[arg(long, default_value = "/var/lib/fastdfs/storage")]
    base_path: PathBuf,

    /// Storage tree roots; repeatable, index order defines M00/M01 prefixes
    #[arg(long = "store-path", required = true)]
    store_paths: Vec<PathBuf>,

    /// Seconds between heartbeats to the trackers
    #[arg(long, default_value_t = 30)]
    heart_beat_interval: u64,

    /// Upload priority advertised to the tracker (lower wins)
    #[arg(long, default_value_t = 10)]
    upload_priority: u32,

    /// Accepted connection cap
    #[arg(long, default_value_t = 256)]
    max_connections: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let args = Args::parse();

    let config = StorageConfig::new(args.group_name, args.bind_addr, args.port)
        .with_advertised_ip(args.advertised_ip)
        .with_trackers(args.tracker_servers)
        .with_base_path(args.base_path)
        .with_store_paths(args.store_paths)
        .with_heart_beat_interval(args.heart_beat_interval)
        .with_upload_priority(args.upload_priority)
        .with_max_connections(args.max_connections);

    let server = StorageServer::new(config)?;
    let addr = server.start().await?;
    let heartbeat = fastdfs::storage::heartbeat::spawn(server.clone());
    info!(%addr, "fdfs_storaged running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;
    heartbeat.abort();
    Ok(())
}
