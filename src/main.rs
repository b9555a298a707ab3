// # Ferrite Server
//
// Entry point for the ferrite-server binary: parse flags, validate the
// configuration, open the node with recovery, and run until shutdown.
// Exit code 0 on clean shutdown, 1 on fatal init error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use ferrite_db::{FerriteNode, ServerOptions, VERSION};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ferrite-server", version = VERSION, about = "Redis-wire-compatible in-memory data store")]
struct Cli {
    #[arg(long, default_value_t = 6379)]
    port: u16,

    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    #[arg(long, default_value = "./data/checkpoints")]
    checkpoint_dir: PathBuf,

    #[arg(long, default_value = "./data/log")]
    log_dir: PathBuf,

    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    enable_aof: bool,

    /// 0 commits on every write; -1 disables scheduled commits.
    #[arg(long, default_value_t = 0)]
    commit_frequency_ms: i64,

    #[arg(long, default_value_t = 16 << 20)]
    aof_memory_size: usize,

    #[arg(long)]
    main_memory_replication: bool,

    #[arg(long)]
    fast_commit: bool,

    #[arg(long)]
    on_demand_checkpoint: bool,

    #[arg(long)]
    enable_incremental_snapshots: bool,

    #[arg(long, default_value_t = 64 << 20)]
    memory_size: usize,

    #[arg(long, default_value_t = 1 << 22)]
    page_size: usize,

    #[arg(long, default_value_t = 1 << 26)]
    segment_size: u64,

    #[arg(long, default_value_t = 1 << 16)]
    index_size: usize,

    #[arg(long)]
    cluster: bool,

    /// Cluster node timeout in seconds.
    #[arg(long, default_value_t = 60)]
    cluster_timeout: u64,

    /// Gossip interval in seconds.
    #[arg(long, default_value_t = 5)]
    gossip_delay: u64,

    #[arg(long)]
    tls: bool,

    #[arg(long)]
    cert_file: Option<PathBuf>,

    #[arg(long)]
    cert_password: Option<String>,

    #[arg(long)]
    auth_username: Option<String>,

    #[arg(long)]
    auth_password: Option<String>,

    #[arg(long)]
    acl_file: Option<PathBuf>,
}

impl Cli {
    fn into_options(self) -> ServerOptions {
        ServerOptions {
            port: self.port,
            bind: self.bind,
            checkpoint_dir: self.checkpoint_dir,
            log_dir: self.log_dir,
            enable_aof: self.enable_aof,
            commit_frequency_ms: self.commit_frequency_ms,
            aof_memory_size: self.aof_memory_size,
            main_memory_replication: self.main_memory_replication,
            fast_commit: self.fast_commit,
            on_demand_checkpoint: self.on_demand_checkpoint,
            enable_incremental_snapshots: self.enable_incremental_snapshots,
            memory_size: self.memory_size,
            page_size: self.page_size,
            segment_size: self.segment_size,
            index_size: self.index_size,
            cluster: self.cluster,
            cluster_timeout: Duration::from_secs(self.cluster_timeout),
            gossip_delay: Duration::from_secs(self.gossip_delay),
            tls: self.tls,
            cert_file: self.cert_file,
            cert_password: self.cert_password,
            auth_username: self.auth_username,
            auth_password: self.auth_password,
            acl_file: self.acl_file,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let options = Cli::parse().into_options();
    info!("ferrite-server {VERSION} starting on {}:{}", options.bind, options.port);
    if let Ok(rendered) = serde_json::to_string_pretty(&options) {
        info!("effective configuration:\n{rendered}");
    }

    let node = match FerriteNode::open(options, true) {
        Ok(node) => node,
        Err(err) => {
            error!(%err, "fatal: node initialization failed");
            return ExitCode::from(1);
        }
    };

    let committer = node.start_commit_scheduler();
    info!(node_id = %node.node_id(), "ready to accept connections");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "signal handler failed");
        return ExitCode::from(1);
    }

    info!("shutdown requested");
    if let Some(committer) = committer {
        committer.abort();
    }
    if let Err(err) = node.shutdown().await {
        error!(%err, "shutdown error");
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}
