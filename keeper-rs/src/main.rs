use clap::Parser;
use eyre::{eyre, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use metronome_keeper::auth::AuthConfig;
use metronome_keeper::clock::Clock;
use metronome_keeper::config::{DeploymentArtifact, KeeperConfig};
use metronome_keeper::scheduler;
use metronome_keeper::server::RpcServer;
use metronome_keeper::service::{Service, ServiceClient, ServiceConfig};
use metronome_keeper::store::Store;

use metronome_tx::rpc::{NodeRpcClient, SendOptions};
use metronome_tx::signer::HttpThresholdSigner;

#[derive(Parser, Debug)]
#[command(
    name = "metronome-keeper",
    version,
    about = "Recurring-payment keeper: durable subscription timers that trigger an on-chain payment program"
)]
struct Args {
    /// Path to a deployment artifact JSON (e.g., deployments/devnet.json)
    #[arg(long, default_value = "deployments/devnet.json")]
    artifact: PathBuf,

    /// Override the node RPC URL. If omitted, uses METRONOME_NODE_RPC_URL
    /// or the artifact.
    #[arg(long)]
    rpc_url: Option<String>,

    /// Override the threshold-signer URL. If omitted, uses
    /// METRONOME_SIGNER_URL or the artifact.
    #[arg(long)]
    signer_url: Option<String>,

    /// Where the admin JSON-RPC API listens.
    #[arg(long, default_value = "127.0.0.1:8055")]
    listen: SocketAddr,

    /// Where to store keeper state (subscriptions, roles, metadata).
    #[arg(long, default_value = "keeper-rs/state/state.json")]
    state_file: PathBuf,

    /// Node RPC request timeout in seconds.
    #[arg(long, default_value_t = 15)]
    rpc_timeout_seconds: u64,

    /// Threshold-signer request timeout in seconds.
    #[arg(long, default_value_t = 30)]
    signer_timeout_seconds: u64,

    /// Window (seconds) over which overdue timers are spread at startup.
    #[arg(long, default_value_t = 30)]
    rehydrate_spread_seconds: u64,

    /// Global API rate limit (requests per minute).
    #[arg(long, default_value_t = 300)]
    global_rate_limit: u32,

    /// Per-identity API rate limit (requests per minute). Per-origin
    /// windows get half of this.
    #[arg(long, default_value_t = 60)]
    identity_rate_limit: u32,

    /// Failed authentications before the exponential lockout engages.
    #[arg(long, default_value_t = 5)]
    max_failed_attempts_before_backoff: u32,

    /// Lockout base duration in seconds.
    #[arg(long, default_value_t = 2)]
    auth_backoff_base_seconds: u64,

    /// Lockout growth factor per additional failure.
    #[arg(long, default_value_t = 2.0)]
    auth_backoff_multiplier: f64,

    /// Lockout cap in seconds.
    #[arg(long, default_value_t = 3600)]
    auth_backoff_max_seconds: u64,

    /// Don't submit transactions; log what would be triggered.
    #[arg(long)]
    dry_run: bool,

    /// Restore state, print the re-armed timer table, and exit.
    #[arg(long)]
    rehydrate_only: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // .env is optional; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let artifact = DeploymentArtifact::load(&args.artifact)?;

    let auth = AuthConfig {
        global_requests_per_minute: args.global_rate_limit,
        identity_requests_per_minute: args.identity_rate_limit,
        max_failed_attempts_before_backoff: args.max_failed_attempts_before_backoff,
        backoff_base_seconds: args.auth_backoff_base_seconds,
        backoff_multiplier: args.auth_backoff_multiplier,
        backoff_max_seconds: args.auth_backoff_max_seconds,
        ..AuthConfig::default()
    };

    let cfg = KeeperConfig::from_cli_and_artifact(
        &artifact,
        args.rpc_url,
        args.signer_url,
        args.listen,
        args.state_file,
        args.rpc_timeout_seconds,
        args.signer_timeout_seconds,
        args.rehydrate_spread_seconds,
        auth,
        args.dry_run,
        args.rehydrate_only,
    )?;

    // The store takes an exclusive lock beside its snapshot and holds it
    // until shutdown, so a second keeper on the same state refuses to start.
    let store = Store::open_exclusive(&cfg.state_file)?;

    let rpc = NodeRpcClient::new(cfg.rpc_url.clone(), cfg.rpc_timeout)
        .map_err(|e| eyre!("failed to build node RPC client: {e}"))?;
    let signer = HttpThresholdSigner::new(cfg.signer_url.clone(), cfg.signer_timeout)
        .map_err(|e| eyre!("failed to build signer client: {e}"))?;

    // Chain sanity probe: refuse to run against a dead endpoint.
    use metronome_tx::rpc::NodeRpc;
    if let Err(err) = rpc.latest_blockhash(cfg.commitment).await {
        return Err(eyre!(
            "node RPC probe failed for {}: {err}. Check the artifact and network.",
            cfg.rpc_url
        ));
    }

    tracing::info!(
        network = ?cfg.network,
        rpc = %cfg.rpc_url,
        listen = %cfg.listen_addr,
        state_file = %cfg.state_file.display(),
        dry_run = cfg.dry_run,
        "keeper starting"
    );

    let clock = Clock::system();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();
    let timers = scheduler::spawn(clock.clone(), timer_tx);

    let service_cfg = ServiceConfig {
        commitment: cfg.commitment,
        send_options: SendOptions::default(),
        dry_run: cfg.dry_run,
        low_balance_lamports: cfg.low_balance_lamports,
        critical_balance_lamports: cfg.critical_balance_lamports,
        rehydrate_spread_seconds: cfg.rehydrate_spread_seconds,
        ..ServiceConfig::default()
    };

    let mut service = Service::new(
        service_cfg,
        clock,
        store,
        timers.clone(),
        cfg.auth.clone(),
        Arc::new(signer),
        Arc::new(rpc),
    );
    let armed = service.rehydrate();

    if cfg.rehydrate_only {
        for timer in timers.armed().await {
            println!("{}\t{}", timer.id, timer.at);
        }
        tracing::info!(armed, "rehydrate-only run complete");
        return Ok(());
    }

    let (api_tx, api_rx) = mpsc::channel(64);
    let client = ServiceClient::new(api_tx.clone());
    let server_handle = RpcServer::new(client).start(cfg.listen_addr).await?;

    let service_task = tokio::spawn(service.run(api_rx, timer_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("failed to listen for shutdown signal: {e}"))?;
    tracing::info!("shutdown signal received");

    // Stop accepting API traffic, then let the service drain and snapshot.
    let _ = server_handle.stop();
    server_handle.stopped().await;
    drop(api_tx);
    let _ = service_task.await;

    Ok(())
}
