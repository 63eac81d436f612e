//! Procgroup Node - one member of a process group.
//!
//! `procgroup-node node` joins a group. Rank 0 becomes the controller and
//! serves the control channel on a local port; every other rank executes
//! what the controller sends until the group is torn down.
//!
//! `procgroup-node call` sends one control channel request to a running
//! controller and prints the result.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use procgroup_core::{
    shared, ControllerApp, Extension, GroupConfig, IpcClient, ObjectInterpreter, ProcessModule,
};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "procgroup-node")]
#[command(about = "Member of a cooperating process group")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a process group
    Node(NodeArgs),
    /// Send one request to a running controller
    Call(CallArgs),
}

#[derive(Args, Debug)]
struct NodeArgs {
    /// Rank of this process (defaults to PROCGROUP_RANK, then 0)
    #[arg(long)]
    rank: Option<usize>,

    /// Comma separated listen address of every rank, in rank order
    /// (defaults to PROCGROUP_PEERS; empty means a single-process group)
    #[arg(long)]
    peers: Option<String>,

    /// Tear the group down as soon as it is up
    #[arg(long)]
    no_interactive: bool,

    /// Seconds to wait for every peer at startup
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Extension this process can load on request (repeatable)
    #[arg(long = "extension")]
    extensions: Vec<String>,
}

#[derive(Args, Debug)]
struct CallArgs {
    /// Control channel port printed by the controller
    #[arg(short, long)]
    port: u16,

    /// Method name (status, dispatch, gather, load_module, exit)
    method: String,

    /// JSON params
    params: Option<String>,

    /// Read JSON params from a file instead
    #[arg(long, conflicts_with = "params")]
    params_file: Option<PathBuf>,
}

fn init_logging(debug: bool, json: bool) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // stdout carries CONTROL_PORT= and call results, logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn group_config(args: &NodeArgs) -> Result<GroupConfig> {
    let mut config = GroupConfig::from_env().context("invalid group environment")?;

    if let Some(peers) = &args.peers {
        config.peers = GroupConfig::parse_peers(peers)?;
    }
    if let Some(rank) = args.rank {
        config.rank = rank;
    }
    if args.no_interactive {
        config.interactive = false;
    }
    if let Some(secs) = args.connect_timeout {
        config = config.with_connect_timeout(std::time::Duration::from_secs(secs));
    }

    config.validate()?;
    Ok(config)
}

async fn run_node(args: NodeArgs) -> Result<i32> {
    let config = group_config(&args)?;
    info!(
        "Starting rank {} of {} (interactive: {})",
        config.rank,
        config.size(),
        config.interactive
    );

    let mut interpreter = ObjectInterpreter::new();
    for name in &args.extensions {
        interpreter.register_extension(Extension::new(name.clone()));
    }

    let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    // Print the port for whoever launched us (intentional stdout)
    let announce = tokio::spawn(async move {
        if let Ok(addr) = ready_rx.await {
            println!("CONTROL_PORT={}", addr.port());
        }
    });
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = stop_tx.send(());
        }
    });

    let mut app = ControllerApp::new()
        .with_ready_signal(ready_tx)
        .with_shutdown(stop_rx);
    let status = ProcessModule::start_with_interpreter(&config, shared(interpreter), &mut app).await;

    ctrl_c.abort();
    announce.abort();
    Ok(status?)
}

async fn run_call(args: CallArgs) -> Result<()> {
    let params = match (&args.params, &args.params_file) {
        (Some(text), _) => serde_json::from_str(text).context("params are not valid JSON")?,
        (None, Some(path)) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("cannot read {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", path.display()))?
        }
        (None, None) => serde_json::json!({}),
    };

    let addr = SocketAddr::from(([127, 0, 0, 1], args.port));
    let client = IpcClient::connect(addr).await?;
    let result = client.call(&args.method, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_json);

    match cli.command {
        Command::Node(args) => {
            let status = run_node(args).await?;
            if status != 0 {
                warn!("Controller finished with status {}", status);
                std::process::exit(status);
            }
        }
        Command::Call(args) => run_call(args).await?,
    }
    Ok(())
}
