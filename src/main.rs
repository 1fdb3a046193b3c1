//! `coronetd`: runs a single cluster node until interrupted.
//!
//! Thin by design — configuration loading and collaborator wiring both
//! live in the library (`Config::load`, `Node::new`); this binary only
//! parses the couple of flags that make sense as CLI overrides rather
//! than file/env config, starts the node, and waits for a shutdown
//! signal.

use clap::{App, Arg};
use coronet::config::Config;
use coronet::node::Node;
use tracing::info;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = App::new("coronetd")
        .about("A replicated coordination node: Raft, a distributed lock manager, a message queue and a MESI-style cache")
        .arg(
            Arg::with_name("config")
                .long("config")
                .short("c")
                .value_name("PATH")
                .help("Path to a TOML config file (overrides built-in defaults, overridden by CORONET_* env vars)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("node-id")
                .long("node-id")
                .value_name("ID")
                .help("Overrides the configured node id")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("listen-port")
                .long("listen-port")
                .value_name("PORT")
                .help("Overrides the configured listen port")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match Config::load(matches.value_of("config")) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(node_id) = matches.value_of("node-id") {
        config.node_id = node_id.to_string();
    }
    if let Some(port) = matches.value_of("listen-port") {
        match port.parse() {
            Ok(port) => config.listen_port = port,
            Err(_) => {
                eprintln!("--listen-port must be a valid port number");
                std::process::exit(1);
            }
        }
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    runtime.block_on(run(config));
}

async fn run(config: Config) {
    let id = config.id();
    info!(%id, "starting node");

    let node = Node::new(config);
    if let Err(e) = node.listen().await {
        eprintln!("failed to bind listener: {e}");
        std::process::exit(1);
    }
    node.connect_peers().await;

    info!(%id, "node is running, waiting for shutdown signal");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(%id, "received shutdown signal"),
        Err(e) => tracing::warn!(error = %e, "failed to listen for shutdown signal"),
    }
    node.shutdown();
}
