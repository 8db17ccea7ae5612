//! beamlink -- talk to a running peer runtime from the command line.
//!
//! Usage:
//!   beamlink names                       # Nodes registered with discovery
//!   beamlink ping                        # Handshake with the configured peer
//!   beamlink call erlang node            # Remote call, args parsed as terms
//!   beamlink script-id                   # Peer boot script id
//!   beamlink events                      # Print events until Ctrl-C

use beamlink_node::config::NodeConfig;
use beamlink_node::events::Event;
use beamlink_node::{discovery, expand_tilde, parse_term_arg, term_to_json};
use beamlink_node::{Backend, Node, RpcClient};
use beamlink_protocol::{Atom, Term};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beamlink", about = "Hidden distribution peer for a running runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.beamlink/config.toml")]
    config: String,

    /// Peer node as alive@host, overriding the config
    #[arg(short, long)]
    peer: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List nodes registered with the peer host's discovery service
    Names,
    /// Check that the peer accepts a connection
    Ping,
    /// Call a remote function
    Call {
        module: String,
        function: String,
        /// Integers, floats, "binaries", 'quoted atoms' or atoms
        args: Vec<String>,
    },
    /// Show the peer's boot script id
    ScriptId,
    /// Print events sent to the event mailbox
    Events,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beamlink=info,beamlink_node=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let mut cfg = NodeConfig::load_or_default(&config_path)?;
    if let Some(peer) = &cli.peer {
        let (name, host) = peer
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("peer {peer:?} is not of the form alive@host"))?;
        cfg.peer.name = name.to_string();
        cfg.peer.host = host.to_string();
    }

    match cli.command {
        Commands::Names => {
            let nodes = discovery::names(&cfg.peer.host, cfg.params().epmd_port).await?;
            if cli.json {
                let value: serde_json::Value = nodes
                    .iter()
                    .map(|(name, port)| serde_json::json!({ "name": name, "port": port }))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                for (name, port) in nodes {
                    println!("{name}\t{port}");
                }
            }
        }
        Commands::Ping => {
            let node = start_node(&cfg)?;
            let peer = cfg.peer_name();
            let ok = node.ping(&peer).await;
            if cli.json {
                println!("{}", serde_json::json!({ "peer": peer, "pong": ok }));
            } else {
                println!("{}", if ok { "pong" } else { "pang" });
            }
            node.close();
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Call {
            module,
            function,
            args,
        } => {
            let node = start_node(&cfg)?;
            let rpc = RpcClient::new(node.clone(), cfg.peer_name())
                .with_timeout(cfg.rpc.default_timeout.as_duration());
            let args = args.iter().map(|a| parse_term_arg(a)).collect();
            let result = rpc.call(&module, &function, args).await;
            node.close();
            print_term(&result?, cli.json)?;
        }
        Commands::ScriptId => {
            let backend = Backend::connect(&cfg).await?;
            let id = backend.script_id().await?;
            if cli.json {
                println!("{}", serde_json::json!({ "script_id": id }));
            } else {
                println!("{id}");
            }
        }
        Commands::Events => {
            let backend = Backend::connect(&cfg).await?;
            let json = cli.json;
            backend.add_event_handler(move |event: &Event| {
                if json {
                    let value = serde_json::json!({
                        "topic": event.topic,
                        "data": term_to_json(&event.data),
                        "sender": event.sender.as_ref().map(|p| p.to_string()),
                    });
                    println!("{value}");
                } else {
                    println!("{}: {}", event.topic, event.data);
                }
            });
            let _status = backend.register_status_handler(|peer: &Atom, up: bool| {
                tracing::info!(peer = %peer, up, "connection status changed");
            });
            tracing::info!(pid = %backend.event_pid(), "listening for events, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down...");
            backend.dispose();
        }
    }

    Ok(())
}

fn start_node(cfg: &NodeConfig) -> anyhow::Result<Node> {
    let cookie = cfg.load_cookie()?;
    Ok(Node::with_params(&cfg.node_name(), cookie, cfg.params())?)
}

fn print_term(term: &Term, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&term_to_json(term))?);
    } else {
        println!("{term}");
    }
    Ok(())
}
