//! Spaceswarm command-line interface.

mod config;

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Config;
use spaceswarm_core::{Connection, KeyPair, Node, ServerOptions};
use std::path::PathBuf;
use tokio::io::AsyncBufReadExt;

/// Spaceswarm - peer-to-peer connectivity over a Kademlia DHT
#[derive(Parser)]
#[command(name = "spaceswarm")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a DHT node
    Node {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,

        /// Serve as a blind relay
        #[arg(long)]
        relay: bool,
    },

    /// Run a server that echoes every message back
    Echo,

    /// Connect to a server and exchange messages
    Connect {
        /// Server public key (52 characters z-base-32)
        #[arg(required = true)]
        key: String,

        /// Send this message instead of reading stdin
        #[arg(short, long)]
        message: Option<String>,

        /// Relay node to use when holepunching fails
        #[arg(long)]
        relay_through: Option<String>,
    },

    /// List peers announced under a topic
    Lookup {
        /// Topic (64 hex digits, or any text to hash)
        #[arg(required = true)]
        topic: String,
    },

    /// Announce this identity under a topic
    Announce {
        /// Topic (64 hex digits, or any text to hash)
        #[arg(required = true)]
        topic: String,
    },

    /// Store an immutable value
    Put {
        /// Value to store
        #[arg(required = true)]
        value: String,
    },

    /// Fetch an immutable value by its hash
    Get {
        /// Value hash (64 hex digits)
        #[arg(required = true)]
        hash: String,
    },

    /// Generate a key pair
    Keygen,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    config.validate()?;

    match cli.command {
        Commands::Node { bind, relay } => run_node(config, bind, relay).await,
        Commands::Echo => run_echo(config).await,
        Commands::Connect {
            key,
            message,
            relay_through,
        } => connect(config, &key, message, relay_through).await,
        Commands::Lookup { topic } => lookup(config, &topic).await,
        Commands::Announce { topic } => announce(config, &topic).await,
        Commands::Put { value } => put(config, &value).await,
        Commands::Get { hash } => get(config, &hash).await,
        Commands::Keygen => keygen(),
        Commands::Init { force } => init(&config_path, force),
    }
}

async fn start_node(config: &Config) -> anyhow::Result<Node> {
    let node = Node::with_key_pair(config.node_config()?, config.key_pair()?).await?;
    node.fully_bootstrapped().await?;
    let address = node.address();
    tracing::info!(
        "node {} at {}:{} ({:?})",
        node.public_key().to_z32(),
        address.host,
        address.port,
        node.firewall()
    );
    Ok(node)
}

/// Topic bytes from 64 hex digits, or the hash of arbitrary text.
fn parse_topic(topic: &str) -> [u8; 32] {
    if let Ok(bytes) = hex::decode(topic) {
        if let Ok(topic) = <[u8; 32]>::try_from(bytes.as_slice()) {
            return topic;
        }
    }
    Node::hash(topic.as_bytes())
}

async fn run_node(mut config: Config, bind: Option<String>, relay: bool) -> anyhow::Result<()> {
    if let Some(bind) = bind {
        config.network.listen_addr = bind;
    }
    config.network.relay |= relay;
    config.validate()?;

    let node = start_node(&config).await?;
    if let Some(relay_key) = node.relay_key() {
        println!("relay: {}", relay_key.to_z32());
    }
    println!("node: {}", node.public_key().to_z32());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.destroy().await;
    Ok(())
}

async fn run_echo(config: Config) -> anyhow::Result<()> {
    let node = start_node(&config).await?;
    let server = node.create_server(ServerOptions::default());
    server.listen().await?;
    println!("echo server: {}", server.public_key().to_z32());

    loop {
        tokio::select! {
            accepted = server.accept() => {
                let connection = accepted?;
                tracing::info!(
                    "connection from {} ({:?})",
                    connection.remote_public_key().to_z32(),
                    connection.mode()
                );
                tokio::spawn(echo(connection));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.close().await;
    node.destroy().await;
    Ok(())
}

async fn echo(connection: Connection) {
    loop {
        match connection.read().await {
            Ok(Some(message)) => {
                if let Err(e) = connection.write(&message).await {
                    tracing::debug!("echo write failed: {}", e);
                    break;
                }
            }
            Ok(None) => {
                let _ = connection.end().await;
                break;
            }
            Err(e) => {
                tracing::debug!("echo read failed: {}", e);
                break;
            }
        }
    }
}

async fn connect(
    config: Config,
    key: &str,
    message: Option<String>,
    relay_through: Option<String>,
) -> anyhow::Result<()> {
    let node = start_node(&config).await?;
    let relay_through = relay_through
        .map(|k| spaceswarm_core::KeyInput::from(k.as_str()).resolve())
        .transpose()?;
    let options = spaceswarm_core::ConnectOptions {
        relay_through,
        ..spaceswarm_core::ConnectOptions::default()
    };
    let connection = node.connect(key, options)?.await?;
    tracing::info!("connected ({:?})", connection.mode());

    let reader = {
        let connection = connection.clone();
        tokio::spawn(async move {
            while let Some(reply) = connection.read().await? {
                println!("{}", String::from_utf8_lossy(&reply));
            }
            Ok::<_, spaceswarm_core::NodeError>(())
        })
    };

    match message {
        Some(message) => connection.write(message.as_bytes()).await?,
        None => {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                connection.write(line.as_bytes()).await?;
            }
        }
    }
    connection.end().await?;

    reader.await??;
    node.destroy().await;
    Ok(())
}

async fn lookup(config: Config, topic: &str) -> anyhow::Result<()> {
    let node = start_node(&config).await?;
    let replies = node.lookup(parse_topic(topic)).await?;
    for reply in &replies {
        for peer in &reply.peers {
            println!("{} (from {})", peer.public_key.to_z32(), reply.from);
        }
    }
    node.destroy().await;
    Ok(())
}

async fn announce(config: Config, topic: &str) -> anyhow::Result<()> {
    let node = start_node(&config).await?;
    let key_pair = node.default_key_pair().clone();
    let stored = node.announce(parse_topic(topic), &key_pair).await?;
    println!(
        "announced {} on {} nodes",
        key_pair.public_key().to_z32(),
        stored.len()
    );
    node.destroy().await;
    Ok(())
}

async fn put(config: Config, value: &str) -> anyhow::Result<()> {
    let node = start_node(&config).await?;
    let hash = node.immutable_put(value.as_bytes()).await?;
    println!("{}", hex::encode(hash));
    node.destroy().await;
    Ok(())
}

async fn get(config: Config, hash: &str) -> anyhow::Result<()> {
    let key: [u8; 32] = hex::decode(hash)?
        .try_into()
        .map_err(|_| anyhow::anyhow!("hash must be 32 bytes"))?;
    let node = start_node(&config).await?;
    match node.immutable_get(key).await? {
        Some(value) => println!("{}", String::from_utf8_lossy(&value)),
        None => println!("not found"),
    }
    node.destroy().await;
    Ok(())
}

fn keygen() -> anyhow::Result<()> {
    let key_pair = KeyPair::generate();
    println!("seed:       {}", hex::encode(key_pair.seed()));
    println!("public key: {}", key_pair.public_key().to_z32());
    Ok(())
}

fn init(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    Config::default().save(path)?;
    println!("wrote {}", path.display());
    Ok(())
}
