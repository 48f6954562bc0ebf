//! Node layer: servers, clients and relays on top of the DHT
//!
//! A [`Node`] owns one DHT node and everything built on it:
//! - Servers that announce a key pair and accept encrypted connections
//! - Client connects that signal through rendezvous nodes, punch holes and
//!   fall back to a relay
//! - A blind relay service when [`NodeConfig::relay`] is set
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Node API                            │
//! ├──────────────┬──────────────┬─────────────┬─────────────┤
//! │   Servers    │   Connect    │   Relay     │ Socket pool │
//! ├──────────────┴──────────────┴─────────────┴─────────────┤
//! │        SecretStream (Noise_XX over any RawStream)        │
//! ├─────────────────────────────────────────────────────────┤
//! │   DHT: routing, records, signaling, holepunch probes     │
//! ├─────────────────────────────────────────────────────────┤
//! │          UdpMux: datagrams and reliable streams          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use spaceswarm_core::node::{Node, NodeConfig, ServerOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeConfig::default()).await?;
//!     node.fully_bootstrapped().await?;
//!
//!     let server = node.create_server(ServerOptions::default());
//!     server.listen().await?;
//!     println!("listening on {}", server.public_key());
//!
//!     let connection = server.accept().await?;
//!     connection.write(b"hello").await?;
//!     connection.end().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connect;
pub mod connection;
pub mod error;
#[allow(clippy::module_inception)]
pub mod node;
pub mod relay;
pub mod server;
mod socket_pool;

pub use config::{DEFAULT_KEEP_ALIVE, NodeConfig};
pub use connect::{ConnectHandle, ConnectOptions, KeyInput};
pub use connection::{Connection, ConnectionMode};
pub use error::{NodeError, Result};
pub use node::{Node, NodeAddress};
pub use relay::RelayChannel;
pub use server::{Server, ServerOptions};
