//! Outbound socket allocation.
//!
//! Every client connection runs on a socket of its own unless it asks for a
//! reusable one, in which case connections from the same key pair share a
//! refcounted socket. Sockets outlive their last lease by [`SOCKET_LINGER`]
//! so final acknowledgements still reach the peer.

use crate::node::error::Result;
use spaceswarm_crypto::PublicKey;
use spaceswarm_dht::Dht;
use spaceswarm_transport::UdpMux;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Delay between the last release and closing the socket
pub const SOCKET_LINGER: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    public_key: PublicKey,
    relayed: bool,
}

struct Pooled {
    socket: UdpMux,
    leases: usize,
}

/// Sockets shared by reusable connections
#[derive(Clone, Default)]
pub(crate) struct SocketPool {
    sockets: Arc<Mutex<HashMap<PoolKey, Pooled>>>,
}

impl SocketPool {
    /// Lease a socket for a connection made with `public_key`.
    pub(crate) async fn acquire(
        &self,
        dht: &Dht,
        public_key: PublicKey,
        relayed: bool,
        reusable: bool,
    ) -> Result<SocketLease> {
        if !reusable {
            let socket = dht.create_socket().await?;
            return Ok(SocketLease {
                socket,
                dht: dht.clone(),
                pooled: None,
            });
        }

        let key = PoolKey {
            public_key,
            relayed,
        };
        if let Some(lease) = self.lease_existing(dht, key) {
            return Ok(lease);
        }
        let fresh = dht.create_socket().await?;
        let (socket, spare) = {
            let mut sockets = self.lock();
            match sockets.get_mut(&key) {
                // Another connect pooled a socket while we were binding.
                Some(pooled) => {
                    pooled.leases += 1;
                    (pooled.socket.clone(), Some(fresh))
                }
                None => {
                    sockets.insert(
                        key,
                        Pooled {
                            socket: fresh.clone(),
                            leases: 1,
                        },
                    );
                    (fresh, None)
                }
            }
        };
        if let Some(spare) = spare {
            dht.release_socket(spare.id()).await;
        }
        tracing::debug!("pooled socket {} for reusable connections", socket.id());
        Ok(SocketLease {
            socket,
            dht: dht.clone(),
            pooled: Some((self.clone(), key)),
        })
    }

    fn lease_existing(&self, dht: &Dht, key: PoolKey) -> Option<SocketLease> {
        let mut sockets = self.lock();
        let pooled = sockets.get_mut(&key)?;
        if pooled.socket.is_closed() {
            sockets.remove(&key);
            return None;
        }
        pooled.leases += 1;
        Some(SocketLease {
            socket: pooled.socket.clone(),
            dht: dht.clone(),
            pooled: Some((self.clone(), key)),
        })
    }

    /// Drop one lease; returns the socket to close once none remain.
    fn release(&self, key: &PoolKey) -> Option<UdpMux> {
        let mut sockets = self.lock();
        let pooled = sockets.get_mut(key)?;
        pooled.leases = pooled.leases.saturating_sub(1);
        if pooled.leases > 0 {
            return None;
        }
        sockets.remove(key).map(|p| p.socket)
    }

    /// Number of pooled sockets
    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PoolKey, Pooled>> {
        self.sockets.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A socket held by one connection; released on drop
pub(crate) struct SocketLease {
    socket: UdpMux,
    dht: Dht,
    pooled: Option<(SocketPool, PoolKey)>,
}

impl SocketLease {
    pub(crate) fn socket(&self) -> &UdpMux {
        &self.socket
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        let close = match &self.pooled {
            Some((pool, key)) => pool.release(key),
            None => Some(self.socket.clone()),
        };
        let Some(socket) = close else {
            return;
        };
        let dht = self.dht.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                tokio::time::sleep(SOCKET_LINGER).await;
                dht.release_socket(socket.id()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spaceswarm_crypto::KeyPair;
    use spaceswarm_dht::DhtConfig;

    async fn lonely_dht() -> Dht {
        let config = DhtConfig {
            bootstrap: Vec::new(),
            known_nodes: Vec::new(),
            ..DhtConfig::default()
        };
        Dht::bind(
            "127.0.0.1:0".parse().unwrap(),
            KeyPair::generate().public_key(),
            config,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_reusable_leases_share_socket() {
        let dht = lonely_dht().await;
        let pool = SocketPool::default();
        let key = KeyPair::generate().public_key();

        let a = pool.acquire(&dht, key, false, true).await.unwrap();
        let b = pool.acquire(&dht, key, false, true).await.unwrap();
        assert_eq!(a.socket().id(), b.socket().id());
        assert_eq!(pool.len(), 1);

        let relayed = pool.acquire(&dht, key, true, true).await.unwrap();
        assert_ne!(relayed.socket().id(), a.socket().id());
        assert_eq!(pool.len(), 2);

        drop(a);
        assert_eq!(pool.len(), 2);
        drop(b);
        assert_eq!(pool.len(), 1);
        drop(relayed);
        assert_eq!(pool.len(), 0);
        dht.destroy().await;
    }

    #[tokio::test]
    async fn test_non_reusable_gets_own_socket() {
        let dht = lonely_dht().await;
        let pool = SocketPool::default();
        let key = KeyPair::generate().public_key();

        let a = pool.acquire(&dht, key, false, false).await.unwrap();
        let b = pool.acquire(&dht, key, false, false).await.unwrap();
        assert_ne!(a.socket().id(), b.socket().id());
        assert_ne!(a.socket().id(), dht.socket().id());
        assert_eq!(pool.len(), 0);
        dht.destroy().await;
    }
}
