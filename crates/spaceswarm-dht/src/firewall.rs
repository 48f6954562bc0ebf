//! Firewall classification.
//!
//! The classifier asks a few remote nodes to send an unsolicited NAT probe
//! (`PING_NAT`) from a socket we never talked to. If one arrives, inbound
//! traffic is unfiltered and the node is OPEN. Otherwise the addresses remote
//! nodes reported for us decide: the same external port everywhere means
//! CONSISTENT, differing ports mean RANDOM.
//!
//! The result is published through a watch channel. Repeated connection
//! failures ask for a new probe round.

use crate::messages::{FirewallClass, InternalCommand, NatProbe, decode, encode};
use crate::rpc::{Call, RpcEngine};
use dashmap::DashMap;
use spaceswarm_transport::{UdpTransport, CHANNEL_NAT_PROBE, Transport};
use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;

/// Classify from (remote, observed) pairs alone.
///
/// Needs reports from at least two distinct remotes; fewer yield UNKNOWN.
#[must_use]
pub fn classify_observations(observations: &[(SocketAddr, SocketAddr)]) -> FirewallClass {
    let remotes: HashSet<_> = observations.iter().map(|(remote, _)| *remote).collect();
    if remotes.len() < 2 {
        return FirewallClass::Unknown;
    }
    let mapped: HashSet<_> = observations.iter().map(|(_, observed)| *observed).collect();
    if mapped.len() == 1 {
        FirewallClass::Consistent
    } else {
        FirewallClass::Random
    }
}

/// Send an unsolicited NAT probe to `to` from a fresh socket.
///
/// # Errors
/// Fails if the probe socket cannot be bound or the send fails.
pub async fn send_nat_probe(to: SocketAddr, token: u64) -> Result<(), spaceswarm_transport::TransportError> {
    let bind: SocketAddr = match to {
        SocketAddr::V4(v4) if v4.ip().is_loopback() => (Ipv4Addr::LOCALHOST, 0).into(),
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpTransport::bind(bind).await?;
    let body = encode(&NatProbe { token })
        .map_err(|e| spaceswarm_transport::TransportError::BindFailed(e.to_string()))?;
    let mut datagram = Vec::with_capacity(1 + body.len());
    datagram.push(CHANNEL_NAT_PROBE);
    datagram.extend_from_slice(&body);
    socket.send_to(&datagram, to).await?;
    socket.close().await?;
    Ok(())
}

/// Per-node firewall state machine
pub struct FirewallClassifier {
    state: watch::Sender<FirewallClass>,
    pinned: Option<FirewallClass>,
    quick: bool,
    failures_before_reprobe: u32,
    failures: AtomicU32,
    waiting: DashMap<u64, oneshot::Sender<SocketAddr>>,
}

impl FirewallClassifier {
    /// Create a classifier. A `pinned` class is published immediately and never re-probed.
    #[must_use]
    pub fn new(pinned: Option<FirewallClass>, quick: bool, failures_before_reprobe: u32) -> Self {
        let (state, _) = watch::channel(pinned.unwrap_or_default());
        Self {
            state,
            pinned,
            quick,
            failures_before_reprobe: failures_before_reprobe.max(1),
            failures: AtomicU32::new(0),
            waiting: DashMap::new(),
        }
    }

    /// Current classification
    #[must_use]
    pub fn current(&self) -> FirewallClass {
        *self.state.borrow()
    }

    /// Subscribe to classification changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FirewallClass> {
        self.state.subscribe()
    }

    /// True if the class was fixed by configuration
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }

    /// Handle an inbound NAT probe datagram.
    pub fn on_nat_probe(&self, payload: &[u8], from: SocketAddr) {
        let Ok(probe) = decode::<NatProbe>(payload) else {
            return;
        };
        if let Some((_, tx)) = self.waiting.remove(&probe.token) {
            let _ = tx.send(from);
        }
    }

    /// Count a failed connection attempt. Returns true when a re-probe is due.
    pub fn record_failure(&self) -> bool {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        !self.is_pinned() && failures >= self.failures_before_reprobe
    }

    /// Clear the failure count after a successful connection
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }

    /// Run a probe round against `targets` and publish the result.
    pub async fn probe(&self, rpc: &Arc<RpcEngine>, targets: &[SocketAddr]) -> FirewallClass {
        if let Some(pinned) = self.pinned {
            return pinned;
        }
        self.failures.store(0, Ordering::Relaxed);

        let wanted = if self.quick { 2 } else { 4 };
        let wait = rpc.config().timeout * 2;
        let mut tasks = JoinSet::new();
        let mut receivers = Vec::new();

        for to in targets.iter().take(wanted) {
            let token: u64 = rand::random();
            let (tx, rx) = oneshot::channel();
            self.waiting.insert(token, tx);
            receivers.push((token, rx));

            let Ok(value) = encode(&NatProbe { token }) else {
                continue;
            };
            let rpc = rpc.clone();
            let to = *to;
            tasks.spawn(async move {
                let call = Call::internal(InternalCommand::PingNat).with_value(value);
                rpc.request(to, &call).await.is_ok()
            });
        }

        let mut answered = 0;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(true)) {
                answered += 1;
            }
        }

        let mut open = false;
        if answered > 0 {
            for (_, rx) in &mut receivers {
                if let Ok(Ok(from)) = tokio::time::timeout(wait, &mut *rx).await {
                    tracing::debug!("unsolicited probe from {} reached us", from);
                    open = true;
                    break;
                }
            }
        }
        for (token, _) in &receivers {
            self.waiting.remove(token);
        }

        let class = if open {
            FirewallClass::Open
        } else {
            classify_observations(&rpc.observations())
        };
        tracing::info!("firewall classified as {:?}", class);
        let _ = self.state.send(class);
        class
    }
}

impl std::fmt::Debug for FirewallClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirewallClassifier")
            .field("class", &self.current())
            .field("pinned", &self.pinned)
            .finish()
    }
}

/// Default interval between periodic re-probes
pub const DEFAULT_REPROBE_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use spaceswarm_transport::UdpMux;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_single_remote_is_unknown() {
        let obs = [(addr("1.1.1.1:1"), addr("9.9.9.9:100"))];
        assert_eq!(classify_observations(&obs), FirewallClass::Unknown);
        assert_eq!(classify_observations(&[]), FirewallClass::Unknown);
    }

    #[test]
    fn test_stable_port_is_consistent() {
        let obs = [
            (addr("1.1.1.1:1"), addr("9.9.9.9:100")),
            (addr("2.2.2.2:1"), addr("9.9.9.9:100")),
        ];
        assert_eq!(classify_observations(&obs), FirewallClass::Consistent);
    }

    #[test]
    fn test_changing_port_is_random() {
        let obs = [
            (addr("1.1.1.1:1"), addr("9.9.9.9:100")),
            (addr("2.2.2.2:1"), addr("9.9.9.9:101")),
        ];
        assert_eq!(classify_observations(&obs), FirewallClass::Random);
    }

    #[test]
    fn test_failures_trigger_reprobe() {
        let classifier = FirewallClassifier::new(None, true, 3);
        assert!(!classifier.record_failure());
        assert!(!classifier.record_failure());
        assert!(classifier.record_failure());
        classifier.record_success();
        assert!(!classifier.record_failure());
    }

    #[test]
    fn test_pinned_class_never_reprobes() {
        let classifier = FirewallClassifier::new(Some(FirewallClass::Consistent), true, 1);
        assert_eq!(classifier.current(), FirewallClass::Consistent);
        assert!(!classifier.record_failure());
    }

    #[tokio::test]
    async fn test_nat_probe_resolves_waiter() {
        let classifier = FirewallClassifier::new(None, true, 3);
        let (tx, rx) = oneshot::channel();
        classifier.waiting.insert(77, tx);

        let (mux, mut inbound) = UdpMux::bind(addr("127.0.0.1:0")).await.unwrap();
        send_nat_probe(mux.local_addr().unwrap(), 77).await.unwrap();

        let datagram = tokio::time::timeout(Duration::from_secs(2), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(datagram.channel, CHANNEL_NAT_PROBE);
        classifier.on_nat_probe(&datagram.payload, datagram.from);
        assert_eq!(rx.await.unwrap(), datagram.from);
        assert!(classifier.waiting.is_empty());
    }
}
