//! Iterative Kademlia lookups.
//!
//! A query starts from the closest contacts in the routing table plus any
//! seed addresses, asks up to α unqueried candidates per round, and merges the
//! closer nodes they return. When a round brings nothing closer than the best
//! node seen so far, a final round asks every still-unqueried candidate among
//! the current top k, so the result holds the true k closest responders.

use crate::messages::{InternalCommand, PeerAddr, encode};
use crate::node_id::NodeId;
use crate::rpc::{Call, Reply, RpcEngine, RpcError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fresh,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug, Clone)]
struct Candidate {
    id: Option<NodeId>,
    addr: SocketAddr,
    // Node that told us about this candidate
    via: Option<SocketAddr>,
    state: State,
}

/// Outcome of an iterative query
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Up to k closest nodes that answered, nearest first
    pub closest: Vec<PeerAddr>,
    /// Every successful reply, in arrival order
    pub replies: Vec<Reply>,
    /// Rounds run
    pub rounds: usize,
}

impl QueryResult {
    /// Replies that carry a value
    pub fn values(&self) -> impl Iterator<Item = (&Reply, &[u8])> {
        self.replies
            .iter()
            .filter_map(|r| r.value.as_deref().map(|v| (r, v)))
    }
}

/// A lookup towards one target
pub struct Query {
    rpc: Arc<RpcEngine>,
    target: NodeId,
    call: Call,
    candidates: Vec<Candidate>,
    result: QueryResult,
}

impl Query {
    /// Prepare a query that sends `call` to nodes near `target`.
    ///
    /// The call's target is set to `target`.
    #[must_use]
    pub fn new(rpc: Arc<RpcEngine>, target: [u8; 32], call: Call, seeds: &[SocketAddr]) -> Self {
        let k = rpc.config().k;
        let node_target = NodeId::from_bytes(target);
        let mut candidates: Vec<Candidate> = rpc
            .routing()
            .closest(&node_target, k)
            .into_iter()
            .map(|c| Candidate {
                id: Some(c.id),
                addr: c.addr,
                via: None,
                state: State::Fresh,
            })
            .collect();
        for seed in seeds {
            if !candidates.iter().any(|c| c.addr == *seed) {
                candidates.push(Candidate {
                    id: None,
                    addr: *seed,
                    via: None,
                    state: State::Fresh,
                });
            }
        }
        Self {
            rpc,
            target: node_target,
            call: call.with_target(target),
            candidates,
            result: QueryResult::default(),
        }
    }

    /// Run the query to completion.
    ///
    /// # Errors
    /// - [`RpcError::NoNodes`] if no candidate answered
    /// - [`RpcError::Destroyed`] if the node shut down meanwhile
    pub async fn run(mut self) -> Result<QueryResult, RpcError> {
        let config = self.rpc.config().clone();
        let mut best: Option<NodeId> = None;

        while self.result.rounds < config.max_rounds {
            let batch = self.next_batch(config.alpha, None);
            if batch.is_empty() {
                break;
            }
            self.result.rounds += 1;
            self.query_batch(batch).await?;

            let round_best = self.best_responded();
            let improved = match (round_best, best) {
                (Some(new), Some(old)) => self.target.cmp_distance(&new, &old).is_lt(),
                (Some(_), None) => true,
                _ => false,
            };
            if improved {
                best = round_best;
                continue;
            }

            // Converged: sweep whatever is left of the top k.
            let sweep = self.next_batch(usize::MAX, Some(config.k));
            if !sweep.is_empty() {
                self.result.rounds += 1;
                self.query_batch(sweep).await?;
            }
            if self.next_batch(1, Some(config.k)).is_empty() {
                break;
            }
        }

        if self.result.replies.is_empty() {
            return Err(RpcError::NoNodes);
        }

        let mut responded: Vec<PeerAddr> = self
            .candidates
            .iter()
            .filter(|c| c.state == State::Responded)
            .filter_map(|c| c.id.map(|id| PeerAddr { id, addr: c.addr }))
            .collect();
        responded.sort_by(|a, b| self.target.cmp_distance(&a.id, &b.id));
        responded.dedup_by_key(|p| p.id);
        responded.truncate(config.k);
        self.result.closest = responded;

        tracing::debug!(
            "query {} finished: {} replies, {} rounds",
            self.target,
            self.result.replies.len(),
            self.result.rounds
        );
        Ok(self.result)
    }

    /// Indices of up to `limit` fresh candidates, nearest first. With `top`,
    /// only candidates ranked within the `top` nearest live ones qualify.
    fn next_batch(&mut self, limit: usize, top: Option<usize>) -> Vec<usize> {
        let target = self.target;
        let mut order: Vec<usize> = (0..self.candidates.len())
            .filter(|&i| self.candidates[i].state != State::Failed)
            .collect();
        order.sort_by(|&a, &b| match (self.candidates[a].id, self.candidates[b].id) {
            (Some(x), Some(y)) => target.cmp_distance(&x, &y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        if let Some(top) = top {
            order.truncate(top);
        }
        order
            .into_iter()
            .filter(|&i| self.candidates[i].state == State::Fresh)
            .take(limit)
            .collect()
    }

    async fn query_batch(&mut self, batch: Vec<usize>) -> Result<(), RpcError> {
        let mut tasks = JoinSet::new();
        for index in batch {
            self.candidates[index].state = State::InFlight;
            let rpc = self.rpc.clone();
            let call = self.call.clone();
            let addr = self.candidates[index].addr;
            tasks.spawn(async move { (index, rpc.request(addr, &call).await) });
        }

        let mut destroyed = false;
        while let Some(joined) = tasks.join_next().await {
            let Ok((index, outcome)) = joined else {
                continue;
            };
            match outcome {
                Ok(reply) => self.on_reply(index, reply),
                Err(RpcError::Destroyed) => {
                    destroyed = true;
                    self.candidates[index].state = State::Failed;
                }
                Err(_) => self.on_failure(index),
            }
        }
        if destroyed {
            return Err(RpcError::Destroyed);
        }
        Ok(())
    }

    fn on_reply(&mut self, index: usize, reply: Reply) {
        let local = self.rpc.local_id();
        let candidate = &mut self.candidates[index];
        candidate.state = State::Responded;
        if reply.id.is_some() {
            candidate.id = reply.id;
        }
        let from = reply.from;

        for node in &reply.closer_nodes {
            if node.id == local {
                continue;
            }
            let known = self
                .candidates
                .iter()
                .any(|c| c.id == Some(node.id) || c.addr == node.addr);
            if !known {
                self.candidates.push(Candidate {
                    id: Some(node.id),
                    addr: node.addr,
                    via: Some(from),
                    state: State::Fresh,
                });
            }
        }
        self.result.replies.push(reply);
    }

    fn on_failure(&mut self, index: usize) {
        let candidate = &mut self.candidates[index];
        candidate.state = State::Failed;
        let (Some(id), Some(via)) = (candidate.id, candidate.via) else {
            return;
        };
        let hint = PeerAddr {
            id,
            addr: candidate.addr,
        };
        let Ok(value) = encode(&hint) else {
            return;
        };
        let rpc = self.rpc.clone();
        let timeout = rpc.config().timeout;
        tokio::spawn(async move {
            let call = Call::internal(InternalCommand::DownHint).with_value(value);
            let _ = rpc.request_once(rpc.mux(), via, &call, timeout).await;
        });
    }

    fn best_responded(&self) -> Option<NodeId> {
        self.candidates
            .iter()
            .filter(|c| c.state == State::Responded)
            .filter_map(|c| c.id)
            .min_by(|a, b| self.target.cmp_distance(a, b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{ErrorCode, Message, Request, RequestKind, decode};
    use crate::rpc::RpcConfig;
    use spaceswarm_transport::{Datagram, UdpMux};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn fast_config() -> RpcConfig {
        RpcConfig {
            timeout: Duration::from_millis(50),
            retries: 0,
            ..RpcConfig::default()
        }
    }

    async fn engine_with(config: RpcConfig) -> (Arc<RpcEngine>, mpsc::UnboundedReceiver<Datagram>) {
        let (mux, rx) = UdpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        (Arc::new(RpcEngine::new(mux, NodeId::random(), false, config)), rx)
    }

    async fn engine() -> (Arc<RpcEngine>, mpsc::UnboundedReceiver<Datagram>) {
        engine_with(fast_config()).await
    }

    /// Answer every request with the engine's closest contacts. Returns the
    /// requests as they arrive.
    fn serve(
        engine: Arc<RpcEngine>,
        mut rx: mpsc::UnboundedReceiver<Datagram>,
    ) -> mpsc::UnboundedReceiver<Request> {
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(datagram) = rx.recv().await {
                match Message::decode(&datagram.payload) {
                    Ok(Message::Request(req)) => {
                        let closer = engine.closer_nodes(&req.target.unwrap_or_default());
                        let _ = engine
                            .reply(&datagram.socket, &req, datagram.from, closer, ErrorCode::None, None)
                            .await;
                        let _ = seen_tx.send(req);
                    }
                    Ok(Message::Response(resp)) => {
                        engine.on_response(resp, datagram.from);
                    }
                    Err(_) => {}
                }
            }
        });
        seen_rx
    }

    fn addr_of(engine: &RpcEngine) -> SocketAddr {
        engine.mux().local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_no_candidates_is_no_nodes() {
        let (client, rx) = engine().await;
        serve(client.clone(), rx);
        let call = Call::internal(InternalCommand::FindNode);
        let result = Query::new(client, [1u8; 32], call, &[]).run().await;
        assert!(matches!(result, Err(RpcError::NoNodes)));
    }

    #[tokio::test]
    async fn test_silent_seed_is_no_nodes() {
        let (client, rx) = engine().await;
        serve(client.clone(), rx);
        let (silent, _silent_rx) = UdpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let seed = silent.local_addr().unwrap();

        let call = Call::internal(InternalCommand::FindNode);
        let result = Query::new(client, [1u8; 32], call, &[seed]).run().await;
        assert!(matches!(result, Err(RpcError::NoNodes)));
    }

    #[tokio::test]
    async fn test_walks_chain_to_every_node() {
        let mut responders = Vec::new();
        for _ in 0..5 {
            let (engine, rx) = engine().await;
            serve(engine.clone(), rx);
            responders.push(engine);
        }
        // Each responder only knows the next one.
        for pair in responders.windows(2) {
            pair[0].observe(pair[1].local_id(), addr_of(&pair[1]), None);
        }

        let (client, rx) = engine().await;
        serve(client.clone(), rx);
        let seed = addr_of(&responders[0]);
        let target = NodeId::random();
        let call = Call::internal(InternalCommand::FindNode);
        let result = Query::new(client.clone(), *target.as_bytes(), call, &[seed])
            .run()
            .await
            .unwrap();

        assert_eq!(result.closest.len(), responders.len());
        assert!(result.rounds <= client.config().max_rounds);
        for pair in result.closest.windows(2) {
            assert!(target.cmp_distance(&pair[0].id, &pair[1].id).is_le());
        }
        for responder in &responders {
            assert!(result.closest.iter().any(|p| p.id == responder.local_id()));
        }
    }

    #[tokio::test]
    async fn test_finds_true_k_closest_in_larger_network() {
        const NETWORK: usize = 24;
        const K: usize = 8;

        let mut responders = Vec::new();
        for _ in 0..NETWORK {
            let (engine, rx) = engine().await;
            serve(engine.clone(), rx);
            responders.push(engine);
        }
        for a in &responders {
            for b in &responders {
                a.observe(b.local_id(), addr_of(b), None);
            }
        }

        // One request per round: only the sweep after a stalled round can
        // reach all of the top k in a few rounds.
        let (client, rx) = engine_with(RpcConfig {
            alpha: 1,
            k: K,
            ..fast_config()
        })
        .await;
        serve(client.clone(), rx);

        let target = NodeId::random();
        let mut expected: Vec<NodeId> = responders.iter().map(|r| r.local_id()).collect();
        expected.sort_by(|a, b| target.cmp_distance(a, b));
        expected.truncate(K);

        let call = Call::internal(InternalCommand::FindNode);
        let result = Query::new(client, *target.as_bytes(), call, &[addr_of(&responders[0])])
            .run()
            .await
            .unwrap();

        let found: Vec<NodeId> = result.closest.iter().map(|p| p.id).collect();
        assert_eq!(found, expected);
        assert!(result.rounds <= 5, "took {} rounds", result.rounds);
    }

    #[tokio::test]
    async fn test_dead_contact_reported_to_referrer() {
        let (referrer, rx) = engine().await;
        let mut seen = serve(referrer.clone(), rx);

        // Bound but never answers.
        let (dead, _dead_rx) = UdpMux::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let dead_id = NodeId::random();
        let dead_addr = dead.local_addr().unwrap();
        referrer.observe(dead_id, dead_addr, None);

        let (client, rx) = engine().await;
        serve(client.clone(), rx);
        let call = Call::internal(InternalCommand::FindNode);
        let result = Query::new(client, *dead_id.as_bytes(), call, &[addr_of(&referrer)])
            .run()
            .await
            .unwrap();
        assert_eq!(result.closest.len(), 1);
        assert_eq!(result.closest[0].id, referrer.local_id());

        let hint = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let request = seen.recv().await.unwrap();
                if request.kind == RequestKind::Internal(InternalCommand::DownHint) {
                    return request;
                }
            }
        })
        .await
        .unwrap();
        let reported: PeerAddr = decode(hint.value.as_deref().unwrap()).unwrap();
        assert_eq!(reported.id, dead_id);
        assert_eq!(reported.addr, dead_addr);
    }
}
