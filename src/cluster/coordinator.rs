//! Membership coordinator
//!
//! Runs once at startup and gates readiness:
//!
//! ```text
//! Unjoined → Discovering → Joining → Joined
//!                 │            │
//!                 └────────────┴──→ JoinFailed (fatal)
//! ```
//!
//! Discovery produces candidate peer addresses. Joining binds the membership
//! listener first (so peers can already reach this node) and then handshakes
//! with the candidates in rounds separated by exponential backoff. A handshake
//! answered by this node's own id is a self-connection and drops the
//! candidate.

use super::config::{ClusterConfig, DiscoveryStrategy, DEFAULT_BOOTSTRAP_ADDRESS};
use super::listener::{advertised_address, bind_listener, serve, MembershipTable};
use super::message::{framed, recv_message, send_message, MemberInfo, MembershipMessage, NodeId};
use super::resolver::NameResolver;
use crate::aggregation::ReadinessGate;
use crate::error::{Error, Result};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipState {
    Unjoined,
    Discovering,
    Joining,
    Joined,
    JoinFailed(String),
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MembershipState::Unjoined => write!(f, "unjoined"),
            MembershipState::Discovering => write!(f, "discovering"),
            MembershipState::Joining => write!(f, "joining"),
            MembershipState::Joined => write!(f, "joined"),
            MembershipState::JoinFailed(reason) => write!(f, "join failed: {}", reason),
        }
    }
}

/// Outcome of one handshake
#[derive(Debug)]
enum Handshake {
    Accepted(Vec<MemberInfo>),
    /// The candidate is this node
    SelfConnection,
    Rejected(String),
    Unreachable(io::Error),
}

pub struct MembershipCoordinator<R: NameResolver> {
    config: ClusterConfig,
    resolver: R,
    node_id: NodeId,
    gate: ReadinessGate,
    state_tx: watch::Sender<MembershipState>,
}

impl<R: NameResolver> MembershipCoordinator<R> {
    pub fn new(config: ClusterConfig, resolver: R, gate: ReadinessGate) -> Self {
        let (state_tx, _) = watch::channel(MembershipState::Unjoined);
        MembershipCoordinator {
            config,
            resolver,
            node_id: NodeId::random(),
            gate,
            state_tx,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> MembershipState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MembershipState> {
        self.state_tx.subscribe()
    }

    fn transition(&self, next: MembershipState) {
        let previous = self.state_tx.send_replace(next.clone());
        debug_assert!(
            !matches!(previous, MembershipState::Joined | MembershipState::JoinFailed(_)),
            "Invariant: no transition out of terminal state {}",
            previous
        );
        info!("Membership {} -> {}", previous, next);
    }

    fn fail(&self, err: Error) -> Error {
        let reason = match &err {
            Error::JoinFailed(msg) | Error::InvalidConfiguration(msg) => msg.clone(),
            other => other.to_string(),
        };
        error!("Cluster join failed: {}", reason);
        self.transition(MembershipState::JoinFailed(reason));
        err
    }

    /// Establish membership; opens the readiness gate on success
    ///
    /// Blocks until this node is Joined or the join failed. Cancelling
    /// `shutdown` aborts the join with `JoinFailed`.
    pub async fn join(&self, shutdown: CancellationToken) -> Result<ClusterMembership> {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                Err(self.fail(Error::JoinFailed("shutdown requested during join".to_string())))
            }
            result = self.run_join(shutdown.child_token()) => result,
        }
    }

    async fn run_join(&self, listener_cancel: CancellationToken) -> Result<ClusterMembership> {
        let discovery = match self.config.validate().and_then(|_| self.config.discovery()) {
            Ok(d) => d,
            Err(e) => return Err(self.fail(e)),
        };

        self.transition(MembershipState::Discovering);
        let mut candidates = match self.discover(&discovery).await {
            Ok(c) => c,
            Err(e) => return Err(self.fail(e)),
        };
        info!("Discovery {:?} found {} candidate(s)", discovery, candidates.len());

        self.transition(MembershipState::Joining);
        let listener = match bind_listener(&self.config).await {
            Ok(l) => l,
            Err(e) => return Err(self.fail(e)),
        };
        let local_addr = match listener.local_addr() {
            Ok(a) => a,
            Err(e) => return Err(self.fail(Error::Io(e))),
        };
        let local = MemberInfo::new(self.node_id, advertised_address(&self.config, local_addr));
        let table = Arc::new(MembershipTable::new(self.config.cluster_name(), local.clone()));

        let server = tokio::spawn(serve(
            listener,
            table.clone(),
            self.config.connect_timeout,
            listener_cancel.clone(),
        ));

        let had_candidates = !candidates.is_empty();
        let mut last_failure = None;
        let mut joined = false;

        'rounds: for attempt in 0..self.config.join_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff_for(attempt - 1)).await;
            }

            let mut remaining = Vec::with_capacity(candidates.len());
            for candidate in candidates.drain(..) {
                match self.handshake(&candidate, &local).await {
                    Handshake::Accepted(members) => {
                        info!("Joined cluster '{}' via {}", self.config.cluster_name(), candidate);
                        for member in members {
                            if member.node_id != self.node_id {
                                table.add(member);
                            }
                        }
                        joined = true;
                        break 'rounds;
                    }
                    Handshake::SelfConnection => {
                        debug!("Candidate {} is this node", candidate);
                    }
                    Handshake::Rejected(reason) => {
                        warn!("Candidate {} rejected join: {}", candidate, reason);
                        last_failure = Some(format!("{} rejected join: {}", candidate, reason));
                        remaining.push(candidate);
                    }
                    Handshake::Unreachable(e) => {
                        debug!("Candidate {} unreachable: {}", candidate, e);
                        last_failure = Some(format!("{} unreachable: {}", candidate, e));
                        remaining.push(candidate);
                    }
                }
            }
            candidates = remaining;
            if candidates.is_empty() {
                break;
            }
        }

        if !joined {
            let peers_unreachable = !candidates.is_empty();
            match (&discovery, peers_unreachable) {
                (DiscoveryStrategy::Static(addr), true) => {
                    listener_cancel.cancel();
                    let _ = server.await;
                    return Err(self.fail(Error::JoinFailed(format!(
                        "bootstrap member {} not reachable after {} attempt(s): {}",
                        addr,
                        self.config.join_attempts,
                        last_failure.unwrap_or_default()
                    ))));
                }
                (_, true) => {
                    warn!(
                        "No peer accepted the join ({}); starting as first member",
                        last_failure.unwrap_or_default()
                    );
                }
                (_, false) if had_candidates => {
                    info!("Only this node was discovered; starting as first member");
                }
                (_, false) => {
                    info!("No peers discovered; starting as first member");
                }
            }
        }

        self.gate.open();
        self.transition(MembershipState::Joined);
        info!(
            "Node {} at {} is member of '{}' with {} member(s)",
            self.node_id,
            local.address,
            self.config.cluster_name(),
            table.len()
        );

        Ok(ClusterMembership {
            table,
            local_addr,
            connect_timeout: self.config.connect_timeout,
            gate: self.gate.clone(),
            listener_cancel,
            server: Some(server),
        })
    }

    /// Candidate peer addresses for the configured discovery mode
    async fn discover(&self, discovery: &DiscoveryStrategy) -> Result<Vec<String>> {
        match discovery {
            DiscoveryStrategy::Static(addr) => {
                info!("Using bootstrap server '{}'", addr);
                Ok(vec![addr.clone()])
            }
            DiscoveryStrategy::Default => {
                info!(
                    "Neither a bootstrap server nor a DNS name was provided; using default bootstrap server '{}'",
                    DEFAULT_BOOTSTRAP_ADDRESS
                );
                Ok(vec![DEFAULT_BOOTSTRAP_ADDRESS.to_string()])
            }
            DiscoveryStrategy::Dns(name) => {
                info!("Using DNS name '{}'", name);
                let addrs = self.resolve_with_retry(name).await?;
                Ok(addrs.into_iter().map(|a| a.to_string()).collect())
            }
        }
    }

    async fn resolve_with_retry(&self, name: &str) -> Result<Vec<SocketAddr>> {
        let mut last_err = None;
        for attempt in 0..self.config.join_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.config.backoff_for(attempt - 1)).await;
            }
            match timeout(self.config.connect_timeout, self.resolver.resolve(name, self.config.port)).await {
                Ok(Ok(addrs)) => return Ok(addrs),
                Ok(Err(e)) => {
                    warn!("Resolving '{}' failed (attempt {}): {}", name, attempt + 1, e);
                    last_err = Some(e.to_string());
                }
                Err(_) => {
                    warn!("Resolving '{}' timed out (attempt {})", name, attempt + 1);
                    last_err = Some("timed out".to_string());
                }
            }
        }
        Err(Error::JoinFailed(format!(
            "cannot resolve '{}' after {} attempt(s): {}",
            name,
            self.config.join_attempts,
            last_err.unwrap_or_default()
        )))
    }

    async fn handshake(&self, candidate: &str, local: &MemberInfo) -> Handshake {
        let exchange = async {
            let stream = TcpStream::connect(candidate).await?;
            let mut framed = framed(stream);
            let request = MembershipMessage::JoinRequest {
                cluster_name: self.config.cluster_name().to_string(),
                member: local.clone(),
            };
            send_message(&mut framed, &request).await?;
            recv_message(&mut framed).await
        };

        match timeout(self.config.connect_timeout, exchange).await {
            Err(_) => Handshake::Unreachable(io::Error::new(io::ErrorKind::TimedOut, "handshake timed out")),
            Ok(Err(e)) => Handshake::Unreachable(e),
            Ok(Ok(None)) => Handshake::Unreachable(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before reply",
            )),
            Ok(Ok(Some(MembershipMessage::JoinAccepted {
                cluster_name,
                responder,
                members,
            }))) => {
                if responder.node_id == self.node_id {
                    Handshake::SelfConnection
                } else if cluster_name != self.config.cluster_name() {
                    Handshake::Rejected(format!("peer belongs to cluster '{}'", cluster_name))
                } else {
                    Handshake::Accepted(members)
                }
            }
            Ok(Ok(Some(MembershipMessage::JoinRejected { reason }))) => Handshake::Rejected(reason),
            Ok(Ok(Some(other))) => Handshake::Unreachable(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected reply {:?}", other),
            )),
        }
    }
}

/// Handle to an established membership
pub struct ClusterMembership {
    table: Arc<MembershipTable>,
    local_addr: SocketAddr,
    connect_timeout: std::time::Duration,
    gate: ReadinessGate,
    listener_cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl ClusterMembership {
    pub fn local(&self) -> &MemberInfo {
        self.table.local()
    }

    pub fn node_id(&self) -> NodeId {
        self.table.local().node_id
    }

    /// Address the membership listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.table.members()
    }

    pub fn cluster_size(&self) -> usize {
        self.table.len()
    }

    /// Notify known peers, close the readiness gate and stop the listener
    pub async fn leave(mut self) {
        let notice = MembershipMessage::Leave {
            member: self.table.local().clone(),
        };
        for peer in self.table.peers() {
            let send = async {
                let stream = TcpStream::connect(&peer.address).await?;
                let mut framed = framed(stream);
                send_message(&mut framed, &notice).await
            };
            match timeout(self.connect_timeout, send).await {
                Ok(Ok(())) => debug!("Sent leave to {}", peer.address),
                Ok(Err(e)) => warn!("Leave notice to {} failed: {}", peer.address, e),
                Err(_) => warn!("Leave notice to {} timed out", peer.address),
            }
        }

        self.gate.close();
        self.listener_cancel.cancel();
        if let Some(server) = self.server.take() {
            let _ = server.await;
        }
        info!("Node {} left the cluster", self.table.local().node_id);
    }
}

impl Drop for ClusterMembership {
    fn drop(&mut self) {
        self.listener_cancel.cancel();
    }
}
