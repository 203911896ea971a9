//! Membership listener
//!
//! Accepts join handshakes and leave notices from peers and keeps the member
//! table. One short-lived connection per message.

use super::config::ClusterConfig;
use super::message::{framed, recv_message, send_message, MemberInfo, MembershipMessage, NodeId};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Members known to this node, including itself
#[derive(Debug)]
pub struct MembershipTable {
    cluster_name: String,
    local: MemberInfo,
    members: RwLock<BTreeMap<NodeId, MemberInfo>>,
}

impl MembershipTable {
    pub fn new(cluster_name: impl Into<String>, local: MemberInfo) -> Self {
        let mut members = BTreeMap::new();
        members.insert(local.node_id, local.clone());
        MembershipTable {
            cluster_name: cluster_name.into(),
            local,
            members: RwLock::new(members),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn local(&self) -> &MemberInfo {
        &self.local
    }

    /// Returns true if the member was not known yet
    pub fn add(&self, member: MemberInfo) -> bool {
        self.members.write().insert(member.node_id, member).is_none()
    }

    pub fn remove(&self, node_id: NodeId) -> Option<MemberInfo> {
        if node_id == self.local.node_id {
            return None;
        }
        self.members.write().remove(&node_id)
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.members.read().values().cloned().collect()
    }

    /// Members other than this node
    pub fn peers(&self) -> Vec<MemberInfo> {
        self.members
            .read()
            .values()
            .filter(|m| m.node_id != self.local.node_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Answer to one inbound message, if any
    pub fn handle(&self, msg: MembershipMessage) -> Option<MembershipMessage> {
        match msg {
            MembershipMessage::JoinRequest {
                cluster_name,
                member,
            } => {
                if cluster_name != self.cluster_name {
                    warn!(
                        "Rejecting {} from cluster '{}' (local cluster '{}')",
                        member.address, cluster_name, self.cluster_name
                    );
                    return Some(MembershipMessage::JoinRejected {
                        reason: format!(
                            "cluster name mismatch: expected '{}', got '{}'",
                            self.cluster_name, cluster_name
                        ),
                    });
                }
                if member.node_id != self.local.node_id && self.add(member.clone()) {
                    info!("Member {} joined from {}", member.node_id, member.address);
                }
                Some(MembershipMessage::JoinAccepted {
                    cluster_name: self.cluster_name.clone(),
                    responder: self.local.clone(),
                    members: self.members(),
                })
            }
            MembershipMessage::Leave { member } => {
                if self.remove(member.node_id).is_some() {
                    info!("Member {} left ({})", member.node_id, member.address);
                }
                None
            }
            other => {
                debug!("Ignoring unexpected membership message {:?}", other);
                None
            }
        }
    }
}

/// Bind the listener on `port`, moving up one port at a time while in use
pub async fn bind_listener(config: &ClusterConfig) -> Result<TcpListener> {
    let attempts = config.bind_attempts();
    let mut last_err = None;

    for offset in 0..attempts {
        let Some(port) = config.port.checked_add(offset) else {
            break;
        };
        match TcpListener::bind((config.bind_host.as_str(), port)).await {
            Ok(listener) => {
                if offset > 0 {
                    info!("Port {} in use, membership listener moved to {}", config.port, port);
                }
                return Ok(listener);
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse && config.port_auto_increment => {
                debug!("Port {} in use, trying next", port);
                last_err = Some(e);
            }
            Err(e) => {
                return Err(Error::JoinFailed(format!(
                    "cannot bind membership listener on {}:{}: {}",
                    config.bind_host, port, e
                )));
            }
        }
    }

    Err(Error::JoinFailed(format!(
        "no free port in {}..{} on {}{}",
        config.port,
        config.port.saturating_add(attempts),
        config.bind_host,
        last_err.map(|e| format!(": {}", e)).unwrap_or_default()
    )))
}

/// Accept loop; exits when `cancel` fires
pub async fn serve(
    listener: TcpListener,
    table: Arc<MembershipTable>,
    read_timeout: Duration,
    cancel: CancellationToken,
) {
    let local_addr = listener.local_addr().ok();
    info!("Membership listener on {:?}", local_addr);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let table = table.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, table, read_timeout).await {
                            warn!("Membership connection from {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Membership accept failed: {}", e);
                }
            }
        }
    }

    info!("Membership listener on {:?} stopped", local_addr);
}

async fn handle_connection(
    stream: TcpStream,
    table: Arc<MembershipTable>,
    read_timeout: Duration,
) -> std::io::Result<()> {
    let mut framed = framed(stream);
    let msg = match tokio::time::timeout(read_timeout, recv_message(&mut framed)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(std::io::Error::new(ErrorKind::TimedOut, "no message before timeout"));
        }
    };
    let Some(msg) = msg else {
        return Ok(());
    };
    if let Some(reply) = table.handle(msg) {
        send_message(&mut framed, &reply).await?;
    }
    Ok(())
}

/// Resolve a listener address to what peers should dial
pub fn advertised_address(config: &ClusterConfig, local_addr: SocketAddr) -> String {
    format!("{}:{}", config.advertise_host(), local_addr.port())
}
