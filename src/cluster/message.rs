//! Membership wire protocol
//!
//! Every message is one JSON document in a length-delimited frame
//! (4-byte big-endian length prefix, 1MB cap). A join is a single
//! request/response exchange on a fresh connection.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Maximum frame size (1MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Random per-process identity; distinguishes this node from its peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn random() -> Self {
        NodeId(rand::random())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInfo {
    pub node_id: NodeId,
    /// Listener address announced to peers (`host:port`)
    pub address: String,
}

impl MemberInfo {
    pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
        MemberInfo {
            node_id,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MembershipMessage {
    JoinRequest {
        cluster_name: String,
        member: MemberInfo,
    },
    JoinAccepted {
        cluster_name: String,
        responder: MemberInfo,
        members: Vec<MemberInfo>,
    },
    JoinRejected {
        reason: String,
    },
    Leave {
        member: MemberInfo,
    },
}

impl MembershipMessage {
    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

pub type MembershipFramed<T> = Framed<T, LengthDelimitedCodec>;

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> MembershipFramed<T> {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_framed(io)
}

pub async fn send_message<T>(framed: &mut MembershipFramed<T>, msg: &MembershipMessage) -> io::Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let data = msg
        .serialize()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    framed.send(Bytes::from(data)).await
}

/// `Ok(None)` when the peer closed the connection
pub async fn recv_message<T>(framed: &mut MembershipFramed<T>) -> io::Result<Option<MembershipMessage>>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(frame)) => MembershipMessage::deserialize(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        Some(Err(e)) => Err(e),
        None => Ok(None),
    }
}
