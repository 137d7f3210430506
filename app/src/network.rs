//! Peer transport and broadhash consensus collaborators.

use crate::{
    peers::{Peer, PeerDirectory, PeerState},
    system::SystemInfo,
};
use async_trait::async_trait;
use hyper::{body::HttpBody, client::HttpConnector, Body, Client, Method, Request, StatusCode};
use serde_json::Value;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::*;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest response body accepted from a peer.
const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer {peer} is unreachable: {reason}")]
    Unreachable { peer: String, reason: String },
    #[error("request to {peer} timed out")]
    Timeout { peer: String },
    #[error("peer {peer} answered with status {status}")]
    Status { peer: String, status: u16 },
    #[error("peer {peer} sent a malformed response: {reason}")]
    InvalidResponse { peer: String, reason: String },
}

/// Typed request descriptor; responses come back as JSON bodies for the
/// caller to validate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRequest {
    /// The peer's current chain height, as `{"height": n}`.
    Height,
    /// Highest block the peer shares with `ids`, as `{"common": {...} | null}`.
    CommonBlock { ids: Vec<String> },
    /// Blocks following `last_block_id`, as `{"blocks": [...]}`.
    BlocksAfter { last_block_id: String, limit: usize },
    /// Unconfirmed transactions, as `{"transactions": [...]}`.
    Transactions,
    /// Pending multisignature signatures, as `{"signatures": [...]}`.
    Signatures,
}

impl PeerRequest {
    pub fn path(&self) -> String {
        match self {
            PeerRequest::Height => "/peer/height".to_string(),
            PeerRequest::CommonBlock { ids } => format!("/peer/blocks/common?ids={}", ids.join(",")),
            PeerRequest::BlocksAfter { last_block_id, limit } => {
                format!("/peer/blocks?lastBlockId={last_block_id}&limit={limit}")
            }
            PeerRequest::Transactions => "/peer/transactions".to_string(),
            PeerRequest::Signatures => "/peer/signatures".to_string(),
        }
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn request(&self, peer: &Peer, request: PeerRequest) -> Result<Value, TransportError>;
}

/// JSON over HTTP/1.1, advertising our node headers on every request.
pub struct HttpTransport {
    client: Client<HttpConnector>,
    system: Arc<SystemInfo>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(system: Arc<SystemInfo>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            system,
            timeout,
        }
    }

    fn build(&self, peer: &Peer, request: &PeerRequest) -> Result<Request<Body>, TransportError> {
        let headers = self.system.headers();
        Request::builder()
            .method(Method::GET)
            .uri(format!("http://{}{}", peer.key(), request.path()))
            .header("accept", "application/json")
            .header("nethash", headers.nethash)
            .header("broadhash", headers.broadhash)
            .header("version", headers.version)
            .header("nonce", headers.nonce)
            .header("os", headers.os)
            .header("port", headers.port.to_string())
            .header("height", headers.height.to_string())
            .body(Body::empty())
            .map_err(|e| TransportError::Unreachable {
                peer: peer.key(),
                reason: e.to_string(),
            })
    }

    async fn read_body(peer: &Peer, mut body: Body) -> Result<Vec<u8>, TransportError> {
        let mut buffer = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.map_err(|e| TransportError::Unreachable {
                peer: peer.key(),
                reason: e.to_string(),
            })?;
            if buffer.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(TransportError::InvalidResponse {
                    peer: peer.key(),
                    reason: format!("body exceeds {MAX_BODY_BYTES} bytes"),
                });
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer)
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn request(&self, peer: &Peer, request: PeerRequest) -> Result<Value, TransportError> {
        let http_request = self.build(peer, &request)?;
        trace!(peer = %peer.key(), path = %request.path(), "Sending peer request");

        let response = tokio::time::timeout(self.timeout, self.client.request(http_request))
            .await
            .map_err(|_| TransportError::Timeout { peer: peer.key() })?
            .map_err(|e| TransportError::Unreachable {
                peer: peer.key(),
                reason: e.to_string(),
            })?;

        if response.status() != StatusCode::OK {
            return Err(TransportError::Status {
                peer: peer.key(),
                status: response.status().as_u16(),
            });
        }

        let body = Self::read_body(peer, response.into_body()).await?;
        serde_json::from_slice(&body).map_err(|e| TransportError::InvalidResponse {
            peer: peer.key(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Re-evaluates broadhash consensus over at most `limit` peers and
    /// returns the share, in percent, that agrees with our broadhash.
    async fn refresh_consensus(&self, limit: usize) -> Result<f64, TransportError>;
}

/// Computes consensus from the peers already held in the directory.
pub struct DirectoryBroadcaster {
    peers: Arc<RwLock<PeerDirectory>>,
    system: Arc<SystemInfo>,
}

impl DirectoryBroadcaster {
    pub fn new(peers: Arc<RwLock<PeerDirectory>>, system: Arc<SystemInfo>) -> Self {
        Self { peers, system }
    }
}

pub fn consensus(peers: &[Peer], broadhash: &str) -> f64 {
    if peers.is_empty() {
        return 0.0;
    }
    let matched = peers
        .iter()
        .filter(|peer| peer.broadhash.as_deref() == Some(broadhash))
        .count();
    (matched as f64 / peers.len() as f64 * 100.0).round()
}

#[async_trait]
impl Broadcaster for DirectoryBroadcaster {
    async fn refresh_consensus(&self, limit: usize) -> Result<f64, TransportError> {
        let connected: Vec<Peer> = self
            .peers
            .read()
            .await
            .list(true)
            .into_iter()
            .filter(|peer| peer.state == PeerState::Connected)
            .take(limit)
            .collect();
        let broadhash = self.system.headers().broadhash;
        let consensus = consensus(&connected, &broadhash);
        debug!(peers = connected.len(), consensus, "Broadhash consensus");
        Ok(consensus)
    }
}
