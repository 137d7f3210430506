use crate::{metrics::KNOWN_PEERS, system::SystemInfo};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::*;

/// Client identifiers that are never accepted as peers.
pub const REJECTED_CLIENTS: &[&str] = &["lisk-js-api"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PeerError {
    #[error("peer {0} is not known")]
    Unknown(String),
    #[error("invalid peer address {0}")]
    InvalidAddress(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Banned,
    Disconnected,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub broadhash: Option<String>,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub version: String,
    pub state: PeerState,
    /// Milliseconds since the unix epoch of the last insert or update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<u64>,
}

impl Peer {
    pub fn new(ip: &str, port: u16) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            height: 0,
            broadhash: None,
            nonce: String::new(),
            os: None,
            version: String::new(),
            state: PeerState::Disconnected,
            updated: None,
        }
    }

    /// Parses `ip:port`.
    pub fn parse(address: &str) -> Result<Self, PeerError> {
        let (ip, port) = address
            .rsplit_once(':')
            .ok_or_else(|| PeerError::InvalidAddress(address.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| PeerError::InvalidAddress(address.to_string()))?;
        Ok(Self::new(ip, port))
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    fn changed_fields(&self, other: &Peer) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.height != other.height {
            changed.push("height");
        }
        if self.broadhash != other.broadhash {
            changed.push("broadhash");
        }
        if self.nonce != other.nonce {
            changed.push("nonce");
        }
        if self.os != other.os {
            changed.push("os");
        }
        if self.version != other.version {
            changed.push("version");
        }
        if self.state != other.state {
            changed.push("state");
        }
        changed
    }

    /// Takes the fields `update` carries. Unknown values (zero height, empty
    /// nonce or version, missing broadhash or os) keep what we had.
    fn merge(&mut self, update: Peer) {
        if update.height > 0 {
            self.height = update.height;
        }
        if update.broadhash.is_some() {
            self.broadhash = update.broadhash;
        }
        if !update.nonce.is_empty() {
            self.nonce = update.nonce;
        }
        if update.os.is_some() {
            self.os = update.os;
        }
        if !update.version.is_empty() {
            self.version = update.version;
        }
        self.state = update.state;
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Known peers keyed by `ip:port`, with a cool-down that keeps recently
/// removed peers from being re-inserted.
pub struct PeerDirectory {
    peers: HashMap<String, Peer>,
    last_removed: HashMap<String, Instant>,
    ban_time: Duration,
    system: Arc<SystemInfo>,
}

impl PeerDirectory {
    pub fn new(system: Arc<SystemInfo>, ban_time: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            last_removed: HashMap::new(),
            ban_time,
            system,
        }
    }

    pub fn exists(&self, peer: &Peer) -> bool {
        self.peers.contains_key(&peer.key())
    }

    pub fn get(&self, key: &str) -> Option<&Peer> {
        self.peers.get(key)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Inserts `peer`, or merges the fields it carries into the known entry.
    /// Returns false when an existing peer is left alone because of
    /// `insert_only`, or a new peer is refused.
    pub fn upsert(&mut self, peer: Peer, insert_only: bool) -> bool {
        let key = peer.key();
        let accepted = match self.peers.get_mut(&key) {
            Some(existing) => {
                if insert_only {
                    return false;
                }
                let before = existing.clone();
                existing.merge(peer);
                existing.updated = Some(now_ms());
                let changed = before.changed_fields(existing);
                if changed.is_empty() {
                    trace!(peer = %key, "Peer not changed");
                } else {
                    debug!(peer = %key, ?changed, "Updated peer");
                }
                true
            }
            None => {
                if self.was_recently_removed(&key) {
                    debug!(peer = %key, "Rejecting recently removed peer");
                    return false;
                }
                if self.acceptable(vec![peer.clone()]).is_empty() {
                    debug!(peer = %key, version = %peer.version, "Rejecting unacceptable peer");
                    return false;
                }
                self.peers.insert(
                    key.clone(),
                    Peer {
                        updated: Some(now_ms()),
                        ..peer
                    },
                );
                debug!(peer = %key, "Inserted new peer");
                true
            }
        };

        let alive = self
            .peers
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .count();
        KNOWN_PEERS.set(self.peers.len() as i64);
        trace!(total = self.peers.len(), alive, "Peer stats");
        accepted
    }

    pub fn remove(&mut self, peer: &Peer) -> bool {
        let key = peer.key();
        if self.peers.remove(&key).is_some() {
            info!(peer = %key, "Removed peer");
            self.last_removed.insert(key, Instant::now());
            KNOWN_PEERS.set(self.peers.len() as i64);
            true
        } else {
            debug!(peer = %key, "Failed to remove peer, not known");
            false
        }
    }

    /// All known peers. `normalized` strips local bookkeeping.
    pub fn list(&self, normalized: bool) -> Vec<Peer> {
        self.peers
            .values()
            .cloned()
            .map(|mut peer| {
                if normalized {
                    peer.updated = None;
                }
                peer
            })
            .collect()
    }

    /// Filters out duplicate ips (first occurrence wins), ourselves, the
    /// unroutable address, rejected clients and incompatible versions.
    pub fn acceptable(&self, peers: Vec<Peer>) -> Vec<Peer> {
        let nonce = self.system.nonce();
        let mut seen = HashSet::new();
        peers
            .into_iter()
            .filter(|peer| seen.insert(peer.ip.clone()))
            .filter(|peer| {
                peer.nonce != nonce
                    && peer.ip != "0.0.0.0"
                    && !peer.os.as_deref().map_or(false, |os| REJECTED_CLIENTS.contains(&os))
            })
            .filter(|peer| self.system.version_compatible(&peer.version))
            .collect()
    }

    fn was_recently_removed(&self, key: &str) -> bool {
        self.last_removed
            .get(key)
            .map_or(false, |removed| removed.elapsed() < self.ban_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn directory() -> PeerDirectory {
        PeerDirectory::new(testing::system(), Duration::from_secs(600))
    }

    #[test]
    fn parses_addresses() {
        let peer = Peer::parse("10.0.0.1:5555").unwrap();
        assert_eq!((peer.ip.as_str(), peer.port), ("10.0.0.1", 5555));
        assert!(Peer::parse("10.0.0.1").is_err());
        assert!(Peer::parse("10.0.0.1:port").is_err());
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates() {
        let mut peers = directory();
        let mut peer = testing::peer("10.0.0.1", 10);
        assert!(peers.upsert(peer.clone(), false));
        assert!(!peers.upsert(peer.clone(), true));

        peer.height = 20;
        assert!(peers.upsert(peer.clone(), false));
        let stored = peers.get(&peer.key()).unwrap();
        assert_eq!(stored.height, 20);
        assert!(stored.updated.is_some());
        assert!(peers.list(true).iter().all(|p| p.updated.is_none()));
    }

    #[tokio::test]
    async fn updates_keep_fields_they_omit() {
        let mut peers = directory();
        let mut peer = testing::peer("10.0.0.1", 10);
        peer.os = Some("linux4.4".into());
        peer.broadhash = Some("abc".into());
        peers.upsert(peer.clone(), false);

        let refresh = Peer {
            height: 30,
            state: PeerState::Connected,
            ..Peer::new("10.0.0.1", 5555)
        };
        assert!(peers.upsert(refresh, false));
        let stored = peers.get(&peer.key()).unwrap();
        assert_eq!(stored.height, 30);
        assert_eq!(stored.os.as_deref(), Some("linux4.4"));
        assert_eq!(stored.broadhash.as_deref(), Some("abc"));
        assert_eq!(stored.nonce, peer.nonce);
        assert_eq!(stored.version, "0.1.0");
    }

    #[tokio::test(start_paused = true)]
    async fn removed_peers_cool_down() {
        let mut peers = directory();
        let peer = testing::peer("10.0.0.1", 10);
        assert!(peers.upsert(peer.clone(), false));
        assert!(peers.remove(&peer));
        assert!(!peers.remove(&peer));
        assert!(!peers.upsert(peer.clone(), false));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(peers.upsert(peer, false));
    }

    #[tokio::test]
    async fn acceptable_filters() {
        let peers = directory();
        let mut ourselves = testing::peer("10.0.0.2", 1);
        ourselves.nonce = peers.system.nonce();
        let mut unroutable = testing::peer("0.0.0.0", 1);
        unroutable.nonce = "other".into();
        let mut api_client = testing::peer("10.0.0.3", 1);
        api_client.os = Some("lisk-js-api".into());
        let mut outdated = testing::peer("10.0.0.4", 1);
        outdated.version = "0.0.1".into();
        let duplicate_ip = testing::peer("10.0.0.1", 99);

        let accepted = peers.acceptable(vec![
            testing::peer("10.0.0.1", 5),
            duplicate_ip,
            ourselves,
            unroutable,
            api_client,
            outdated,
        ]);
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].height, 5);
    }

    #[tokio::test]
    async fn unacceptable_peers_are_not_inserted() {
        let mut peers = directory();
        let mut outdated = testing::peer("10.0.0.4", 1);
        outdated.version = "0.0.1".into();
        assert!(!peers.upsert(outdated, false));
        assert!(peers.is_empty());
    }
}
