//! Local node identity as advertised to peers, plus the version and fee
//! schedules that depend on the current height.

use crate::{
    block::BlockHeader,
    spec::{ChainSpec, FeeMilestone},
};
use lazy_static::lazy_static;
use rand::{distributions::Alphanumeric, Rng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{PoisonError, RwLock};
use tracing::*;

lazy_static! {
    static ref REQUIREMENT: Regex =
        Regex::new(r"^(\^|~|>=)?(\d+)\.(\d+)\.(\d+)([a-z])?$").expect("static regex");
    static ref VERSION: Regex = Regex::new(r"^(\d+)\.(\d+)\.(\d+)([a-z])?$").expect("static regex");
}

pub const NONCE_LENGTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHeaders {
    pub os: String,
    pub version: String,
    pub port: u16,
    pub height: u64,
    pub nethash: String,
    pub broadhash: String,
    pub nonce: String,
}

pub fn random_nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(NONCE_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Exact,
    Caret,
    Tilde,
    AtLeast,
}

type Triple = (u64, u64, u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRequirement {
    operator: Operator,
    version: Triple,
    build: Option<char>,
}

fn triple(captures: &regex::Captures, first: usize) -> Option<Triple> {
    Some((
        captures.get(first)?.as_str().parse().ok()?,
        captures.get(first + 1)?.as_str().parse().ok()?,
        captures.get(first + 2)?.as_str().parse().ok()?,
    ))
}

fn build_char(captures: &regex::Captures, index: usize) -> Option<char> {
    captures.get(index).and_then(|m| m.as_str().chars().next())
}

impl VersionRequirement {
    pub fn parse(requirement: &str) -> Option<Self> {
        let captures = REQUIREMENT.captures(requirement.trim())?;
        let operator = match captures.get(1).map(|m| m.as_str()) {
            None => Operator::Exact,
            Some("^") => Operator::Caret,
            Some("~") => Operator::Tilde,
            Some(_) => Operator::AtLeast,
        };
        Some(Self {
            operator,
            version: triple(&captures, 2)?,
            build: build_char(&captures, 5),
        })
    }

    /// A build letter on the requirement pins peers carrying a letter to the
    /// exact version and letter; otherwise plain semver range rules apply.
    pub fn matches(&self, version: &str) -> bool {
        let Some(captures) = VERSION.captures(version.trim()) else {
            return false;
        };
        let Some(candidate) = triple(&captures, 1) else {
            return false;
        };
        let build = build_char(&captures, 4);

        if let (Some(required), Some(actual)) = (self.build, build) {
            return candidate == self.version && required == actual;
        }

        let (major, minor, patch) = self.version;
        let upper = match self.operator {
            Operator::Exact => return candidate == self.version,
            Operator::AtLeast => return candidate >= self.version,
            Operator::Tilde => (major, minor + 1, 0),
            Operator::Caret if major > 0 => (major + 1, 0, 0),
            Operator::Caret if minor > 0 => (0, minor + 1, 0),
            Operator::Caret => (0, 0, patch + 1),
        };
        candidate >= self.version && candidate < upper
    }
}

/// Fee schedule entry in force at a height, with the span it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeeInfo {
    pub from_height: u64,
    pub to_height: Option<u64>,
    pub height: u64,
    pub fees: FeeMilestone,
}

pub struct SystemInfo {
    headers: RwLock<NodeHeaders>,
    spec: ChainSpec,
}

impl SystemInfo {
    pub fn new(headers: NodeHeaders, spec: ChainSpec) -> Self {
        Self {
            headers: RwLock::new(headers),
            spec,
        }
    }

    /// Headers for a fresh node on `spec`: random nonce, genesis payload hash as nethash.
    pub fn for_spec(spec: &ChainSpec, version: &str, port: u16) -> Self {
        let genesis = &spec.genesis_block.header;
        let headers = NodeHeaders {
            os: std::env::consts::OS.to_string(),
            version: version.to_string(),
            port,
            height: 0,
            nethash: hex::encode(genesis.payload_hash),
            broadhash: genesis.id.clone(),
            nonce: random_nonce(),
        };
        Self::new(headers, spec.clone())
    }

    pub fn headers(&self) -> NodeHeaders {
        self.headers.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn nonce(&self) -> String {
        self.headers().nonce
    }

    pub fn height(&self) -> u64 {
        self.headers().height
    }

    pub fn update(&self, last_block: &BlockHeader) {
        let mut headers = self.headers.write().unwrap_or_else(PoisonError::into_inner);
        headers.height = last_block.height;
        headers.broadhash = last_block.id.clone();
        trace!(height = headers.height, broadhash = %headers.broadhash, "Updated node headers");
    }

    pub fn min_version(&self, height: Option<u64>) -> Option<String> {
        let height = height.unwrap_or_else(|| self.height());
        self.spec.min_version_at(height).map(str::to_string)
    }

    pub fn version_compatible(&self, version: &str) -> bool {
        let Some(requirement) = self.min_version(None) else {
            return true;
        };
        match VersionRequirement::parse(&requirement) {
            Some(requirement) => requirement.matches(version),
            None => {
                warn!(%requirement, "Unparseable minimum version");
                false
            }
        }
    }

    pub fn network_compatible(&self, nethash: &str) -> bool {
        self.headers().nethash == nethash
    }

    pub fn get_fees(&self, height: Option<u64>) -> Option<FeeInfo> {
        let height = height.unwrap_or_else(|| self.height());
        let fees = &self.spec.fees;
        let index = fees.iter().rposition(|milestone| milestone.height <= height)?;
        Some(FeeInfo {
            from_height: fees[index].height,
            to_height: fees.get(index + 1).map(|next| next.height - 1),
            height,
            fees: fees[index].clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{VersionMilestone, DEV};

    fn system() -> SystemInfo {
        let mut spec = DEV.clone();
        spec.min_version = [(1, "^0.1.0"), (2, "^0.1.2"), (3, "^0.1.3"), (11, "0.1.4b")]
            .into_iter()
            .map(|(height, version)| VersionMilestone {
                height,
                version: version.to_string(),
            })
            .collect();
        spec.fees = [(1, 1), (2, 2), (3, 3), (40, 4)]
            .into_iter()
            .map(|(height, send)| FeeMilestone {
                height,
                send,
                multisignature: send * 10,
            })
            .collect();
        SystemInfo::for_spec(&spec, "0.1.3", 5555)
    }

    fn at_height(system: &SystemInfo, height: u64) {
        system.update(&BlockHeader {
            id: format!("{height}"),
            height,
            ..DEV.genesis_block.header.clone()
        });
    }

    #[test]
    fn min_version_follows_height() {
        let system = system();
        assert_eq!(system.min_version(Some(1)).as_deref(), Some("^0.1.0"));
        assert_eq!(system.min_version(Some(2)).as_deref(), Some("^0.1.2"));
        assert_eq!(system.min_version(Some(10)).as_deref(), Some("^0.1.3"));
    }

    #[test]
    fn caret_ranges_accept_build_letters() {
        let system = system();
        at_height(&system, 2);
        assert!(system.version_compatible("0.1.2"));
        assert!(!system.version_compatible("0.1.1"));
        assert!(system.version_compatible("0.1.3"));
        assert!(system.version_compatible("0.1.3a"));
        assert!(!system.version_compatible("0.2.0"));
        assert!(!system.version_compatible("not-a-version"));
    }

    #[test]
    fn lettered_minimum_pins_letter() {
        let system = system();
        at_height(&system, 11);
        assert!(system.version_compatible("0.1.4b"));
        assert!(system.version_compatible("0.1.4"));
        assert!(!system.version_compatible("0.1.4a"));
        assert!(!system.version_compatible("0.1.5b"));
    }

    #[test]
    fn update_sets_height_and_broadhash() {
        let system = system();
        at_height(&system, 7);
        let headers = system.headers();
        assert_eq!((headers.height, headers.broadhash.as_str()), (7, "7"));
        assert_eq!(headers.nonce.len(), NONCE_LENGTH);
        assert!(system.network_compatible(&headers.nethash));
        assert!(!system.network_compatible("balallaa"));
    }

    #[test]
    fn fee_spans() {
        let system = system();
        let at = |height| system.get_fees(Some(height)).unwrap();
        assert_eq!((at(1).from_height, at(1).to_height), (1, Some(1)));
        assert_eq!((at(2).from_height, at(2).to_height), (2, Some(2)));
        let later = at(30);
        assert_eq!((later.from_height, later.to_height, later.height), (3, Some(39), 30));
        assert_eq!(later.fees.send, 3);
        assert_eq!(at(100).to_height, None);
        assert!(system.get_fees(Some(0)).is_none());
    }

    #[test]
    fn tilde_and_lower_bound_requirements() {
        let tilde = VersionRequirement::parse("~1.2.3").unwrap();
        assert!(tilde.matches("1.2.9"));
        assert!(!tilde.matches("1.3.0"));
        let floor = VersionRequirement::parse(">=1.0.0").unwrap();
        assert!(floor.matches("7.0.0"));
        assert!(!floor.matches("0.9.9"));
        assert!(VersionRequirement::parse("^x").is_none());
    }
}
