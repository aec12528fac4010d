use std::{collections::BTreeMap, net::IpAddr};

use base64::{engine::general_purpose::STANDARD, Engine};
use cidr::IpCidr;
use serde::Serialize;

use super::wireguard::{Interface, LivePeer};
use crate::{keys, render, service::Peer};

/// Differences between the declared active peers and a running interface.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct Drift {
    /// Declared peers the interface does not know.
    pub missing: Vec<String>,
    /// Public keys on the interface that nobody declared.
    pub unexpected: Vec<String>,
    /// Declared peers present with different allowed IPs.
    pub mismatched: Vec<String>,
}

impl Drift {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.mismatched.is_empty()
    }
}

pub fn compare(declared: &[Peer], live: &Interface) -> Drift {
    let mut live_peers: BTreeMap<[u8; keys::KEY_LEN], &LivePeer> =
        live.peers.iter().map(|p| (p.public_key, p)).collect();
    let mut drift = Drift::default();

    for peer in render::active_sorted(declared) {
        let Ok(key) = keys::decode_key(&peer.public_key) else {
            drift.missing.push(peer.identity());
            continue;
        };

        match live_peers.remove(&key) {
            None => drift.missing.push(peer.identity()),
            Some(running) => {
                let expected = IpCidr::new_host(IpAddr::V4(peer.address.ip()));
                if running.allowed_ips != [expected] {
                    drift.mismatched.push(peer.identity());
                }
            }
        }
    }

    drift.unexpected = live_peers
        .into_keys()
        .map(|key| STANDARD.encode(key))
        .collect();

    drift
}
