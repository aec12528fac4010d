use std::{net::SocketAddr, time::SystemTime};

use cidr::IpCidr;
use netlink_packet_wireguard::{
    constants::WG_KEY_LEN,
    nlas::{WgAllowedIp, WgAllowedIpAttrs, WgPeerAttrs},
};

/// A peer as the kernel currently holds it.
#[derive(Debug, Clone)]
pub struct LivePeer {
    pub public_key: [u8; WG_KEY_LEN],
    pub allowed_ips: Vec<IpCidr>,
    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<SystemTime>,
    pub rx: u64,
    pub tx: u64,
}

fn allowed_ip(entry: &WgAllowedIp) -> Option<IpCidr> {
    let mut addr = None;
    let mut len = None;
    for attr in entry.iter() {
        match attr {
            WgAllowedIpAttrs::IpAddr(a) => addr = Some(*a),
            WgAllowedIpAttrs::Cidr(c) => len = Some(*c),
            _ => {}
        }
    }

    IpCidr::new(addr?, len?).ok()
}

impl From<Vec<WgPeerAttrs>> for LivePeer {
    fn from(nlas: Vec<WgPeerAttrs>) -> Self {
        let mut res = Self {
            public_key: [0; WG_KEY_LEN],
            allowed_ips: Vec::new(),
            endpoint: None,
            last_handshake: None,
            rx: 0,
            tx: 0,
        };

        for nla in nlas {
            match nla {
                WgPeerAttrs::PublicKey(k) => res.public_key = k,
                WgPeerAttrs::Endpoint(v) => res.endpoint = Some(v),
                // the kernel reports the epoch for peers that never shook hands
                WgPeerAttrs::LastHandshake(v) if v > SystemTime::UNIX_EPOCH => {
                    res.last_handshake = Some(v)
                }
                WgPeerAttrs::RxBytes(v) => res.rx = v,
                WgPeerAttrs::TxBytes(v) => res.tx = v,
                WgPeerAttrs::AllowedIps(entries) => {
                    res.allowed_ips = entries.iter().filter_map(allowed_ip).collect()
                }
                _ => {}
            }
        }
        res
    }
}
