use netlink_packet_wireguard::{constants::WG_KEY_LEN, nlas::WgDeviceAttrs, Wireguard};

use super::LivePeer;

/// Snapshot of a running interface. The private key is dropped on parse.
#[derive(Debug, Default)]
pub struct Interface {
    pub index: u32,
    pub name: String,
    pub public_key: [u8; WG_KEY_LEN],
    pub listen_port: u16,
    pub peers: Vec<LivePeer>,
}

impl From<Wireguard> for Interface {
    fn from(wg: Wireguard) -> Self {
        let mut res = Self::default();
        for nla in wg.nlas {
            match nla {
                WgDeviceAttrs::IfIndex(v) => res.index = v,
                WgDeviceAttrs::IfName(v) => res.name = v,
                WgDeviceAttrs::PublicKey(pk) => res.public_key = pk,
                WgDeviceAttrs::ListenPort(v) => res.listen_port = v,
                WgDeviceAttrs::Peers(peers) => {
                    res.peers = peers.into_iter().map(|p| LivePeer::from(p.0)).collect()
                }
                _ => (),
            }
        }
        res
    }
}
