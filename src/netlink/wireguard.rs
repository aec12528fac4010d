mod interface;
mod peer;

pub use interface::*;
pub use peer::*;

use futures::StreamExt;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST};
use netlink_packet_generic::GenlMessage;
use netlink_packet_wireguard::{nlas::WgDeviceAttrs, Wireguard, WireguardCmd};

use super::{Netlink, NetlinkError};

#[derive(Debug, Clone)]
pub enum WireguardInterfaceId {
    Name(String),
    Index(u32),
}

impl From<WireguardInterfaceId> for WgDeviceAttrs {
    fn from(id: WireguardInterfaceId) -> Self {
        match id {
            WireguardInterfaceId::Name(name) => WgDeviceAttrs::IfName(name),
            WireguardInterfaceId::Index(index) => WgDeviceAttrs::IfIndex(index),
        }
    }
}

impl Netlink {
    pub async fn wg_interface(
        &mut self,
        id: WireguardInterfaceId,
    ) -> Result<Interface, NetlinkError> {
        let genlmsg: GenlMessage<Wireguard> = GenlMessage::from_payload(Wireguard {
            cmd: WireguardCmd::GetDevice,
            nlas: vec![id.into()],
        });

        let mut nlmsg = NetlinkMessage::from(genlmsg);
        nlmsg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;
        let mut responses = self.generic.request(nlmsg).await?;

        // large peer lists arrive split over several messages
        let mut result: Option<Interface> = None;
        while let Some(message) = responses.next().await {
            let resp = message?;
            match resp.payload {
                NetlinkPayload::InnerMessage(genlmsg) => {
                    let part = Interface::from(genlmsg.payload);
                    match result.as_mut() {
                        Some(iface) => iface.peers.extend(part.peers),
                        None => result = Some(part),
                    }
                }
                NetlinkPayload::Error(err) => return Err(NetlinkError::from(err.code)),
                _ => {}
            }
        }

        result.ok_or(NetlinkError::UnexpectedResponse)
    }
}
