//! Read access to the running WireGuard interface over generic netlink.

pub mod drift;
pub mod error;
pub mod wireguard;

use genetlink::{new_connection, GenetlinkHandle};

use error::NetlinkError;

#[derive(Clone)]
pub struct Netlink {
    generic: GenetlinkHandle,
}

impl Netlink {
    /// Must be called inside a tokio runtime; the connection task is spawned on it.
    pub fn new() -> Result<Self, NetlinkError> {
        let (conn, handle, _) = new_connection()?;
        tokio::spawn(conn);

        Ok(Self { generic: handle })
    }
}
