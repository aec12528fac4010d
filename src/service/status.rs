use tracing::instrument;

use super::{Controller, ServiceError};
use crate::{
    allocator::PoolUsage,
    netlink::{
        drift::{self, Drift},
        wireguard::WireguardInterfaceId,
        Netlink,
    },
};

impl Controller {
    #[instrument(skip(self))]
    pub async fn usage(&self) -> Result<PoolUsage, ServiceError> {
        let used = self
            .store
            .list_all_host_numbers(&self.settings.interface, &self.pool)
            .await?;

        Ok(self.pool.usage(&used))
    }

    /// Compares the declared active peers with what the kernel interface
    /// currently holds.
    #[instrument(skip(self))]
    pub async fn inspect(&self) -> Result<Drift, ServiceError> {
        let _shared = self.shared.lock().await;

        let declared = self
            .store
            .list_active_peers(&self.settings.interface)
            .await?;
        let mut netlink = Netlink::new()?;
        let live = netlink
            .wg_interface(WireguardInterfaceId::Name(self.settings.interface.clone()))
            .await?;

        Ok(drift::compare(&declared, &live))
    }
}
