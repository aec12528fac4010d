use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::{Controller, ServiceError};
use crate::{
    allocator::{self, HostAddress},
    keys,
    reconcile::Reconciled,
    render,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub address: HostAddress,
    pub public_key: String,
    /// Absent when the owner brought their own key.
    pub private_key: Option<String>,
    pub dns: Vec<String>,
    pub client_allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
    pub revoked: bool,
    pub created_at: OffsetDateTime,
}

impl Peer {
    pub fn identity(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    pub fn subject(&self) -> String {
        format!("peer {}", self.identity())
    }
}

/// Record handed to the store; it assigns the id and creation time.
#[derive(Debug, Clone)]
pub struct NewPeer {
    pub owner: String,
    pub name: String,
    pub address: HostAddress,
    pub public_key: String,
    pub private_key: Option<String>,
    pub dns: Vec<String>,
    pub client_allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

impl NewPeer {
    fn preview(&self) -> Peer {
        Peer {
            id: Uuid::nil(),
            owner: self.owner.clone(),
            name: self.name.clone(),
            address: self.address,
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
            dns: self.dns.clone(),
            client_allowed_ips: self.client_allowed_ips.clone(),
            persistent_keepalive: self.persistent_keepalive,
            revoked: false,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PeerRequest {
    pub owner: String,
    pub name: String,
    /// Operator-supplied public key; a key pair is generated when absent.
    pub public_key: Option<String>,
    pub dns: Vec<String>,
    pub client_allowed_ips: Vec<String>,
    pub persistent_keepalive: Option<u16>,
}

#[derive(Debug)]
pub struct CreatedPeer {
    pub peer: Peer,
    /// `None` when no private key is known to the server.
    pub client_config: Option<String>,
    pub reconciled: Reconciled,
}

fn validate_name(value: &str, what: &'static str) -> Result<String, ServiceError> {
    let value = value.trim();
    if value.is_empty() || value.chars().any(char::is_control) {
        return Err(ServiceError::InvalidName(what));
    }
    Ok(value.to_owned())
}

impl Controller {
    #[instrument(skip(self, request), fields(owner = %request.owner, name = %request.name))]
    pub async fn create_peer(&self, request: PeerRequest) -> Result<CreatedPeer, ServiceError> {
        let owner = validate_name(&request.owner, "owner")?;
        let name = validate_name(&request.name, "name")?;
        if let Some(key) = &request.public_key {
            keys::validate_public_key(key)?;
        }

        let mut exclusive = self.exclusive().await?;
        let reconciler = &mut exclusive.shared.reconciler;

        // nothing is written unless the server side can be rendered too
        reconciler.render(self.store.as_ref()).await?;

        let interface = &self.settings.interface;
        let used = self
            .store
            .list_all_host_numbers(interface, &self.pool)
            .await?;
        let address = allocator::allocate(&self.pool, &used)?;

        let (public_key, private_key) = match request.public_key {
            Some(key) => (key.trim().to_owned(), None),
            None => {
                let pair = self.keys.generate().await?;
                (pair.public_key, Some(pair.private_key))
            }
        };

        let new_peer = NewPeer {
            owner,
            name,
            address,
            public_key,
            private_key,
            dns: request.dns,
            client_allowed_ips: request.client_allowed_ips,
            persistent_keepalive: request.persistent_keepalive,
        };
        let client_config = match new_peer.private_key {
            Some(_) => Some(render::render_client(&self.settings, &new_peer.preview())?),
            None => None,
        };

        let peer = match self.store.create_peer(interface, new_peer).await {
            Ok(peer) => peer,
            Err(e) if e.is_unique_violation() => return Err(ServiceError::PeerAlreadyExists),
            Err(e) => return Err(e.into()),
        };
        info!("created peer {} ({}) at {}", peer.identity(), peer.id, peer.address);

        let mut used = used;
        if let Some(host) = self.pool.host_number(&peer.address) {
            used.insert(host);
        }
        let usage = self.pool.usage(&used);
        if usage.nearly_exhausted() {
            warn!(
                "pool {} hosts {}..={} nearly exhausted: {} of {} free",
                self.pool.network(),
                self.pool.start(),
                self.pool.end(),
                usage.free,
                usage.capacity
            );
        }

        let reconciled = match reconciler.reconcile(self.store.as_ref()).await {
            Ok(reconciled) => reconciled,
            Err(source) if source.is_divergent() => {
                return Err(ServiceError::Diverged {
                    peer: Box::new(peer),
                    client_config,
                    source,
                })
            }
            Err(e) => {
                // the live file still holds the old peer set
                match self.store.delete_peer(interface, peer.id).await {
                    Ok(()) => info!("dropped peer {} after failed reconcile", peer.identity()),
                    Err(undo) => error!("can't drop peer {} again: {undo}", peer.id),
                }
                return Err(e.into());
            }
        };

        Ok(CreatedPeer {
            peer,
            client_config,
            reconciled,
        })
    }

    /// Flips the revocation flag and reconciles. The address stays retired
    /// either way.
    #[instrument(skip(self))]
    pub async fn set_revoked(&self, id: Uuid, revoked: bool) -> Result<Reconciled, ServiceError> {
        let mut exclusive = self.exclusive().await?;
        let interface = &self.settings.interface;

        let Some(peer) = self.store.peer(interface, id).await? else {
            return Err(ServiceError::NotFound(id));
        };
        if peer.revoked == revoked {
            info!("peer {} already has revoked = {revoked}", peer.identity());
        } else {
            self.store.set_revoked(interface, id, revoked).await?;
            info!("peer {} revoked = {revoked}", peer.identity());
        }

        match exclusive
            .shared
            .reconciler
            .reconcile(self.store.as_ref())
            .await
        {
            Ok(reconciled) => Ok(reconciled),
            Err(e) if e.is_divergent() || peer.revoked == revoked => Err(e.into()),
            Err(e) => {
                if let Err(undo) = self.store.set_revoked(interface, id, peer.revoked).await {
                    error!("can't restore revoked = {} on {}: {undo}", peer.revoked, id);
                }
                Err(e.into())
            }
        }
    }

    pub async fn revoke_peer(&self, id: Uuid) -> Result<Reconciled, ServiceError> {
        self.set_revoked(id, true).await
    }

    pub async fn restore_peer(&self, id: Uuid) -> Result<Reconciled, ServiceError> {
        self.set_revoked(id, false).await
    }

    /// Deletes every peer of `owner`; their addresses return to the pool.
    #[instrument(skip(self))]
    pub async fn remove_owner(&self, owner: &str) -> Result<(u64, Reconciled), ServiceError> {
        let mut exclusive = self.exclusive().await?;

        let removed = self
            .store
            .remove_owner(&self.settings.interface, owner)
            .await?;
        info!("removed {removed} peers of {owner}");

        let reconciled = exclusive
            .shared
            .reconciler
            .reconcile(self.store.as_ref())
            .await?;
        Ok((removed, reconciled))
    }

    #[instrument(skip(self))]
    pub async fn client_config(&self, id: Uuid) -> Result<String, ServiceError> {
        let Some(peer) = self.store.peer(&self.settings.interface, id).await? else {
            return Err(ServiceError::NotFound(id));
        };
        if peer.revoked {
            return Err(ServiceError::Revoked(id));
        }

        Ok(render::render_client(&self.settings, &peer)?)
    }

    #[instrument(skip(self))]
    pub async fn peers(&self) -> Result<Vec<Peer>, ServiceError> {
        Ok(self.store.peers(&self.settings.interface).await?)
    }
}
