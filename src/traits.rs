use std::collections::BTreeSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    allocator::Pool,
    database::DatabaseError,
    service::{NewPeer, Peer},
};

/// Durable peer records. Every call is scoped to one interface; the controller
/// serializes writers per interface.
#[async_trait]
pub trait PeerStore: Sync + Send {
    async fn list_active_peers(&self, interface: &str) -> Result<Vec<Peer>, DatabaseError>;
    /// Host numbers of every peer on the interface, revoked ones included.
    async fn list_all_host_numbers(
        &self,
        interface: &str,
        pool: &Pool,
    ) -> Result<BTreeSet<u32>, DatabaseError>;
    async fn create_peer(&self, interface: &str, peer: NewPeer) -> Result<Peer, DatabaseError>;
    /// `NotFound` when `id` is not a peer of `interface`.
    async fn set_revoked(
        &self,
        interface: &str,
        id: Uuid,
        revoked: bool,
    ) -> Result<(), DatabaseError>;
    /// `None` for unknown ids and for peers of other interfaces.
    async fn peer(&self, interface: &str, id: Uuid) -> Result<Option<Peer>, DatabaseError>;
    /// Deletes one peer. `NotFound` when `id` is not a peer of `interface`.
    async fn delete_peer(&self, interface: &str, id: Uuid) -> Result<(), DatabaseError>;
    async fn peers(&self, interface: &str) -> Result<Vec<Peer>, DatabaseError>;
    /// Deletes every peer of `owner`, returning how many went away.
    async fn remove_owner(&self, interface: &str, owner: &str) -> Result<u64, DatabaseError>;
}
