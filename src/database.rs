use std::{collections::BTreeSet, str::FromStr};

use async_trait::async_trait;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::{
    allocator::{HostAddress, Pool},
    service::{NewPeer, Peer},
    traits::PeerStore,
};

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("migrate error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("invalid address data: {0}")]
    InvalidAddressData(String),
    #[error("invalid uuid data")]
    InvalidUuidData,
    #[error("invalid timestamp data")]
    InvalidTimestampData,
    #[error("peer {0} not found")]
    NotFound(Uuid),
}

impl From<uuid::Error> for DatabaseError {
    fn from(_: uuid::Error) -> Self {
        Self::InvalidUuidData
    }
}

impl DatabaseError {
    /// SQLite extended code for a UNIQUE constraint violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Sqlx(s) => {
                Some("2067") == s.as_database_error().and_then(|e| e.code()).as_deref()
            }
            _ => false,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

type Result<T> = std::result::Result<T, DatabaseError>;

const PEER_COLUMNS: &str = "id, owner, name, address, public_key, private_key, dns, \
                            client_allowed_ips, persistent_keepalive, revoked, created_at";

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect()
}

fn peer_from_row(row: &SqliteRow) -> Result<Peer> {
    let address: String = row.try_get("address")?;
    let keepalive: Option<i64> = row.try_get("persistent_keepalive")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(Peer {
        id: Uuid::from_slice(&row.try_get::<Vec<u8>, _>("id")?)?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        address: address
            .parse()
            .map_err(|_| DatabaseError::InvalidAddressData(address.clone()))?,
        public_key: row.try_get("public_key")?,
        private_key: row.try_get("private_key")?,
        dns: split_list(&row.try_get::<String, _>("dns")?),
        client_allowed_ips: split_list(&row.try_get::<String, _>("client_allowed_ips")?),
        persistent_keepalive: keepalive.and_then(|k| u16::try_from(k).ok()),
        revoked: row.try_get("revoked")?,
        created_at: OffsetDateTime::from_unix_timestamp(created_at)
            .map_err(|_| DatabaseError::InvalidTimestampData)?,
    })
}

impl Database {
    pub async fn new(connstr: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .connect_with(SqliteConnectOptions::from_str(connstr)?.create_if_missing(true))
            .await?;
        sqlx::migrate!().run(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl PeerStore for Database {
    async fn list_active_peers(&self, interface: &str) -> Result<Vec<Peer>> {
        sqlx::query(&format!(
            // sqlite
            "SELECT {PEER_COLUMNS} FROM peers
            WHERE interface = $1 AND revoked = 0
            ORDER BY owner, name, public_key"
        ))
        .bind(interface)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(peer_from_row)
        .collect()
    }

    async fn list_all_host_numbers(&self, interface: &str, pool: &Pool) -> Result<BTreeSet<u32>> {
        let rows = sqlx::query(
            // sqlite
            "SELECT address FROM peers WHERE interface = $1",
        )
        .bind(interface)
        .fetch_all(&self.pool)
        .await?;

        let mut used = BTreeSet::new();
        for row in rows {
            let address: String = row.try_get("address")?;
            let parsed: HostAddress = address
                .parse()
                .map_err(|_| DatabaseError::InvalidAddressData(address.clone()))?;
            match pool.host_number(&parsed) {
                Some(host) => {
                    used.insert(host);
                }
                None => warn!("peer address {address} lies outside {}", pool.network()),
            }
        }

        Ok(used)
    }

    async fn create_peer(&self, interface: &str, peer: NewPeer) -> Result<Peer> {
        let id = Uuid::new_v4();
        let created_at = OffsetDateTime::now_utc().unix_timestamp();
        let address = peer.address.to_string();
        let dns = peer.dns.join(",");
        let allowed_ips = peer.client_allowed_ips.join(",");

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            // sqlite
            "INSERT INTO peers(id, interface, owner, name, address, public_key, private_key,
                dns, client_allowed_ips, persistent_keepalive, revoked, created_at)
            VALUES($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, $11)",
        )
        .bind(&id.as_bytes()[..])
        .bind(interface)
        .bind(&peer.owner)
        .bind(&peer.name)
        .bind(&address)
        .bind(&peer.public_key)
        .bind(&peer.private_key)
        .bind(&dns)
        .bind(&allowed_ips)
        .bind(peer.persistent_keepalive.map(i64::from))
        .bind(created_at)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;

        Ok(Peer {
            id,
            owner: peer.owner,
            name: peer.name,
            address: peer.address,
            public_key: peer.public_key,
            private_key: peer.private_key,
            dns: peer.dns,
            client_allowed_ips: peer.client_allowed_ips,
            persistent_keepalive: peer.persistent_keepalive,
            revoked: false,
            created_at: OffsetDateTime::from_unix_timestamp(created_at)
                .map_err(|_| DatabaseError::InvalidTimestampData)?,
        })
    }

    async fn set_revoked(&self, interface: &str, id: Uuid, revoked: bool) -> Result<()> {
        let result = sqlx::query(
            // sqlite
            "UPDATE peers
            SET revoked = $3
            WHERE id = $1 AND interface = $2",
        )
        .bind(&id.as_bytes()[..])
        .bind(interface)
        .bind(revoked)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(id));
        }
        Ok(())
    }

    async fn peer(&self, interface: &str, id: Uuid) -> Result<Option<Peer>> {
        sqlx::query(&format!(
            // sqlite
            "SELECT {PEER_COLUMNS} FROM peers WHERE id = $1 AND interface = $2"
        ))
        .bind(&id.as_bytes()[..])
        .bind(interface)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(peer_from_row)
        .transpose()
    }

    async fn delete_peer(&self, interface: &str, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            // sqlite
            "DELETE FROM peers WHERE id = $1 AND interface = $2",
        )
        .bind(&id.as_bytes()[..])
        .bind(interface)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(id));
        }
        Ok(())
    }

    async fn peers(&self, interface: &str) -> Result<Vec<Peer>> {
        sqlx::query(&format!(
            // sqlite
            "SELECT {PEER_COLUMNS} FROM peers
            WHERE interface = $1
            ORDER BY owner, name, public_key"
        ))
        .bind(interface)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(peer_from_row)
        .collect()
    }

    async fn remove_owner(&self, interface: &str, owner: &str) -> Result<u64> {
        Ok(sqlx::query(
            // sqlite
            "DELETE FROM peers WHERE interface = $1 AND owner = $2",
        )
        .bind(interface)
        .bind(owner)
        .execute(&self.pool)
        .await?
        .rows_affected())
    }
}
