use std::{collections::BTreeSet, fmt, net::Ipv4Addr, str::FromStr};

use cidr::Ipv4Cidr;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("ip pool exhausted: every host in {start}..={end} is taken, expand the pool")]
    PoolExhausted { start: u32, end: u32 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool host {host} does not fit into {network}")]
    OutOfNetwork { host: u32, network: Ipv4Cidr },
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid host address `{0}`, expected a.b.c.d or a.b.c.d/32")]
pub struct AddressParseError(pub String);

/// Single host address of a peer. Always rendered with a `/32` mask, so the
/// same literal ends up in the store, the server config and the client config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostAddress(Ipv4Addr);

impl HostAddress {
    pub fn new(addr: Ipv4Addr) -> Self {
        Self(addr)
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.0
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/32", self.0)
    }
}

impl FromStr for HostAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let ip = match trimmed.split_once('/') {
            Some((ip, "32")) => ip,
            Some(_) => return Err(AddressParseError(s.to_owned())),
            None => trimmed,
        };

        ip.parse()
            .map(Self)
            .map_err(|_| AddressParseError(s.to_owned()))
    }
}

/// Contiguous range of allocatable host numbers inside a base network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pool {
    network: Ipv4Cidr,
    start: u32,
    end: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub capacity: u32,
    pub used: u32,
    pub free: u32,
}

impl PoolUsage {
    /// True once no more than a tenth of the pool is left.
    pub fn nearly_exhausted(&self) -> bool {
        self.capacity > 0 && u64::from(self.free) * 10 <= u64::from(self.capacity)
    }
}

impl Pool {
    /// `start > end` is accepted and yields an empty pool.
    pub fn new(network: Ipv4Cidr, start: u32, end: u32) -> Result<Self, PoolError> {
        let size = 1u64 << (32 - u32::from(network.network_length()));
        if start <= end && u64::from(end) >= size {
            return Err(PoolError::OutOfNetwork { host: end, network });
        }

        Ok(Self {
            network,
            start,
            end,
        })
    }

    pub fn network(&self) -> Ipv4Cidr {
        self.network
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn capacity(&self) -> u32 {
        if self.start > self.end {
            0
        } else {
            self.end - self.start + 1
        }
    }

    pub fn address(&self, host: u32) -> HostAddress {
        let base = u32::from(self.network.first_address());
        HostAddress(Ipv4Addr::from(base.wrapping_add(host)))
    }

    /// Offset of `addr` from the base network, regardless of the pool range.
    pub fn host_number(&self, addr: &HostAddress) -> Option<u32> {
        if !self.network.contains(&addr.0) {
            return None;
        }

        Some(u32::from(addr.0) - u32::from(self.network.first_address()))
    }

    pub fn contains_host(&self, host: u32) -> bool {
        self.start <= host && host <= self.end
    }

    pub fn usage(&self, used: &BTreeSet<u32>) -> PoolUsage {
        let capacity = self.capacity();
        let taken = if capacity == 0 {
            0
        } else {
            used.range(self.start..=self.end).count() as u32
        };

        PoolUsage {
            capacity,
            used: taken,
            free: capacity - taken,
        }
    }
}

/// Lowest free host of the pool. The caller must hold the snapshot of `used`
/// under the same lock it later writes the new peer with.
pub fn allocate(pool: &Pool, used: &BTreeSet<u32>) -> Result<HostAddress, AllocError> {
    if pool.start > pool.end {
        return Err(AllocError::PoolExhausted {
            start: pool.start,
            end: pool.end,
        });
    }

    (pool.start..=pool.end)
        .find(|host| !used.contains(host))
        .map(|host| pool.address(host))
        .ok_or(AllocError::PoolExhausted {
            start: pool.start,
            end: pool.end,
        })
}
