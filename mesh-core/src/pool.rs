//! Address pool: a CIDR block's usable hosts partitioned into allocated and
//! unallocated ordered sets.
//!
//! Both sets are `BTreeSet`s, so default selection (smallest unallocated on
//! allocate, largest allocated on release) and in-order enumeration are
//! O(log n) / O(n) with no re-sorting. Every operation either fully succeeds
//! or leaves both sets unchanged.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnet::Ipv4Net;
use log::debug;

/// Immutable CIDR block defining a usable host range. Network and broadcast
/// addresses are excluded for prefixes shorter than /31.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSpace(Ipv4Net);

impl AddressSpace {
    /// Wrap a network, normalizing away any host bits.
    pub fn new(net: Ipv4Net) -> Self {
        AddressSpace(net.trunc())
    }

    pub fn network(&self) -> Ipv4Net {
        self.0
    }

    /// Iterator over the usable host addresses, ascending.
    pub fn hosts(&self) -> ipnet::Ipv4AddrRange {
        self.0.hosts()
    }

    /// Number of usable host addresses.
    pub fn host_count(&self) -> usize {
        match self.0.prefix_len() {
            32 => 1,
            31 => 2,
            p => ((1u64 << (32 - u32::from(p))) - 2) as usize,
        }
    }

    /// Whether `addr` falls in the usable host range.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        if !self.0.contains(&addr) {
            return false;
        }
        if self.0.prefix_len() >= 31 {
            return true;
        }
        addr != self.0.network() && addr != self.0.broadcast()
    }
}

impl FromStr for AddressSpace {
    type Err = PoolError;
    fn from_str(s: &str) -> Result<Self, PoolError> {
        let net: Ipv4Net = s
            .parse()
            .map_err(|e| PoolError::InvalidAddressSpace(format!("{s}: {e}")))?;
        Ok(AddressSpace::new(net))
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Partition of an address space's hosts into allocated and unallocated sets.
///
/// Invariants after every operation: the sets are disjoint, their union is the
/// full usable host range, and their combined size never changes.
pub struct AddressPool {
    space: AddressSpace,
    allocated: BTreeSet<Ipv4Addr>,
    unallocated: BTreeSet<Ipv4Addr>,
}

impl AddressPool {
    /// New pool with every usable host unallocated.
    pub fn new(space: AddressSpace) -> Self {
        Self {
            space,
            allocated: BTreeSet::new(),
            unallocated: space.hosts().collect(),
        }
    }

    /// New pool with the first `reserved` hosts (ascending) pre-allocated.
    pub fn with_reserved(space: AddressSpace, reserved: usize) -> Result<Self, PoolError> {
        let mut pool = Self::new(space);
        if reserved > pool.unallocated.len() {
            return Err(PoolError::InvalidAddressSpace(format!(
                "reserved count {reserved} exceeds {} usable hosts in {space}",
                pool.unallocated.len()
            )));
        }
        for _ in 0..reserved {
            pool.allocate(None)?;
        }
        Ok(pool)
    }

    pub fn space(&self) -> &AddressSpace {
        &self.space
    }

    /// Move an address from unallocated to allocated and return it.
    ///
    /// With `None`, picks the numerically smallest unallocated address and
    /// fails with [`PoolError::Exhausted`] when none remain. An explicit
    /// address that is out of range or already allocated fails with
    /// [`PoolError::Unavailable`].
    pub fn allocate(&mut self, address: Option<Ipv4Addr>) -> Result<Ipv4Addr, PoolError> {
        let address = match address {
            Some(addr) => {
                if !self.unallocated.remove(&addr) {
                    return Err(PoolError::Unavailable(addr));
                }
                addr
            }
            None => {
                let addr = self
                    .unallocated
                    .iter()
                    .next()
                    .copied()
                    .ok_or(PoolError::Exhausted)?;
                self.unallocated.remove(&addr);
                addr
            }
        };
        self.allocated.insert(address);
        debug!("allocated {address} from {}", self.space);
        Ok(address)
    }

    /// Move an address from allocated back to unallocated and return it.
    ///
    /// With `None`, picks the numerically largest allocated address and fails
    /// with [`PoolError::NoneAllocated`] when nothing is allocated. An
    /// explicit address that is not currently allocated fails with
    /// [`PoolError::NotAllocated`].
    pub fn release(&mut self, address: Option<Ipv4Addr>) -> Result<Ipv4Addr, PoolError> {
        let address = match address {
            Some(addr) => {
                if !self.allocated.remove(&addr) {
                    return Err(PoolError::NotAllocated(addr));
                }
                addr
            }
            None => {
                let addr = self
                    .allocated
                    .iter()
                    .next_back()
                    .copied()
                    .ok_or(PoolError::NoneAllocated)?;
                self.allocated.remove(&addr);
                addr
            }
        };
        self.unallocated.insert(address);
        debug!("released {address} to {}", self.space);
        Ok(address)
    }

    pub fn is_allocated(&self, addr: Ipv4Addr) -> bool {
        self.allocated.contains(&addr)
    }

    pub fn is_unallocated(&self, addr: Ipv4Addr) -> bool {
        self.unallocated.contains(&addr)
    }

    /// Allocated addresses, ascending.
    pub fn allocated(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.allocated.iter().copied()
    }

    /// Unallocated addresses, ascending.
    pub fn unallocated(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.unallocated.iter().copied()
    }

    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }

    pub fn unallocated_count(&self) -> usize {
        self.unallocated.len()
    }

    /// Total usable hosts. Constant for the pool's lifetime.
    pub fn capacity(&self) -> usize {
        self.allocated.len() + self.unallocated.len()
    }
}

impl fmt::Debug for AddressPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressPool")
            .field("space", &self.space)
            .field("allocated", &self.allocated.len())
            .field("unallocated", &self.unallocated.len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid address space: {0}")]
    InvalidAddressSpace(String),
    #[error("address pool exhausted")]
    Exhausted,
    #[error("no allocated addresses")]
    NoneAllocated,
    #[error("address {0} is not available")]
    Unavailable(Ipv4Addr),
    #[error("address {0} is not allocated")]
    NotAllocated(Ipv4Addr),
}
