//! Peer registry: owns the address pool and the ordered list of peer records.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use log::debug;

use crate::identity::{KeyError, Keypair, PresharedKey, PrivateKey, PublicKey};
use crate::pool::{AddressPool, AddressSpace, PoolError};

/// Peer role, fixed when the peer is created. A router is reachable at an
/// external endpoint and may announce routes into the overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerRole {
    Plain,
    Router {
        endpoint: Ipv4Addr,
        routes: Vec<Ipv4Net>,
    },
}

impl PeerRole {
    pub fn is_router(&self) -> bool {
        matches!(self, PeerRole::Router { .. })
    }

    pub fn endpoint(&self) -> Option<Ipv4Addr> {
        match self {
            PeerRole::Router { endpoint, .. } => Some(*endpoint),
            PeerRole::Plain => None,
        }
    }

    pub fn routes(&self) -> &[Ipv4Net] {
        match self {
            PeerRole::Router { routes, .. } => routes,
            PeerRole::Plain => &[],
        }
    }
}

/// One overlay participant. The private key is absent when only the remote
/// side's public key is known.
#[derive(Debug, Clone)]
pub struct Peer {
    address: Ipv4Addr,
    public_key: PublicKey,
    private_key: Option<PrivateKey>,
    preshared_key: Option<PresharedKey>,
    name: Option<String>,
    role: PeerRole,
}

impl Peer {
    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    pub fn preshared_key(&self) -> Option<&PresharedKey> {
        self.preshared_key.as_ref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn role(&self) -> &PeerRole {
        &self.role
    }

    pub fn is_router(&self) -> bool {
        self.role.is_router()
    }

    pub fn endpoint(&self) -> Option<Ipv4Addr> {
        self.role.endpoint()
    }
}

/// Arguments for [`PeerRegistry::add_peer`]. Everything is optional; the
/// defaults produce a plain peer on the next free address with a fresh
/// keypair.
///
/// `routes` only takes effect together with `endpoint` (routers announce
/// routes; plain peers have none).
#[derive(Debug, Default)]
pub struct NewPeer {
    pub address: Option<Ipv4Addr>,
    pub endpoint: Option<Ipv4Addr>,
    pub routes: Vec<Ipv4Net>,
    pub private_key: Option<PrivateKey>,
    pub public_key: Option<PublicKey>,
    pub preshared_key: Option<PresharedKey>,
    pub name: Option<String>,
}

impl NewPeer {
    /// A router reachable at `endpoint`, everything else defaulted.
    pub fn router(endpoint: Ipv4Addr) -> Self {
        NewPeer {
            endpoint: Some(endpoint),
            ..NewPeer::default()
        }
    }
}

/// The aggregate: one address pool plus peer records in insertion order.
/// Single-writer; callers serialize access to an instance.
#[derive(Debug)]
pub struct PeerRegistry {
    pool: AddressPool,
    peers: Vec<Peer>,
}

impl PeerRegistry {
    pub fn new(space: AddressSpace) -> Self {
        Self {
            pool: AddressPool::new(space),
            peers: Vec::new(),
        }
    }

    /// New registry seeded with one router peer at `endpoint`.
    pub fn with_seed_router(
        space: AddressSpace,
        endpoint: Ipv4Addr,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new(space);
        registry.add_peer(NewPeer::router(endpoint))?;
        Ok(registry)
    }

    /// Add a peer: resolve its identity, allocate its address, fix its role.
    ///
    /// Identity resolution happens before the pool is touched, so a
    /// [`KeyError::Mismatch`] consumes no address and leaves the peer list
    /// unchanged.
    pub fn add_peer(&mut self, new: NewPeer) -> Result<&Peer, RegistryError> {
        let (public_key, private_key) = match (new.private_key, new.public_key) {
            (Some(private), Some(public)) => {
                if private.public_key() != public {
                    return Err(KeyError::Mismatch.into());
                }
                (public, Some(private))
            }
            (Some(private), None) => (private.public_key(), Some(private)),
            (None, Some(public)) => (public, None),
            (None, None) => {
                let (private, public) = Keypair::generate().into_parts();
                (public, Some(private))
            }
        };

        if let Some(addr) = new.address {
            if self.pool.is_allocated(addr) {
                return Err(RegistryError::AddressAlreadyAllocated(addr));
            }
        }
        let address = self.pool.allocate(new.address)?;

        let role = match new.endpoint {
            Some(endpoint) => PeerRole::Router {
                endpoint,
                routes: new.routes,
            },
            None => PeerRole::Plain,
        };
        debug!(
            "added {} {address}",
            if role.is_router() { "router" } else { "peer" }
        );

        self.peers.push(Peer {
            address,
            public_key,
            private_key,
            preshared_key: new.preshared_key,
            name: new.name,
            role,
        });
        Ok(&self.peers[self.peers.len() - 1])
    }

    /// Remove a peer and release its address back to the pool.
    ///
    /// With `None`, removes the most recently added peer (LIFO).
    pub fn remove_peer(&mut self, address: Option<Ipv4Addr>) -> Result<Peer, RegistryError> {
        let idx = match address {
            Some(addr) => self
                .peers
                .iter()
                .position(|p| p.address == addr)
                .ok_or(RegistryError::PeerNotFound(addr))?,
            None => {
                if self.peers.is_empty() {
                    return Err(RegistryError::NoPeers);
                }
                self.peers.len() - 1
            }
        };
        self.pool.release(Some(self.peers[idx].address))?;
        let peer = self.peers.remove(idx);
        debug!("removed peer {}", peer.address);
        Ok(peer)
    }

    /// Endpoints of all router peers, in insertion order.
    pub fn endpoints(&self) -> Vec<Ipv4Addr> {
        self.peers.iter().filter_map(|p| p.endpoint()).collect()
    }

    pub fn peer(&self, address: Ipv4Addr) -> Option<&Peer> {
        self.peers.iter().find(|p| p.address == address)
    }

    /// Peers in insertion order.
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn pool(&self) -> &AddressPool {
        &self.pool
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("address {0} is already allocated")]
    AddressAlreadyAllocated(Ipv4Addr),
    #[error("no peer with address {0}")]
    PeerNotFound(Ipv4Addr),
    #[error("registry has no peers")]
    NoPeers,
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Key(#[from] KeyError),
}
