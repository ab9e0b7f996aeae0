//! MeshVPN address and identity core.
//! In-memory and single-writer: no I/O; the host serializes access to a
//! registry and decides where snapshots live.

pub mod identity;
pub mod pool;
pub mod registry;
pub mod snapshot;

pub use identity::{KeyError, Keypair, PresharedKey, PrivateKey, PublicKey};
pub use pool::{AddressPool, AddressSpace, PoolError};
pub use registry::{NewPeer, Peer, PeerRegistry, PeerRole, RegistryError};
pub use snapshot::{Snapshot, SnapshotError};
