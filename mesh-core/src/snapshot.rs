//! Registry snapshots: JSON with peers plus a pool summary, and an opt-in
//! sealed section for key material.
//!
//! The base snapshot carries no keys; restoring it generates fresh
//! identities. Sealing with a caller-supplied secret adds an `identities`
//! array where private and preshared keys are encrypted at rest
//! (ChaCha20-Poly1305, random nonce prepended) and public keys ride in the
//! clear.

use std::net::Ipv4Addr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use ipnet::Ipv4Net;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::identity::{PresharedKey, PrivateKey, PublicKey, KEY_LEN};
use crate::registry::{NewPeer, Peer, PeerRegistry, RegistryError};

const SEAL_CONTEXT: &[u8] = b"mesh-seal-v1";
const NONCE_LEN: usize = 12;

/// Serialized form of a registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub peers: Vec<PeerSnapshot>,
    pub pool: PoolSnapshot,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<IdentitySnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub address: Ipv4Addr,
    pub endpoint: Option<Ipv4Addr>,
    pub is_router: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Ipv4Net>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub address_space: Ipv4Net,
    pub unallocated_addresses_amount: usize,
}

/// Per-peer key material: public key in the clear, secrets sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    pub address: Ipv4Addr,
    pub public_key: PublicKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
}

impl Snapshot {
    /// Capture a registry without key material.
    pub fn capture(registry: &PeerRegistry) -> Self {
        Snapshot {
            peers: registry.peers().iter().map(PeerSnapshot::from_peer).collect(),
            pool: PoolSnapshot {
                address_space: registry.pool().space().network(),
                unallocated_addresses_amount: registry.pool().unallocated_count(),
            },
            identities: Vec::new(),
        }
    }

    /// Capture a registry including sealed identities.
    pub fn capture_sealed(registry: &PeerRegistry, secret: &[u8]) -> Result<Self, SnapshotError> {
        let key = seal_key(secret);
        let mut snapshot = Self::capture(registry);
        snapshot.identities = registry
            .peers()
            .iter()
            .map(|peer| {
                Ok(IdentitySnapshot {
                    address: peer.address(),
                    public_key: *peer.public_key(),
                    private_key: peer
                        .private_key()
                        .map(|k| seal(&key, k.as_bytes()))
                        .transpose()?,
                    preshared_key: peer
                        .preshared_key()
                        .map(|k| seal(&key, k.as_bytes()))
                        .transpose()?,
                })
            })
            .collect::<Result<_, SnapshotError>>()?;
        Ok(snapshot)
    }

    /// Rebuild a registry by replaying `add_peer` in array order. Identities
    /// are regenerated; use [`Snapshot::restore_sealed`] to recover them.
    pub fn restore(&self) -> Result<PeerRegistry, SnapshotError> {
        self.restore_inner(None)
    }

    /// Rebuild a registry, unsealing key material with `secret`.
    pub fn restore_sealed(&self, secret: &[u8]) -> Result<PeerRegistry, SnapshotError> {
        self.restore_inner(Some(seal_key(secret)))
    }

    fn restore_inner(&self, key: Option<[u8; KEY_LEN]>) -> Result<PeerRegistry, SnapshotError> {
        let space = crate::pool::AddressSpace::new(self.pool.address_space);
        let mut registry = PeerRegistry::new(space);
        for peer in &self.peers {
            if peer.is_router != peer.endpoint.is_some() {
                return Err(SnapshotError::RoleMismatch(peer.address));
            }
            let mut new = NewPeer {
                address: Some(peer.address),
                endpoint: peer.endpoint,
                routes: peer.routes.clone(),
                name: peer.name.clone(),
                ..NewPeer::default()
            };
            if let Some(identity) = self.identities.iter().find(|i| i.address == peer.address) {
                new.public_key = Some(identity.public_key);
                if let Some(key) = &key {
                    if let Some(sealed) = &identity.private_key {
                        new.private_key = Some(PrivateKey::from_bytes(unseal(key, sealed)?));
                    }
                    if let Some(sealed) = &identity.preshared_key {
                        new.preshared_key = Some(PresharedKey::from_bytes(unseal(key, sealed)?));
                    }
                }
            }
            registry.add_peer(new)?;
        }
        let actual = registry.pool().unallocated_count();
        if actual != self.pool.unallocated_addresses_amount {
            return Err(SnapshotError::PoolMismatch {
                expected: self.pool.unallocated_addresses_amount,
                actual,
            });
        }
        Ok(registry)
    }

    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl PeerSnapshot {
    fn from_peer(peer: &Peer) -> Self {
        PeerSnapshot {
            address: peer.address(),
            endpoint: peer.endpoint(),
            is_router: peer.is_router(),
            name: peer.name().map(str::to_owned),
            routes: peer.role().routes().to_vec(),
        }
    }
}

impl PeerRegistry {
    /// Serialize to the snapshot JSON format, without key material.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Snapshot::capture(self).to_json()
    }

    /// Serialize including identities sealed under `secret`.
    pub fn to_json_sealed(&self, secret: &[u8]) -> Result<String, SnapshotError> {
        Snapshot::capture_sealed(self, secret)?.to_json()
    }

    /// Rebuild from snapshot JSON, generating fresh identities.
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Snapshot::from_json(json)?.restore()
    }

    /// Rebuild from snapshot JSON, unsealing identities with `secret`.
    pub fn from_json_sealed(json: &str, secret: &[u8]) -> Result<Self, SnapshotError> {
        Snapshot::from_json(json)?.restore_sealed(secret)
    }
}

/// Sealing key: domain-separated hash of the caller's secret.
fn seal_key(secret: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(SEAL_CONTEXT);
    hasher.update(secret);
    hasher.finalize().into()
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String, SnapshotError> {
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| SnapshotError::SealFailed)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = chacha20poly1305::Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| SnapshotError::SealFailed)?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

fn unseal(key: &[u8; KEY_LEN], sealed: &str) -> Result<[u8; KEY_LEN], SnapshotError> {
    let bytes = BASE64
        .decode(sealed.as_bytes())
        .map_err(|_| SnapshotError::SealFailed)?;
    if bytes.len() <= NONCE_LEN {
        return Err(SnapshotError::SealFailed);
    }
    let cipher = chacha20poly1305::ChaCha20Poly1305::new_from_slice(key)
        .map_err(|_| SnapshotError::SealFailed)?;
    let nonce = chacha20poly1305::Nonce::from_slice(&bytes[..NONCE_LEN]);
    let plaintext = cipher
        .decrypt(nonce, &bytes[NONCE_LEN..])
        .map_err(|_| SnapshotError::SealFailed)?;
    plaintext
        .try_into()
        .map_err(|_| SnapshotError::SealFailed)
}

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("failed to seal or unseal key material")]
    SealFailed,
    #[error("peer {0}: endpoint and is_router disagree")]
    RoleMismatch(Ipv4Addr),
    #[error("unallocated count mismatch: snapshot has {expected}, pool has {actual}")]
    PoolMismatch { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyError;

    fn addr(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn two_peer_registry() -> PeerRegistry {
        let mut reg = PeerRegistry::new("10.0.0.0/29".parse().unwrap());
        reg.add_peer(NewPeer {
            name: Some("laptop".into()),
            preshared_key: Some(PresharedKey::generate()),
            ..NewPeer::default()
        })
        .unwrap();
        reg.add_peer(NewPeer::router(addr("203.0.113.5"))).unwrap();
        reg
    }

    #[test]
    fn json_uses_the_documented_field_names() {
        let json = two_peer_registry().to_json().unwrap();
        assert!(json.contains("\"peers\""));
        assert!(json.contains("\"address\":\"10.0.0.1\""));
        assert!(json.contains("\"endpoint\":null"));
        assert!(json.contains("\"is_router\":true"));
        assert!(json.contains("\"address_space\":\"10.0.0.0/29\""));
        assert!(json.contains("\"unallocated_addresses_amount\":4"));
        // No key material in the base format.
        assert!(!json.contains("identities"));
        assert!(!json.contains("key"));
    }

    #[test]
    fn roundtrip_preserves_peers_and_counts() {
        let reg = two_peer_registry();
        let restored = PeerRegistry::from_json(&reg.to_json().unwrap()).unwrap();

        assert_eq!(restored.peer_count(), reg.peer_count());
        for (a, b) in reg.peers().iter().zip(restored.peers()) {
            assert_eq!(a.address(), b.address());
            assert_eq!(a.endpoint(), b.endpoint());
            assert_eq!(a.is_router(), b.is_router());
            assert_eq!(a.name(), b.name());
        }
        assert_eq!(
            restored.pool().unallocated_count(),
            reg.pool().unallocated_count()
        );
        assert_eq!(
            restored.pool().allocated_count(),
            reg.pool().allocated_count()
        );
        assert_eq!(restored.endpoints(), reg.endpoints());
    }

    #[test]
    fn plain_restore_regenerates_identities() {
        let reg = two_peer_registry();
        let restored = PeerRegistry::from_json(&reg.to_json().unwrap()).unwrap();
        for peer in restored.peers() {
            assert!(peer.private_key().is_some());
        }
        // The preshared key is secret material and never leaves unsealed.
        assert!(restored.peers()[0].preshared_key().is_none());
    }

    #[test]
    fn sealed_roundtrip_preserves_key_material() {
        let reg = two_peer_registry();
        let json = reg.to_json_sealed(b"hunter2").unwrap();
        let restored = PeerRegistry::from_json_sealed(&json, b"hunter2").unwrap();

        for (a, b) in reg.peers().iter().zip(restored.peers()) {
            assert_eq!(a.public_key(), b.public_key());
            assert_eq!(a.private_key(), b.private_key());
            assert_eq!(a.preshared_key(), b.preshared_key());
        }
    }

    #[test]
    fn wrong_secret_fails_to_unseal() {
        let json = two_peer_registry().to_json_sealed(b"hunter2").unwrap();
        assert!(matches!(
            PeerRegistry::from_json_sealed(&json, b"wrong"),
            Err(SnapshotError::SealFailed)
        ));
    }

    #[test]
    fn sealed_public_only_peer_keeps_public_key() {
        let mut reg = PeerRegistry::new("10.0.0.0/29".parse().unwrap());
        let public = PrivateKey::generate().public_key();
        reg.add_peer(NewPeer {
            public_key: Some(public),
            ..NewPeer::default()
        })
        .unwrap();

        let json = reg.to_json_sealed(b"s3cret").unwrap();
        let restored = PeerRegistry::from_json_sealed(&json, b"s3cret").unwrap();
        assert_eq!(*restored.peers()[0].public_key(), public);
        assert!(restored.peers()[0].private_key().is_none());
    }

    #[test]
    fn tampered_identity_is_rejected_on_replay() {
        let reg = two_peer_registry();
        let mut snapshot = Snapshot::capture_sealed(&reg, b"hunter2").unwrap();
        // Swap in a public key that cannot match the sealed private key.
        snapshot.identities[0].public_key = PrivateKey::generate().public_key();
        let err = snapshot.restore_sealed(b"hunter2").unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::Registry(RegistryError::Key(KeyError::Mismatch))
        ));
    }

    #[test]
    fn router_routes_survive_the_roundtrip() {
        let mut reg = PeerRegistry::new("10.0.0.0/29".parse().unwrap());
        let route: Ipv4Net = "192.168.10.0/24".parse().unwrap();
        reg.add_peer(NewPeer {
            endpoint: Some(addr("203.0.113.5")),
            routes: vec![route],
            ..NewPeer::default()
        })
        .unwrap();
        let restored = PeerRegistry::from_json(&reg.to_json().unwrap()).unwrap();
        assert_eq!(restored.peers()[0].role().routes(), &[route]);
    }

    #[test]
    fn role_mismatch_is_rejected() {
        let json = r#"{
            "peers": [{"address": "10.0.0.1", "endpoint": null, "is_router": true}],
            "pool": {"address_space": "10.0.0.0/29", "unallocated_addresses_amount": 5}
        }"#;
        assert!(matches!(
            PeerRegistry::from_json(json),
            Err(SnapshotError::RoleMismatch(_))
        ));
    }

    #[test]
    fn count_mismatch_is_rejected() {
        let json = r#"{
            "peers": [{"address": "10.0.0.1", "endpoint": null, "is_router": false}],
            "pool": {"address_space": "10.0.0.0/29", "unallocated_addresses_amount": 3}
        }"#;
        assert!(matches!(
            PeerRegistry::from_json(json),
            Err(SnapshotError::PoolMismatch {
                expected: 3,
                actual: 5
            })
        ));
    }

    #[test]
    fn duplicate_snapshot_address_is_rejected() {
        let json = r#"{
            "peers": [
                {"address": "10.0.0.1", "endpoint": null, "is_router": false},
                {"address": "10.0.0.1", "endpoint": null, "is_router": false}
            ],
            "pool": {"address_space": "10.0.0.0/29", "unallocated_addresses_amount": 4}
        }"#;
        assert!(matches!(
            PeerRegistry::from_json(json),
            Err(SnapshotError::Registry(
                RegistryError::AddressAlreadyAllocated(_)
            ))
        ));
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let key = seal_key(b"secret");
        let sealed = seal(&key, &[9u8; KEY_LEN]).unwrap();
        assert_eq!(unseal(&key, &sealed).unwrap(), [9u8; KEY_LEN]);
        assert!(unseal(&seal_key(b"other"), &sealed).is_err());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(matches!(
            PeerRegistry::from_json("{"),
            Err(SnapshotError::Json(_))
        ));
    }
}
