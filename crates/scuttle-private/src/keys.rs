//! Symmetric key store.
//!
//! Maps `(scheme, address)` to an ordered list of 32-byte keys. Entries
//! are added on key discovery and never mutated; new derivations are
//! appended. Backed by a sled tree in the indexes database.

use serde::{Deserialize, Serialize};

use scuttle_types::{Result, ScuttleError};

// ---------------------------------------------------------------------------
// KeyScheme
// ---------------------------------------------------------------------------

/// Namespace of a stored key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum KeyScheme {
    /// Pairwise direct-message keys.
    DirectMessage,
    /// Shared group keys.
    Group,
    /// Keys recovered from earlier envelope slots.
    Previous,
}

impl KeyScheme {
    /// Stable storage prefix.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DirectMessage => "direct-message",
            Self::Group => "group",
            Self::Previous => "previous",
        }
    }

    /// Every scheme, in candidate-key trial order.
    pub fn all() -> [KeyScheme; 3] {
        [Self::Group, Self::DirectMessage, Self::Previous]
    }
}

// ---------------------------------------------------------------------------
// StoredKey
// ---------------------------------------------------------------------------

/// One symmetric key with its discovery metadata.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoredKey {
    /// The 32-byte symmetric key.
    pub key: [u8; 32],
    /// Free-form origin note ("derived", "group/add-member", …).
    pub origin: String,
}

// ---------------------------------------------------------------------------
// KeyStore
// ---------------------------------------------------------------------------

/// Concurrent mapping from `(scheme, address)` to key lists.
#[derive(Clone)]
pub struct KeyStore {
    tree: sled::Tree,
}

impl KeyStore {
    /// Opens the key store inside `db`.
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree("keys").map_err(|e| ScuttleError::Fatal {
            reason: format!("failed to open key store: {e}"),
        })?;
        Ok(Self { tree })
    }

    /// Appends `key` to the list at `(scheme, addr)`, deduplicating.
    pub fn add(&self, scheme: KeyScheme, addr: &[u8], key: StoredKey) -> Result<()> {
        let k = store_key(scheme, addr);
        let mut list = self.get(scheme, addr)?;
        if list.iter().any(|existing| existing.key == key.key) {
            return Ok(());
        }
        list.push(key);
        let mut buf = Vec::new();
        ciborium::into_writer(&list, &mut buf).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to encode key list: {e}"),
        })?;
        self.tree.insert(k, buf).map_err(storage_err)?;
        Ok(())
    }

    /// Returns the key list at `(scheme, addr)`, oldest first.
    pub fn get(&self, scheme: KeyScheme, addr: &[u8]) -> Result<Vec<StoredKey>> {
        match self.tree.get(store_key(scheme, addr)).map_err(storage_err)? {
            Some(bytes) => ciborium::from_reader(bytes.as_ref()).map_err(|e| ScuttleError::Corrupt {
                index: "keys".into(),
                reason: format!("undecodable key list: {e}"),
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Every key stored under `scheme`, across all addresses.
    pub fn all_for_scheme(&self, scheme: KeyScheme) -> Result<Vec<StoredKey>> {
        let prefix = format!("{}:", scheme.as_str()).into_bytes();
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (_, bytes) = item.map_err(storage_err)?;
            let list: Vec<StoredKey> =
                ciborium::from_reader(bytes.as_ref()).map_err(|e| ScuttleError::Corrupt {
                    index: "keys".into(),
                    reason: format!("undecodable key list: {e}"),
                })?;
            out.extend(list);
        }
        Ok(out)
    }

    /// Every address that has keys under `scheme`.
    pub fn addrs_for_scheme(&self, scheme: KeyScheme) -> Result<Vec<Vec<u8>>> {
        let prefix = format!("{}:", scheme.as_str()).into_bytes();
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(&prefix) {
            let (key, _) = item.map_err(storage_err)?;
            out.push(key[prefix.len()..].to_vec());
        }
        Ok(out)
    }
}

fn store_key(scheme: KeyScheme, addr: &[u8]) -> Vec<u8> {
    let mut k = format!("{}:", scheme.as_str()).into_bytes();
    k.extend_from_slice(addr);
    k
}

fn storage_err(e: sled::Error) -> ScuttleError {
    ScuttleError::Storage {
        reason: format!("key store: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, KeyStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = sled::open(dir.path().join("indexes")).expect("sled");
        let ks = KeyStore::open(&db).expect("keystore");
        (dir, ks)
    }

    fn key(byte: u8) -> StoredKey {
        StoredKey {
            key: [byte; 32],
            origin: "test".into(),
        }
    }

    #[test]
    fn add_and_get_roundtrip() -> Result<()> {
        let (_dir, ks) = temp_store();
        ks.add(KeyScheme::Group, b"addr-a", key(1))?;
        ks.add(KeyScheme::Group, b"addr-a", key(2))?;

        let list = ks.get(KeyScheme::Group, b"addr-a")?;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].key, [1; 32]);
        assert_eq!(list[1].key, [2; 32]);
        Ok(())
    }

    #[test]
    fn duplicate_keys_are_ignored() -> Result<()> {
        let (_dir, ks) = temp_store();
        ks.add(KeyScheme::DirectMessage, b"peer", key(7))?;
        ks.add(KeyScheme::DirectMessage, b"peer", key(7))?;
        assert_eq!(ks.get(KeyScheme::DirectMessage, b"peer")?.len(), 1);
        Ok(())
    }

    #[test]
    fn schemes_are_namespaced() -> Result<()> {
        let (_dir, ks) = temp_store();
        ks.add(KeyScheme::Group, b"x", key(1))?;
        ks.add(KeyScheme::DirectMessage, b"x", key(2))?;

        assert_eq!(ks.get(KeyScheme::Group, b"x")?.len(), 1);
        assert_eq!(ks.get(KeyScheme::DirectMessage, b"x")?.len(), 1);
        assert_eq!(ks.all_for_scheme(KeyScheme::Group)?.len(), 1);
        Ok(())
    }

    #[test]
    fn missing_address_is_empty() -> Result<()> {
        let (_dir, ks) = temp_store();
        assert!(ks.get(KeyScheme::Previous, b"nothing")?.is_empty());
        Ok(())
    }

    #[test]
    fn addrs_for_scheme_lists_addresses() -> Result<()> {
        let (_dir, ks) = temp_store();
        ks.add(KeyScheme::Group, b"g1", key(1))?;
        ks.add(KeyScheme::Group, b"g2", key(2))?;
        let mut addrs = ks.addrs_for_scheme(KeyScheme::Group)?;
        addrs.sort();
        assert_eq!(addrs, vec![b"g1".to_vec(), b"g2".to_vec()]);
        Ok(())
    }
}
