//! Embedded, crash-recoverable key-value store backing persisted update
//! state (spec §3 `Artifact StateData`, §4.5).
//!
//! `sled` gives atomic single-key write/read/delete without pulling in a
//! full SQL engine — grounded in `other_examples/manifests` repos that
//! reach for `sled = "0.34"` for exactly this "small embedded store"
//! role.

use std::path::Path;

use crate::error::Result;

/// Well-known key under which the single in-progress
/// [`crate::update::StateData`] record lives. Presence means "an update
/// is in progress"; absence means "idle".
pub const STANDALONE_STATE_KEY: &str = "standalone-state";

/// Key under which the currently installed artifact's name is committed
/// once a deployment finishes successfully (spec §6 Persisted state
/// layout).
pub const ARTIFACT_NAME_KEY: &str = "artifact-name";

/// Key under which the currently installed artifact's group is committed.
pub const ARTIFACT_GROUP_KEY: &str = "artifact-group";

/// Prefix for one committed `provides` entry per key, stored as
/// `<PROVIDES_KEY_PREFIX><name>`.
pub const PROVIDES_KEY_PREFIX: &str = "provides:";

/// Minimal transactional KV abstraction: atomic write, read, delete. No
/// nested transactions — a single put/get/delete is already atomic at the
/// storage-engine level, which is all the update engine needs.
pub trait KvStore: Send + Sync {
    /// Atomically write `value` at `key`, replacing any prior value.
    fn write(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Read the value at `key`, if any.
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically remove `key`. A no-op if absent.
    fn delete(&self, key: &str) -> Result<()>;
}

/// `sled`-backed [`KvStore`].
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| crate::error::Error::Database(e.to_string()))?;
        Ok(Self { db })
    }
}

impl KvStore for SledStore {
    fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .map_err(|e| crate::error::Error::Database(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| crate::error::Error::Database(e.to_string()))?;
        Ok(())
    }

    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .db
            .get(key)
            .map_err(|e| crate::error::Error::Database(e.to_string()))?
            .map(|ivec| ivec.to_vec()))
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.db
            .remove(key)
            .map_err(|e| crate::error::Error::Database(e.to_string()))?;
        self.db
            .flush()
            .map_err(|e| crate::error::Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_delete_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        assert!(store.read("k").unwrap().is_none());
        store.write("k", b"v1").unwrap();
        assert_eq!(store.read("k").unwrap(), Some(b"v1".to_vec()));
        store.write("k", b"v2").unwrap();
        assert_eq!(store.read("k").unwrap(), Some(b"v2".to_vec()));
        store.delete("k").unwrap();
        assert!(store.read("k").unwrap().is_none());
        // deleting an absent key is a no-op, not an error
        store.delete("k").unwrap();
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store.write(STANDALONE_STATE_KEY, b"{\"version\":1}").unwrap();
        }
        let reopened = SledStore::open(dir.path()).unwrap();
        assert_eq!(
            reopened.read(STANDALONE_STATE_KEY).unwrap(),
            Some(b"{\"version\":1}".to_vec())
        );
    }
}
