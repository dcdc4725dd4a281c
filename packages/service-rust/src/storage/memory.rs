//! In-memory [`KeyRepository`] backed by [`DashMap`].
//!
//! Rings and their sync metadata live in two maps keyed by master key id.
//! Suitable for tests, the `keyop` binary, and embedders that persist
//! snapshots themselves.

use async_trait::async_trait;
use dashmap::DashMap;
use keyop_core::{KeyId, KeyMetadata, KeyRing};

use crate::traits::{KeyRepository, SaveOutcome};

pub struct MemoryKeyRepository {
    rings: DashMap<KeyId, KeyRing>,
    metadata: DashMap<KeyId, KeyMetadata>,
}

impl MemoryKeyRepository {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rings: DashMap::new(),
            metadata: DashMap::new(),
        }
    }

    /// Creates a repository pre-populated with `rings`, all unsynced.
    #[must_use]
    pub fn from_rings(rings: impl IntoIterator<Item = KeyRing>) -> Self {
        let repo = Self::new();
        for ring in rings {
            repo.metadata
                .insert(ring.master_key_id, KeyMetadata::new(ring.master_key_id));
            repo.rings.insert(ring.master_key_id, ring);
        }
        repo
    }

    /// All stored rings, ordered by master key id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<KeyRing> {
        let mut rings: Vec<KeyRing> = self.rings.iter().map(|r| r.value().clone()).collect();
        rings.sort_by_key(|ring| ring.master_key_id);
        rings
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }
}

impl Default for MemoryKeyRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyRepository for MemoryKeyRepository {
    async fn get(&self, master_key_id: KeyId) -> anyhow::Result<Option<KeyRing>> {
        Ok(self.rings.get(&master_key_id).map(|r| r.clone()))
    }

    async fn find_by_key_id(&self, key_id: KeyId) -> anyhow::Result<Option<KeyRing>> {
        if let Some(ring) = self.rings.get(&key_id) {
            return Ok(Some(ring.clone()));
        }
        Ok(self
            .rings
            .iter()
            .find(|entry| entry.value().contains_key(key_id))
            .map(|entry| entry.value().clone()))
    }

    async fn list_ids(&self) -> anyhow::Result<Vec<KeyId>> {
        let mut ids: Vec<KeyId> = self.rings.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    async fn save(&self, ring: KeyRing) -> anyhow::Result<SaveOutcome> {
        let id = ring.master_key_id;
        let outcome = match self.rings.insert(id, ring.clone()) {
            None => SaveOutcome::New,
            Some(previous) if previous == ring => SaveOutcome::Unchanged,
            Some(_) => SaveOutcome::Updated,
        };
        self.metadata.entry(id).or_insert_with(|| KeyMetadata::new(id));
        Ok(outcome)
    }

    async fn delete(&self, master_key_id: KeyId) -> anyhow::Result<bool> {
        self.metadata.remove(&master_key_id);
        Ok(self.rings.remove(&master_key_id).is_some())
    }

    async fn metadata(&self, master_key_id: KeyId) -> anyhow::Result<Option<KeyMetadata>> {
        Ok(self.metadata.get(&master_key_id).map(|m| m.clone()))
    }

    async fn renew_metadata(
        &self,
        master_key_id: KeyId,
        seen_on_keyservers: bool,
        now_millis: u64,
    ) -> anyhow::Result<()> {
        if !self.rings.contains_key(&master_key_id) {
            anyhow::bail!("no key ring {master_key_id} to attach metadata to");
        }
        self.metadata
            .entry(master_key_id)
            .or_insert_with(|| KeyMetadata::new(master_key_id))
            .renew(seen_on_keyservers, now_millis);
        Ok(())
    }

    async fn reset_all_metadata(&self) -> anyhow::Result<usize> {
        let mut cleared = 0;
        for mut entry in self.metadata.iter_mut() {
            if entry.last_updated_millis.is_some() {
                cleared += 1;
            }
            entry.invalidate();
        }
        Ok(cleared)
    }

    async fn ids_last_updated_before(&self, cutoff_millis: u64) -> anyhow::Result<Vec<KeyId>> {
        let mut ids: Vec<KeyId> = self
            .rings
            .iter()
            .map(|r| *r.key())
            .filter(|id| {
                self.metadata
                    .get(id)
                    .and_then(|m| m.last_updated_millis)
                    .is_none_or(|updated| updated < cutoff_millis)
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use keyop_core::{Fingerprint, SubKey, UserId};

    use super::*;

    fn ring(id: u64) -> KeyRing {
        let mut ring = KeyRing::public(KeyId(id), Fingerprint(id.to_be_bytes().to_vec()));
        ring.user_ids.push(UserId::new(format!("user{id}@example.org")));
        ring
    }

    #[tokio::test]
    async fn save_reports_new_updated_unchanged() {
        let repo = MemoryKeyRepository::new();
        assert_eq!(repo.save(ring(1)).await.unwrap(), SaveOutcome::New);
        assert_eq!(repo.save(ring(1)).await.unwrap(), SaveOutcome::Unchanged);

        let mut changed = ring(1);
        changed.revoked = true;
        assert_eq!(repo.save(changed).await.unwrap(), SaveOutcome::Updated);
        assert!(repo.get(KeyId(1)).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn find_by_subkey() {
        let mut with_sub = ring(1);
        with_sub.subkeys.push(SubKey {
            key_id: KeyId(0x99),
            revoked: false,
            secret: keyop_core::SecretKeyType::None,
        });
        let repo = MemoryKeyRepository::from_rings([with_sub, ring(2)]);

        let found = repo.find_by_key_id(KeyId(0x99)).await.unwrap().unwrap();
        assert_eq!(found.master_key_id, KeyId(1));
        assert!(repo.find_by_key_id(KeyId(0x42)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_metadata() {
        let repo = MemoryKeyRepository::from_rings([ring(1)]);
        assert!(repo.metadata(KeyId(1)).await.unwrap().is_some());
        assert!(repo.delete(KeyId(1)).await.unwrap());
        assert!(!repo.delete(KeyId(1)).await.unwrap());
        assert!(repo.metadata(KeyId(1)).await.unwrap().is_none());
        assert!(repo.is_empty());
    }

    #[tokio::test]
    async fn stale_selection_and_bulk_reset() {
        let repo = MemoryKeyRepository::from_rings([ring(1), ring(2), ring(3)]);
        repo.renew_metadata(KeyId(1), true, 1_000).await.unwrap();
        repo.renew_metadata(KeyId(2), false, 5_000).await.unwrap();

        // 3 was never synced, 1 is older than the cutoff.
        assert_eq!(
            repo.ids_last_updated_before(2_000).await.unwrap(),
            vec![KeyId(1), KeyId(3)]
        );

        assert_eq!(repo.reset_all_metadata().await.unwrap(), 2);
        assert_eq!(repo.ids_last_updated_before(0).await.unwrap().len(), 3);
        let meta = repo.metadata(KeyId(1)).await.unwrap().unwrap();
        assert!(meta.seen_on_keyservers);
        assert_eq!(meta.last_updated_millis, None);
    }

    #[tokio::test]
    async fn renew_requires_existing_ring() {
        let repo = MemoryKeyRepository::new();
        assert!(repo.renew_metadata(KeyId(7), true, 1).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_is_sorted() {
        let repo = MemoryKeyRepository::from_rings([ring(3), ring(1), ring(2)]);
        let ids: Vec<KeyId> = repo.snapshot().iter().map(|r| r.master_key_id).collect();
        assert_eq!(ids, vec![KeyId(1), KeyId(2), KeyId(3)]);
        assert_eq!(repo.list_ids().await.unwrap(), ids);
    }
}
