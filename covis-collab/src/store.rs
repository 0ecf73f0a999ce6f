//! Authoritative container store with a syncable → container index.
//!
//! ```text
//! entries: container uuid ──► (owner subscriber, Container)   insertion ordered
//! index:   syncable uuid  ──► container uuid
//! ```
//!
//! For every stored container C and every syncable S inside it,
//! `index[S.uuid] == C.uuid`, and the index holds nothing else. Every
//! operation validates fully before its first write, so a rejected operation
//! leaves both maps untouched.
//!
//! `SceneStore` is not synchronized on its own; the session hub wraps it in a
//! single mutex so that operations from all subscribers are totally ordered.

use std::collections::HashMap;

use indexmap::IndexMap;
use thiserror::Error;

use covis_core::merge::{merge_container, merge_syncable, MergeError};
use covis_core::model::{
    Container, ContainerUuid, SubscriberId, Syncable, SyncableUuid, Update, UpdatePayload,
};

/// Reasons the store refuses an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("container uuid is blank")]
    BlankContainerUuid,
    #[error("syncable uuid is blank")]
    BlankSyncableUuid,
    #[error("container '{container}' holds a syncable with a blank uuid")]
    BlankContainedSyncable { container: ContainerUuid },
    #[error("unknown syncable '{0}'; syncables must arrive inside a container first")]
    UnknownSyncable(SyncableUuid),
    #[error("unknown container '{0}'")]
    UnknownContainer(ContainerUuid),
    #[error("syncable '{syncable}' already belongs to container '{owner}'")]
    SyncableOwnedElsewhere {
        syncable: SyncableUuid,
        owner: ContainerUuid,
    },
    #[error("syncable '{syncable}' appears {count} times in container '{container}'")]
    DuplicateSyncable {
        container: ContainerUuid,
        syncable: SyncableUuid,
        count: usize,
    },
    #[error("container '{container}' holds syncable '{syncable}' which is not indexed")]
    UnindexedSyncable {
        container: ContainerUuid,
        syncable: SyncableUuid,
    },
    #[error("index maps syncable '{syncable}' to container '{container}' which does not hold it")]
    IndexOutOfSync {
        syncable: SyncableUuid,
        container: ContainerUuid,
    },
    #[error("index entry '{syncable}' points to '{container}' but no such syncable is stored there")]
    DanglingIndexEntry {
        syncable: SyncableUuid,
        container: ContainerUuid,
    },
    #[error(transparent)]
    Merge(#[from] MergeError),
}

impl StoreError {
    /// Malformed input from a client, as opposed to a referential problem.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::BlankContainerUuid | Self::BlankSyncableUuid | Self::BlankContainedSyncable { .. }
        )
    }
}

/// One stored container and the subscriber that last wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEntry {
    pub owner: SubscriberId,
    pub container: Container,
}

/// The scene state shared by all sessions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SceneStore {
    entries: IndexMap<ContainerUuid, StoreEntry>,
    index: HashMap<SyncableUuid, ContainerUuid>,
}

fn is_blank(s: &str) -> bool {
    s.trim().is_empty()
}

/// First syncable uuid that occurs under more than one key.
fn first_duplicate(container: &Container) -> Option<(SyncableUuid, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for uuid in container.syncable_uuids() {
        *counts.entry(uuid).or_default() += 1;
    }
    container
        .syncable_uuids()
        .find(|uuid| counts[uuid] > 1)
        .map(|uuid| (uuid.to_string(), counts[uuid]))
}

impl SceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dispatch an update to the matching operation.
    ///
    /// A `Disconnect` payload evicts exactly the containers it lists, which is
    /// how a mirror follows another subscriber leaving. Sessions intercept a
    /// client's own `Disconnect` before it reaches the store.
    /// Rejections are logged here and returned to the caller.
    pub fn apply(&mut self, update: &Update, subscriber: &str) -> Result<(), StoreError> {
        let result = match &update.payload {
            UpdatePayload::Container(container) => {
                self.apply_container_upsert(container, subscriber)
            }
            UpdatePayload::Syncable(syncable) => self.apply_syncable_upsert(syncable, subscriber),
            UpdatePayload::DeleteContainer { container_uuid } => {
                self.delete_container(container_uuid).map(|_| ())
            }
            UpdatePayload::DeleteSyncable { syncable_uuid } => {
                self.delete_syncable(syncable_uuid).map(|_| ())
            }
            UpdatePayload::Disconnect { containers } => {
                self.evict_listed(containers);
                Ok(())
            }
        };

        if let Err(e) = &result {
            if e.is_malformed() {
                log::warn!("Rejected {} update from {subscriber} (client error): {e}", update.kind());
            } else {
                log::error!("Rejected {} update from {subscriber}: {e}", update.kind());
            }
        }
        result
    }

    /// Insert a new container or merge into the stored one.
    ///
    /// The writer becomes the recorded owner. Only syncables that were not in
    /// the stored container get new index entries.
    pub fn apply_container_upsert(
        &mut self,
        container: &Container,
        subscriber: &str,
    ) -> Result<(), StoreError> {
        if is_blank(&container.uuid) {
            return Err(StoreError::BlankContainerUuid);
        }
        if container.syncables.values().any(|s| is_blank(&s.uuid)) {
            return Err(StoreError::BlankContainedSyncable {
                container: container.uuid.clone(),
            });
        }
        for uuid in container.syncable_uuids() {
            if let Some(owner) = self.index.get(uuid) {
                if owner != &container.uuid {
                    return Err(StoreError::SyncableOwnedElsewhere {
                        syncable: uuid.to_string(),
                        owner: owner.clone(),
                    });
                }
            }
        }

        let (stored, introduced): (Container, Vec<SyncableUuid>) =
            match self.entries.get(&container.uuid) {
                Some(entry) => {
                    log::trace!("Merging into known container {}", container.uuid);
                    let merged = merge_container(&entry.container, container)?;
                    let introduced = container
                        .syncable_uuids()
                        .filter(|uuid| !entry.container.contains_syncable(uuid))
                        .map(str::to_string)
                        .collect();
                    (merged, introduced)
                }
                None => {
                    log::trace!("Adding new container {}", container.uuid);
                    let introduced = container.syncable_uuids().map(str::to_string).collect();
                    (container.clone(), introduced)
                }
            };

        if let Some((syncable, count)) = first_duplicate(&stored) {
            return Err(StoreError::DuplicateSyncable {
                container: container.uuid.clone(),
                syncable,
                count,
            });
        }

        for uuid in introduced {
            self.index.insert(uuid, container.uuid.clone());
        }
        self.entries.insert(
            container.uuid.clone(),
            StoreEntry {
                owner: subscriber.to_string(),
                container: stored,
            },
        );
        Ok(())
    }

    /// Merge a partial syncable into the container that holds it.
    ///
    /// Unknown syncables are rejected; they can only be created inside a
    /// container upsert.
    pub fn apply_syncable_upsert(
        &mut self,
        syncable: &Syncable,
        subscriber: &str,
    ) -> Result<(), StoreError> {
        if is_blank(&syncable.uuid) {
            return Err(StoreError::BlankSyncableUuid);
        }
        let container_uuid = self
            .index
            .get(&syncable.uuid)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSyncable(syncable.uuid.clone()))?;

        let out_of_sync = || StoreError::IndexOutOfSync {
            syncable: syncable.uuid.clone(),
            container: container_uuid.clone(),
        };
        let entry = self.entries.get_mut(&container_uuid).ok_or_else(out_of_sync)?;
        let (key, stored) = entry
            .container
            .find_syncable(&syncable.uuid)
            .map(|(k, s)| (k.clone(), s))
            .ok_or_else(out_of_sync)?;

        let merged = merge_syncable(stored, syncable)?;
        log::trace!("Merged syncable {} in container {container_uuid}", syncable.uuid);
        entry.container.syncables.insert(key, merged);
        entry.owner = subscriber.to_string();
        Ok(())
    }

    /// Remove a container and the index entries of everything inside it.
    pub fn delete_container(&mut self, uuid: &str) -> Result<StoreEntry, StoreError> {
        let entry = self
            .entries
            .get(uuid)
            .ok_or_else(|| StoreError::UnknownContainer(uuid.to_string()))?;

        if let Some(missing) = entry
            .container
            .syncable_uuids()
            .find(|s| !self.index.contains_key(*s))
        {
            return Err(StoreError::UnindexedSyncable {
                container: uuid.to_string(),
                syncable: missing.to_string(),
            });
        }

        log::trace!("Removing container {uuid}");
        let entry = self
            .entries
            .shift_remove(uuid)
            .ok_or_else(|| StoreError::UnknownContainer(uuid.to_string()))?;
        for syncable in entry.container.syncable_uuids() {
            self.index.remove(syncable);
        }
        Ok(entry)
    }

    /// Remove a single syncable from its container. The container stays.
    pub fn delete_syncable(&mut self, uuid: &str) -> Result<Syncable, StoreError> {
        let container_uuid = self
            .index
            .get(uuid)
            .cloned()
            .ok_or_else(|| StoreError::UnknownSyncable(uuid.to_string()))?;
        let entry = self.entries.get_mut(&container_uuid).ok_or_else(|| {
            StoreError::IndexOutOfSync {
                syncable: uuid.to_string(),
                container: container_uuid.clone(),
            }
        })?;

        let keys: Vec<String> = entry
            .container
            .syncables
            .iter()
            .filter(|(_, s)| s.uuid == uuid)
            .map(|(k, _)| k.clone())
            .collect();
        let key = match keys.as_slice() {
            [key] => key.clone(),
            [] => {
                return Err(StoreError::IndexOutOfSync {
                    syncable: uuid.to_string(),
                    container: container_uuid,
                })
            }
            _ => {
                return Err(StoreError::DuplicateSyncable {
                    container: container_uuid,
                    syncable: uuid.to_string(),
                    count: keys.len(),
                })
            }
        };

        log::trace!("Removing syncable {uuid} from container {container_uuid}");
        let removed = entry
            .container
            .syncables
            .remove(&key)
            .ok_or_else(|| StoreError::UnknownSyncable(uuid.to_string()))?;
        self.index.remove(uuid);
        Ok(removed)
    }

    /// Delete every container owned by `subscriber`.
    ///
    /// Best effort: a container that fails to delete is logged and skipped.
    /// Returns the uuids that were removed.
    pub fn remove_subscriber(&mut self, subscriber: &str) -> Vec<ContainerUuid> {
        let owned: Vec<ContainerUuid> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == subscriber)
            .map(|(uuid, _)| uuid.clone())
            .collect();
        log::info!("Removing subscriber {subscriber} ({} containers)", owned.len());

        let mut removed = Vec::with_capacity(owned.len());
        for uuid in owned {
            match self.delete_container(&uuid) {
                Ok(_) => removed.push(uuid),
                Err(e) => log::error!("Cleanup of container {uuid} for {subscriber} failed: {e}"),
            }
        }
        removed
    }

    /// Delete the containers named in a disconnect notice.
    ///
    /// Best effort like `remove_subscriber`: unknown or inconsistent entries
    /// are logged and skipped. Returns the uuids that were removed.
    pub fn evict_listed(&mut self, containers: &[Container]) -> Vec<ContainerUuid> {
        let mut removed = Vec::with_capacity(containers.len());
        for container in containers {
            match self.delete_container(&container.uuid) {
                Ok(_) => removed.push(container.uuid.clone()),
                Err(e) => log::warn!("Skipping eviction of container {}: {e}", container.uuid),
            }
        }
        removed
    }

    /// Full snapshot in insertion order.
    pub fn list_all(&self) -> Vec<(SubscriberId, Container)> {
        self.entries
            .values()
            .map(|e| (e.owner.clone(), e.container.clone()))
            .collect()
    }

    /// Containers currently owned by `subscriber`, in insertion order.
    pub fn owned_by(&self, subscriber: &str) -> Vec<Container> {
        self.entries
            .values()
            .filter(|e| e.owner == subscriber)
            .map(|e| e.container.clone())
            .collect()
    }

    pub fn get(&self, uuid: &str) -> Option<&StoreEntry> {
        self.entries.get(uuid)
    }

    pub fn owner_of(&self, uuid: &str) -> Option<&str> {
        self.entries.get(uuid).map(|e| e.owner.as_str())
    }

    /// Container uuid the index records for a syncable.
    pub fn index_lookup(&self, syncable: &str) -> Option<&str> {
        self.index.get(syncable).map(String::as_str)
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Verify that the index matches the stored containers exactly.
    pub fn check_consistency(&self) -> Result<(), StoreError> {
        let mut seen: HashMap<&str, &str> = HashMap::new();
        for (uuid, entry) in &self.entries {
            for syncable in entry.container.syncable_uuids() {
                if let Some(first) = seen.insert(syncable, uuid) {
                    return Err(if first == uuid.as_str() {
                        StoreError::DuplicateSyncable {
                            container: uuid.clone(),
                            syncable: syncable.to_string(),
                            count: entry.container.count_syncable(syncable),
                        }
                    } else {
                        StoreError::SyncableOwnedElsewhere {
                            syncable: syncable.to_string(),
                            owner: first.to_string(),
                        }
                    });
                }
                if self.index.get(syncable) != Some(uuid) {
                    return Err(StoreError::UnindexedSyncable {
                        container: uuid.clone(),
                        syncable: syncable.to_string(),
                    });
                }
            }
        }
        for (syncable, container) in &self.index {
            if seen.get(syncable.as_str()) != Some(&container.as_str()) {
                return Err(StoreError::DanglingIndexEntry {
                    syncable: syncable.clone(),
                    container: container.clone(),
                });
            }
        }
        Ok(())
    }
}
