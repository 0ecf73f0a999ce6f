//! Field-presence merge for containers and syncables.
//!
//! Conflict policy is "last writer, if present": a field sent by the incoming
//! update replaces the stored one, a field left out keeps the stored value.
//! There are no clocks. Updates touching disjoint fields commute, updates
//! touching the same field do not.
//!
//! | Field              | Rule                                         |
//! |--------------------|----------------------------------------------|
//! | `Container.name`   | replaced when incoming is non-empty          |
//! | `Container.type`   | create-only, set while still `Unspecified`   |
//! | `Container.model`  | create-only, set while still empty           |
//! | `Container.syncables` | union by map key, shared keys merged      |
//! | `Syncable.position`| replaced when incoming is `Some`             |
//! | `Syncable.rotation`| replaced when incoming is `Some`             |

use thiserror::Error;

use crate::model::{Container, Syncable};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
    #[error("cannot merge '{incoming}' into '{stored}': identities differ")]
    IdentityMismatch { stored: String, incoming: String },
}

/// Merge an incoming partial syncable into the stored one.
pub fn merge_syncable(old: &Syncable, incoming: &Syncable) -> Result<Syncable, MergeError> {
    if old.uuid != incoming.uuid {
        return Err(MergeError::IdentityMismatch {
            stored: old.uuid.clone(),
            incoming: incoming.uuid.clone(),
        });
    }
    Ok(Syncable {
        uuid: old.uuid.clone(),
        position: incoming.position.or(old.position),
        rotation: incoming.rotation.or(old.rotation),
    })
}

/// Merge an incoming partial container into the stored one.
///
/// Entries present only in `old` are kept unchanged. An incoming entry whose
/// key already exists in `old` must carry the same syncable uuid.
pub fn merge_container(old: &Container, incoming: &Container) -> Result<Container, MergeError> {
    if old.uuid != incoming.uuid {
        return Err(MergeError::IdentityMismatch {
            stored: old.uuid.clone(),
            incoming: incoming.uuid.clone(),
        });
    }

    let mut merged = old.clone();

    if !incoming.name.is_empty() {
        merged.name = incoming.name.clone();
    }
    if merged.container_type.is_unspecified() {
        merged.container_type = incoming.container_type;
    }
    if merged.model.is_empty() {
        merged.model = incoming.model.clone();
    }

    for (key, syncable) in &incoming.syncables {
        let value = match old.syncables.get(key) {
            Some(stored) => merge_syncable(stored, syncable)?,
            None => syncable.clone(),
        };
        merged.syncables.insert(key.clone(), value);
    }

    Ok(merged)
}
