//! # covis-core: shared scene model for Covis
//!
//! Defines the replicated scene graph (containers holding syncables) and the
//! field-presence merge rules every participant applies to it.
//!
//! ## Modules
//!
//! - [`model`]: Containers, syncables and the `Update` envelope
//! - [`merge`]: Field-level "last writer, if present" merge

pub mod model;
pub mod merge;

pub use model::{
    Container, ContainerType, ContainerUuid, SubscriberId, Syncable, SyncableUuid, Update,
    UpdatePayload, Vec3, Vec4,
};
pub use merge::{merge_container, merge_syncable, MergeError};
