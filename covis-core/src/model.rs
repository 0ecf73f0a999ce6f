//! Replicated scene model.
//!
//! ```text
//! Container (uuid, type, model, name)
//!   └── syncables: map key ──► Syncable (uuid, position?, rotation?)
//! ```
//!
//! A syncable's map key is chosen by the client and is not required to match
//! the syncable's own `uuid`. Anything that looks up "syncable X in container
//! C" must scan values, see [`Container::find_syncable`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

pub type ContainerUuid = String;
pub type SyncableUuid = String;
pub type SubscriberId = String;

/// Position in scene coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Rotation quaternion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec4 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Vec4 {
    pub const IDENTITY: Vec4 = Vec4 { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }
}

/// Smallest replicated unit of state.
///
/// `None` means "not sent", which is different from a zero vector: merging
/// a syncable with `position: None` keeps the stored position.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Syncable {
    pub uuid: SyncableUuid,
    pub position: Option<Vec3>,
    pub rotation: Option<Vec4>,
}

impl Syncable {
    pub fn new(uuid: impl Into<SyncableUuid>) -> Self {
        Self {
            uuid: uuid.into(),
            position: None,
            rotation: None,
        }
    }

    pub fn with_position(mut self, position: Vec3) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_rotation(mut self, rotation: Vec4) -> Self {
        self.rotation = Some(rotation);
        self
    }
}

/// Kind of object a container represents. Fixed once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContainerType {
    /// Not provided by the sender; may be filled in by a later upsert
    #[default]
    Unspecified = 0,
    Object = 1,
    User = 2,
    Controller = 3,
}

impl ContainerType {
    pub fn is_unspecified(&self) -> bool {
        matches!(self, ContainerType::Unspecified)
    }
}

/// Named group of syncables sharing a type and model.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Container {
    pub uuid: ContainerUuid,
    pub container_type: ContainerType,
    pub model: String,
    pub name: String,
    pub syncables: BTreeMap<String, Syncable>,
}

impl Container {
    pub fn new(uuid: impl Into<ContainerUuid>) -> Self {
        Self {
            uuid: uuid.into(),
            ..Self::default()
        }
    }

    pub fn with_type(mut self, container_type: ContainerType) -> Self {
        self.container_type = container_type;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Insert a syncable under an explicit map key.
    pub fn with_syncable(mut self, key: impl Into<String>, syncable: Syncable) -> Self {
        self.syncables.insert(key.into(), syncable);
        self
    }

    /// Find a syncable by its own uuid (not by map key).
    pub fn find_syncable(&self, uuid: &str) -> Option<(&String, &Syncable)> {
        self.syncables.iter().find(|(_, s)| s.uuid == uuid)
    }

    /// Number of entries whose value carries `uuid`.
    pub fn count_syncable(&self, uuid: &str) -> usize {
        self.syncables.values().filter(|s| s.uuid == uuid).count()
    }

    pub fn contains_syncable(&self, uuid: &str) -> bool {
        self.find_syncable(uuid).is_some()
    }

    pub fn syncable_uuids(&self) -> impl Iterator<Item = &str> {
        self.syncables.values().map(|s| s.uuid.as_str())
    }
}

/// Payload of an [`Update`]. Exactly one variant per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdatePayload {
    /// Create or merge a container
    Container(Container),
    /// Merge into an existing syncable
    Syncable(Syncable),
    DeleteContainer { container_uuid: ContainerUuid },
    DeleteSyncable { syncable_uuid: SyncableUuid },
    /// Last-known containers of a departing subscriber
    Disconnect { containers: Vec<Container> },
}

/// A timestamped scene update.
///
/// The timestamp (milliseconds since the Unix epoch) is informational and
/// never used for conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub timestamp: i64,
    pub payload: UpdatePayload,
}

impl Update {
    pub fn new(payload: UpdatePayload) -> Self {
        Self {
            timestamp: now_millis(),
            payload,
        }
    }

    pub fn container(container: Container) -> Self {
        Self::new(UpdatePayload::Container(container))
    }

    pub fn syncable(syncable: Syncable) -> Self {
        Self::new(UpdatePayload::Syncable(syncable))
    }

    pub fn delete_container(container_uuid: impl Into<ContainerUuid>) -> Self {
        Self::new(UpdatePayload::DeleteContainer {
            container_uuid: container_uuid.into(),
        })
    }

    pub fn delete_syncable(syncable_uuid: impl Into<SyncableUuid>) -> Self {
        Self::new(UpdatePayload::DeleteSyncable {
            syncable_uuid: syncable_uuid.into(),
        })
    }

    pub fn disconnect(containers: Vec<Container>) -> Self {
        Self::new(UpdatePayload::Disconnect { containers })
    }

    /// Short payload name for log lines.
    pub fn kind(&self) -> &'static str {
        match self.payload {
            UpdatePayload::Container(_) => "container",
            UpdatePayload::Syncable(_) => "syncable",
            UpdatePayload::DeleteContainer { .. } => "delete_container",
            UpdatePayload::DeleteSyncable { .. } => "delete_syncable",
            UpdatePayload::Disconnect { .. } => "disconnect",
        }
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self.payload, UpdatePayload::Disconnect { .. })
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_syncable_scans_values_not_keys() {
        let container = Container::new("c1")
            .with_syncable("left-hand", Syncable::new("s1"))
            .with_syncable("s1", Syncable::new("s2"));

        let (key, found) = container.find_syncable("s1").unwrap();
        assert_eq!(key, "left-hand");
        assert_eq!(found.uuid, "s1");

        let (key, _) = container.find_syncable("s2").unwrap();
        assert_eq!(key, "s1");
        assert!(container.find_syncable("s3").is_none());
    }

    #[test]
    fn test_count_syncable_detects_duplicates() {
        let container = Container::new("c1")
            .with_syncable("a", Syncable::new("s1"))
            .with_syncable("b", Syncable::new("s1"));
        assert_eq!(container.count_syncable("s1"), 2);
        assert_eq!(container.count_syncable("s2"), 0);
    }

    #[test]
    fn test_presence_is_distinct_from_zero() {
        let unset = Syncable::new("s1");
        let zero = Syncable::new("s1").with_position(Vec3::ZERO);
        assert_ne!(unset, zero);
    }

    #[test]
    fn test_update_constructors_stamp_time() {
        let update = Update::delete_syncable("s1");
        assert!(update.timestamp > 0);
        assert_eq!(update.kind(), "delete_syncable");
        assert!(!update.is_disconnect());
        assert!(Update::disconnect(Vec::new()).is_disconnect());
    }

    #[test]
    fn test_container_type_default() {
        assert!(ContainerType::default().is_unspecified());
        assert_eq!(ContainerType::Controller as u8, 3);
    }
}
