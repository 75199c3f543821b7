#![forbid(unsafe_code)]

// Room registry - authoritative membership, role, and producer tables.
//
// Rooms are created lazily on first join and deleted when the last member
// leaves. The registry lock is a std RwLock held only for brief map accesses,
// never across await points; adapter calls happen between lock acquisitions.

use crate::media::MediaAdapter;
use crate::signaling::protocol::{ProducerEntry, RoomSummary};
use mediasoup::prelude::MediaKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Role a client holds inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomRole {
    Publisher,
    Observer,
    Moderator,
}

impl RoomRole {
    /// Observers never hold room ownership.
    pub fn can_own(self) -> bool {
        !matches!(self, RoomRole::Observer)
    }

    pub fn can_produce(self) -> bool {
        !matches!(self, RoomRole::Observer)
    }
}

/// Per-room policy captured from the config source at room creation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomOptions {
    /// 0 = unlimited
    pub max_video_producers: usize,
    pub allow_observers: bool,
    /// 0 = unlimited
    pub max_observers: usize,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            max_video_producers: 0,
            allow_observers: true,
            max_observers: 0,
        }
    }
}

/// Control-plane record of a producer that lives in a room.
#[derive(Debug, Clone)]
pub struct RoomProducer {
    pub client_id: String,
    pub kind: MediaKind,
    pub created_at: SystemTime,
}

/// Room state. Member insertion order is preserved so ownership can be
/// reassigned to the longest-standing eligible member.
pub struct Room {
    pub name: String,
    members: Vec<String>,
    member_roles: HashMap<String, RoomRole>,
    pub owner_id: Option<String>,
    pub producers: HashMap<String, RoomProducer>,
    pub options: RoomOptions,
}

impl Room {
    fn new(name: String, options: RoomOptions) -> Self {
        Self {
            name,
            members: Vec::new(),
            member_roles: HashMap::new(),
            owner_id: None,
            producers: HashMap::new(),
            options,
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_member(&self, client_id: &str) -> bool {
        self.member_roles.contains_key(client_id)
    }

    pub fn role_of(&self, client_id: &str) -> Option<RoomRole> {
        self.member_roles.get(client_id).copied()
    }

    pub fn observer_count(&self) -> usize {
        self.member_roles
            .values()
            .filter(|r| matches!(r, RoomRole::Observer))
            .count()
    }

    pub fn moderators(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|id| matches!(self.member_roles.get(*id), Some(RoomRole::Moderator)))
            .cloned()
            .collect()
    }

    /// Adds a member, or updates the role of an existing one. Ownership goes
    /// to the first non-observer member and is never taken from a live owner.
    pub fn add_member(&mut self, client_id: &str, role: RoomRole) {
        if self.member_roles.insert(client_id.to_string(), role).is_none() {
            self.members.push(client_id.to_string());
        }
        if self.owner_id.is_none() && role.can_own() {
            self.owner_id = Some(client_id.to_string());
        }
    }

    /// Removes a member, reassigning ownership to the next publisher or
    /// moderator in insertion order. Safe to call twice.
    pub fn remove_member(&mut self, client_id: &str) -> bool {
        if self.member_roles.remove(client_id).is_none() {
            return false;
        }
        self.members.retain(|id| id != client_id);

        if self.owner_id.as_deref() == Some(client_id) {
            self.owner_id = self
                .members
                .iter()
                .find(|id| {
                    self.member_roles
                        .get(*id)
                        .map(|r| r.can_own())
                        .unwrap_or(false)
                })
                .cloned();
        }
        true
    }

    pub fn video_producer_count(&self) -> usize {
        self.producers
            .values()
            .filter(|p| p.kind == MediaKind::Video)
            .count()
    }

    pub fn producers_payload(&self) -> Vec<ProducerEntry> {
        self.producers
            .iter()
            .map(|(id, p)| ProducerEntry {
                producer_id: id.clone(),
                kind: p.kind,
                client_id: p.client_id.clone(),
            })
            .collect()
    }
}

/// Admin overview row for one room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomOverview {
    pub name: String,
    pub members: usize,
    pub observers: usize,
    pub moderators: usize,
    pub producers: usize,
    pub video_producers: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub id: String,
    pub role: RoomRole,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomProducerInfo {
    pub producer_id: String,
    pub client_id: String,
    pub kind: MediaKind,
    pub created_at_secs: u64,
}

/// Full admin detail for one room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub options: RoomOptions,
    pub members: Vec<MemberInfo>,
    pub producers: Vec<RoomProducerInfo>,
}

/// Process-wide map of room name to room state.
pub struct RoomRegistry {
    inner: StdRwLock<HashMap<String, Room>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: StdRwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Room>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Room>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Idempotent get-or-create. Returns true when the room was created.
    pub fn ensure(&self, name: &str, defaults: &RoomOptions) -> bool {
        let mut rooms = self.write();
        if rooms.contains_key(name) {
            return false;
        }
        info!("Creating room {}", name);
        rooms.insert(name.to_string(), Room::new(name.to_string(), defaults.clone()));
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.read().len()
    }

    pub fn with_room<R>(&self, name: &str, f: impl FnOnce(&Room) -> R) -> Option<R> {
        self.read().get(name).map(f)
    }

    pub fn with_room_mut<R>(&self, name: &str, f: impl FnOnce(&mut Room) -> R) -> Option<R> {
        self.write().get_mut(name).map(f)
    }

    pub fn member_ids(&self, name: &str) -> Vec<String> {
        self.with_room(name, |room| room.members().to_vec())
            .unwrap_or_default()
    }

    /// Removes a member. Returns true when the member was present.
    pub fn remove_member(&self, name: &str, client_id: &str) -> bool {
        self.with_room_mut(name, |room| {
            let removed = room.remove_member(client_id);
            if removed {
                info!("Client {} left room {}", client_id, name);
            }
            removed
        })
        .unwrap_or(false)
    }

    /// Deletes the room if it has no members. Returns true when deleted.
    pub fn delete_if_empty(&self, name: &str) -> bool {
        let mut rooms = self.write();
        if rooms
            .get(name)
            .map(|room| room.member_count() == 0)
            .unwrap_or(false)
        {
            rooms.remove(name);
            info!("Room {} is empty, cleaning up", name);
            return true;
        }
        false
    }

    /// Closes every producer the client owns in this room: the engine side is
    /// best-effort, the control-plane entries are always removed so that
    /// registry state never outlives a failed engine. Returns the removed
    /// producer ids.
    pub async fn close_client_producers(
        &self,
        name: &str,
        client_id: &str,
        media: Option<&Arc<MediaAdapter>>,
    ) -> Vec<String> {
        let owned: Vec<String> = self
            .with_room(name, |room| {
                room.producers
                    .iter()
                    .filter(|(_, p)| p.client_id == client_id)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();

        if let Some(media) = media {
            for producer_id in &owned {
                if let Err(e) = media.close_producer(producer_id).await {
                    warn!("Failed to close producer {} in room {}: {}", producer_id, name, e);
                }
            }
        }

        self.with_room_mut(name, |room| {
            let mut removed = Vec::new();
            for producer_id in &owned {
                if room.producers.remove(producer_id).is_some() {
                    removed.push(producer_id.clone());
                }
            }
            removed
        })
        .unwrap_or_else(|| {
            debug!("Room {} vanished while closing producers for {}", name, client_id);
            Vec::new()
        })
    }

    pub fn summaries(&self) -> Vec<RoomSummary> {
        self.read()
            .values()
            .map(|room| RoomSummary {
                name: room.name.clone(),
                count: room.member_count(),
            })
            .collect()
    }

    pub fn overview(&self) -> Vec<RoomOverview> {
        self.read()
            .values()
            .map(|room| RoomOverview {
                name: room.name.clone(),
                members: room.member_count(),
                observers: room.observer_count(),
                moderators: room.moderators().len(),
                producers: room.producers.len(),
                video_producers: room.video_producer_count(),
                owner_id: room.owner_id.clone(),
            })
            .collect()
    }

    pub fn info(&self, name: &str) -> Option<RoomInfo> {
        self.with_room(name, |room| RoomInfo {
            name: room.name.clone(),
            owner_id: room.owner_id.clone(),
            options: room.options.clone(),
            members: room
                .members()
                .iter()
                .map(|id| MemberInfo {
                    id: id.clone(),
                    role: room.role_of(id).unwrap_or(RoomRole::Publisher),
                })
                .collect(),
            producers: room
                .producers
                .iter()
                .map(|(id, p)| RoomProducerInfo {
                    producer_id: id.clone(),
                    client_id: p.client_id.clone(),
                    kind: p.kind,
                    created_at_secs: p
                        .created_at
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs(),
                })
                .collect(),
        })
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_room(name: &str) -> RoomRegistry {
        let registry = RoomRegistry::new();
        registry.ensure(name, &RoomOptions::default());
        registry
    }

    #[test]
    fn test_role_capabilities() {
        assert!(RoomRole::Publisher.can_produce());
        assert!(RoomRole::Moderator.can_produce());
        assert!(!RoomRole::Observer.can_produce());
        assert!(RoomRole::Publisher.can_own());
        assert!(RoomRole::Moderator.can_own());
        assert!(!RoomRole::Observer.can_own());
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let registry = RoomRegistry::new();
        assert!(registry.ensure("r", &RoomOptions::default()));
        assert!(!registry.ensure("r", &RoomOptions::default()));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_first_publisher_owns_room() {
        let registry = registry_with_room("r");
        registry.with_room_mut("r", |room| {
            room.add_member("obs", RoomRole::Observer);
            room.add_member("pub", RoomRole::Publisher);
        });
        assert_eq!(
            registry.with_room("r", |r| r.owner_id.clone()).unwrap(),
            Some("pub".to_string())
        );
    }

    #[test]
    fn test_owner_reassigned_in_join_order() {
        let registry = registry_with_room("r");
        registry.with_room_mut("r", |room| {
            room.add_member("a", RoomRole::Publisher);
            room.add_member("o", RoomRole::Observer);
            room.add_member("b", RoomRole::Moderator);
            room.add_member("c", RoomRole::Publisher);
            assert_eq!(room.owner_id.as_deref(), Some("a"));

            room.remove_member("a");
            // observer "o" is skipped; moderator "b" is next in insertion order
            assert_eq!(room.owner_id.as_deref(), Some("b"));

            room.remove_member("b");
            assert_eq!(room.owner_id.as_deref(), Some("c"));

            room.remove_member("c");
            assert_eq!(room.owner_id, None);
        });
    }

    #[test]
    fn test_remove_member_is_idempotent() {
        let registry = registry_with_room("r");
        registry.with_room_mut("r", |room| {
            room.add_member("a", RoomRole::Publisher);
        });
        assert!(registry.remove_member("r", "a"));
        assert!(!registry.remove_member("r", "a"));
    }

    #[test]
    fn test_delete_if_empty() {
        let registry = registry_with_room("r");
        registry.with_room_mut("r", |room| room.add_member("a", RoomRole::Publisher));
        assert!(!registry.delete_if_empty("r"));
        registry.remove_member("r", "a");
        assert!(registry.delete_if_empty("r"));
        assert!(!registry.contains("r"));
        // Second call on a missing room is a no-op
        assert!(!registry.delete_if_empty("r"));
    }

    #[test]
    fn test_rejoin_updates_role_without_duplicating_member() {
        let registry = registry_with_room("r");
        registry.with_room_mut("r", |room| {
            room.add_member("a", RoomRole::Publisher);
            room.add_member("a", RoomRole::Observer);
            assert_eq!(room.member_count(), 1);
            assert_eq!(room.role_of("a"), Some(RoomRole::Observer));
        });
    }

    #[test]
    fn test_video_producer_count() {
        let registry = registry_with_room("r");
        registry.with_room_mut("r", |room| {
            room.add_member("a", RoomRole::Publisher);
            room.producers.insert(
                "p1".into(),
                RoomProducer {
                    client_id: "a".into(),
                    kind: MediaKind::Video,
                    created_at: SystemTime::now(),
                },
            );
            room.producers.insert(
                "p2".into(),
                RoomProducer {
                    client_id: "a".into(),
                    kind: MediaKind::Audio,
                    created_at: SystemTime::now(),
                },
            );
            assert_eq!(room.video_producer_count(), 1);
        });
    }

    #[tokio::test]
    async fn test_close_client_producers_removes_entries_without_engine() {
        let registry = registry_with_room("r");
        registry.with_room_mut("r", |room| {
            room.add_member("a", RoomRole::Publisher);
            room.add_member("b", RoomRole::Publisher);
            for (id, owner) in [("p1", "a"), ("p2", "a"), ("p3", "b")] {
                room.producers.insert(
                    id.into(),
                    RoomProducer {
                        client_id: owner.into(),
                        kind: MediaKind::Video,
                        created_at: SystemTime::now(),
                    },
                );
            }
        });

        let mut removed = registry.close_client_producers("r", "a", None).await;
        removed.sort();
        assert_eq!(removed, vec!["p1".to_string(), "p2".to_string()]);
        registry.with_room("r", |room| {
            assert_eq!(room.producers.len(), 1);
            assert!(room.producers.contains_key("p3"));
        });

        // second invocation finds nothing
        assert!(registry.close_client_producers("r", "a", None).await.is_empty());
    }

    #[test]
    fn test_overview_and_info() {
        let registry = registry_with_room("r");
        registry.with_room_mut("r", |room| {
            room.add_member("a", RoomRole::Publisher);
            room.add_member("o", RoomRole::Observer);
            room.add_member("m", RoomRole::Moderator);
        });

        let overview = registry.overview();
        assert_eq!(overview.len(), 1);
        assert_eq!(overview[0].members, 3);
        assert_eq!(overview[0].observers, 1);
        assert_eq!(overview[0].moderators, 1);
        assert_eq!(overview[0].owner_id.as_deref(), Some("a"));

        let info = registry.info("r").unwrap();
        assert_eq!(info.members.len(), 3);
        assert!(registry.info("missing").is_none());
    }
}
