use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock};

use bulwark_contracts::{MembershipUpdate, ProtectedRoom};
use bulwark_kernel::Glob;

use crate::collaborators::Membership;

#[derive(Debug, Clone)]
struct RoomEntry {
    meta: ProtectedRoom,
    members: BTreeSet<String>,
}

/// Protected rooms and their joined members. Written by the membership
/// tracker, read by command handlers; guards never outlive a single call.
#[derive(Debug, Default)]
pub struct MembershipCache {
    rooms: RwLock<BTreeMap<String, RoomEntry>>,
}

impl MembershipCache {
    pub fn new(rooms: impl IntoIterator<Item = ProtectedRoom>) -> Self {
        let rooms = rooms
            .into_iter()
            .map(|meta| {
                (
                    meta.room_id.clone(),
                    RoomEntry {
                        meta,
                        members: BTreeSet::new(),
                    },
                )
            })
            .collect();
        Self {
            rooms: RwLock::new(rooms),
        }
    }

    pub fn apply(&self, update: &MembershipUpdate) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let entry = rooms
            .entry(update.room_id.clone())
            .or_insert_with(|| RoomEntry {
                meta: ProtectedRoom {
                    room_id: update.room_id.clone(),
                    name: String::new(),
                },
                members: BTreeSet::new(),
            });
        if let Some(name) = &update.name {
            entry.meta.name = name.clone();
        }
        for user in &update.left {
            entry.members.remove(user);
        }
        entry.members.extend(update.joined.iter().cloned());
    }
}

impl Membership for MembershipCache {
    fn find_matching_users(&self, pattern: &Glob, scope: Option<&[String]>) -> Vec<String> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        let mut users = BTreeSet::new();
        for (room_id, entry) in rooms.iter() {
            if scope.is_some_and(|s| !s.contains(room_id)) {
                continue;
            }
            users.extend(entry.members.iter().filter(|u| pattern.is_match(u)).cloned());
        }
        users.into_iter().collect()
    }

    fn rooms_user_is_in(&self, user_id: &str) -> Vec<String> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        rooms
            .iter()
            .filter(|(_, e)| e.members.contains(user_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn room_names(&self, room_ids: &[String]) -> Vec<String> {
        let rooms = self.rooms.read().unwrap_or_else(PoisonError::into_inner);
        room_ids
            .iter()
            .map(|id| match rooms.get(id) {
                Some(entry) if !entry.meta.name.is_empty() => entry.meta.name.clone(),
                _ => id.clone(),
            })
            .collect()
    }
}
