//! Room registry: maps room ids to individually locked rooms.
//!
//! Two locking levels:
//! - the registry map (`RwLock`), held only to look up, insert or remove;
//! - one `Mutex` per room, held for every read or mutation of that room.
//!
//! The registry lock is never acquired while a room lock is held. A room
//! that empties is marked closed under its own lock and then unlinked here;
//! a join that finds a closed room unlinks it and retries on a fresh one.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use ridepulse_core::RoomId;

use crate::room::Room;

/// A room behind its exclusive lock.
pub type SharedRoom = Arc<Mutex<Room>>;

#[derive(Default)]
pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomId, SharedRoom>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live room.
    pub async fn get(&self, room_id: &RoomId) -> Option<SharedRoom> {
        self.rooms.read().await.get(room_id).cloned()
    }

    /// Get or create the room for `room_id`.
    pub async fn get_or_create(&self, room_id: &RoomId) -> SharedRoom {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return room.clone();
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.clone())
            .or_insert_with(|| {
                log::info!("Room {room_id} created");
                Arc::new(Mutex::new(Room::new(room_id.clone())))
            })
            .clone()
    }

    /// Unlink `room` if it is still the registered instance for `room_id`.
    ///
    /// Callers only pass rooms they observed closed. A newer room under the
    /// same id is left alone.
    pub async fn remove(&self, room_id: &RoomId, room: &SharedRoom) -> bool {
        let mut rooms = self.rooms.write().await;
        match rooms.get(room_id) {
            Some(current) if Arc::ptr_eq(current, room) => {
                rooms.remove(room_id);
                log::info!("Room {room_id} removed (empty)");
                true
            }
            _ => false,
        }
    }

    /// Point-in-time copy of all rooms, for sweeping without holding the
    /// registry lock.
    pub async fn snapshot(&self) -> Vec<(RoomId, SharedRoom)> {
        self.rooms
            .read()
            .await
            .iter()
            .map(|(id, room)| (id.clone(), room.clone()))
            .collect()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.read().await.contains_key(room_id)
    }
}
