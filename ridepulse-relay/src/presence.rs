//! Presence broadcaster.
//!
//! Every membership or leadership change sends the complete roster to the
//! room. There is no diffing: a client that missed an update heals on the
//! next snapshot.

use crate::protocol::Outgoing;
use crate::room::Room;

/// Build the presence envelope for a room. `None` for an empty room.
pub fn snapshot(room: &Room) -> Option<Outgoing> {
    let leader_id = room.leader()?.clone();
    Some(Outgoing::Presence {
        room_id: room.id().clone(),
        clients: room.roster(),
        leader_id,
    })
}

/// Send the current roster to every member. Returns the number of members
/// reached.
pub fn broadcast(room: &Room) -> usize {
    match snapshot(room) {
        Some(msg) => {
            let reached = room.broadcast(&msg);
            log::debug!(
                "Presence for room {}: {} members, {reached} reached",
                room.id(),
                room.len()
            );
            reached
        }
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerHandle;
    use crate::protocol::Role;
    use ridepulse_core::{ClientId, RoomId};
    use std::time::Instant;

    #[test]
    fn test_empty_room_has_no_snapshot() {
        let room = Room::new(RoomId::new("R"));
        assert!(snapshot(&room).is_none());
        assert_eq!(broadcast(&room), 0);
    }

    #[tokio::test]
    async fn test_snapshot_lists_everyone_with_roles() {
        let mut room = Room::new(RoomId::new("R"));
        let (p1, mut r1) = PeerHandle::channel(4);
        let (p2, mut r2) = PeerHandle::channel(4);
        room.insert(ClientId::new("c1"), p1, Instant::now());
        room.insert(ClientId::new("c2"), p2, Instant::now());

        assert_eq!(broadcast(&room), 2);

        for rx in [&mut r1, &mut r2] {
            let frame = rx.try_recv().unwrap();
            match Outgoing::decode(&frame).unwrap() {
                Outgoing::Presence {
                    clients, leader_id, ..
                } => {
                    assert_eq!(leader_id, ClientId::new("c1"));
                    assert_eq!(clients.len(), 2);
                    assert_eq!(clients[0].role, Role::Leader);
                    assert_eq!(clients[1].role, Role::Member);
                }
                other => panic!("Expected presence, got {other:?}"),
            }
        }
    }
}
