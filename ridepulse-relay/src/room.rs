//! Per-ride room state: members, liveness, leader, current route.
//!
//! A `Room` is plain data; callers hold the room's mutex while touching it
//! (see [`crate::registry`]). Every method that changes membership restores
//! the leader invariant before returning:
//!
//! - no members  ⇔ no leader (and the room is marked closed)
//! - otherwise   ⇒ the leader is a current member
//!
//! Re-election picks the remaining member with the lowest join sequence
//! number, i.e. the longest-standing rider.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ridepulse_core::{ClientId, RoomId, RoutePlan};

use crate::peer::PeerHandle;
use crate::protocol::{now_millis, Outgoing, PresenceEntry, Role};

/// A connected member of a room.
#[derive(Debug)]
pub struct Member {
    peer: PeerHandle,
    join_seq: u64,
    last_seen: Instant,
    last_seen_ms: u64,
}

impl Member {
    fn new(peer: PeerHandle, join_seq: u64, now: Instant) -> Self {
        Self {
            peer,
            join_seq,
            last_seen: now,
            last_seen_ms: now_millis(),
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_seen = now;
        self.last_seen_ms = now_millis();
    }

    fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

/// State of one ride room.
#[derive(Debug)]
pub struct Room {
    id: RoomId,
    members: HashMap<ClientId, Member>,
    leader: Option<ClientId>,
    route: Option<RoutePlan>,
    next_seq: u64,
    closed: bool,
}

impl Room {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
            leader: None,
            route: None,
            next_seq: 0,
            closed: false,
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// A closed room lost its last member and must not be joined again;
    /// the registry replaces it with a fresh one.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn contains(&self, client_id: &ClientId) -> bool {
        self.members.contains_key(client_id)
    }

    pub fn leader(&self) -> Option<&ClientId> {
        self.leader.as_ref()
    }

    pub fn is_leader(&self, client_id: &ClientId) -> bool {
        self.leader.as_ref() == Some(client_id)
    }

    /// Last route accepted from the leader.
    pub fn current_route(&self) -> Option<&RoutePlan> {
        self.route.as_ref()
    }

    /// Add a member (or refresh an existing one) and return the leader.
    ///
    /// The first member of an empty room becomes leader. A rejoin keeps the
    /// member's original join order.
    pub fn insert(&mut self, client_id: ClientId, peer: PeerHandle, now: Instant) -> ClientId {
        match self.members.get_mut(&client_id) {
            Some(existing) => {
                existing.peer = peer;
                existing.touch(now);
            }
            None => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.members
                    .insert(client_id.clone(), Member::new(peer, seq, now));
            }
        }
        self.closed = false;
        self.leader.get_or_insert(client_id).clone()
    }

    /// Remove a member. Returns it if it was present.
    pub fn remove(&mut self, client_id: &ClientId) -> Option<Member> {
        let removed = self.members.remove(client_id)?;
        self.rebalance();
        Some(removed)
    }

    /// Refresh a member's liveness. Returns false for non-members.
    pub fn touch(&mut self, client_id: &ClientId, now: Instant) -> bool {
        match self.members.get_mut(client_id) {
            Some(member) => {
                member.touch(now);
                true
            }
            None => false,
        }
    }

    /// Hand leadership from `from` to `to`.
    ///
    /// Only the current leader may transfer, and only to a current member.
    pub fn transfer_leadership(&mut self, from: &ClientId, to: &ClientId) -> bool {
        if !self.is_leader(from) || !self.members.contains_key(to) {
            return false;
        }
        self.leader = Some(to.clone());
        true
    }

    /// Accept a new route if `from` is the leader.
    pub fn set_route(&mut self, from: &ClientId, route: RoutePlan) -> bool {
        if !self.is_leader(from) {
            return false;
        }
        self.route = Some(route);
        true
    }

    /// Remove every member silent for longer than `timeout`, closing their
    /// transports. Returns the evicted ids.
    pub fn evict_stale(&mut self, now: Instant, timeout: Duration) -> Vec<ClientId> {
        let stale: Vec<ClientId> = self
            .members
            .iter()
            .filter(|(_, m)| m.is_stale(now, timeout))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stale {
            if let Some(member) = self.members.remove(id) {
                member.peer.close();
            }
        }
        if !stale.is_empty() {
            self.rebalance();
        }
        stale
    }

    /// Restore the leader invariant after membership shrank.
    fn rebalance(&mut self) {
        if self.members.is_empty() {
            self.leader = None;
            self.closed = true;
            return;
        }
        let leader_present = self
            .leader
            .as_ref()
            .is_some_and(|l| self.members.contains_key(l));
        if !leader_present {
            self.leader = self
                .members
                .iter()
                .min_by_key(|(_, m)| m.join_seq)
                .map(|(id, _)| id.clone());
        }
    }

    /// Roster ordered by join sequence.
    pub fn roster(&self) -> Vec<PresenceEntry> {
        let mut members: Vec<(&ClientId, &Member)> = self.members.iter().collect();
        members.sort_by_key(|(_, m)| m.join_seq);
        members
            .into_iter()
            .map(|(id, m)| PresenceEntry {
                client_id: id.clone(),
                role: if self.is_leader(id) {
                    Role::Leader
                } else {
                    Role::Member
                },
                last_seen: m.last_seen_ms,
            })
            .collect()
    }

    /// Deliver to every member. Returns the number of queued frames.
    pub fn broadcast(&self, msg: &Outgoing) -> usize {
        self.fan_out(msg, None)
    }

    /// Deliver to every member except `except`.
    pub fn broadcast_except(&self, except: &ClientId, msg: &Outgoing) -> usize {
        self.fan_out(msg, Some(except))
    }

    /// Deliver to a single member. False if absent or unreachable.
    pub fn send_to(&self, to: &ClientId, msg: &Outgoing) -> bool {
        self.members.get(to).is_some_and(|m| m.peer.send(msg))
    }

    fn fan_out(&self, msg: &Outgoing, except: Option<&ClientId>) -> usize {
        let frame = match msg.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode broadcast for room {}: {e}", self.id);
                return 0;
            }
        };
        self.members
            .iter()
            .filter(|(id, _)| Some(*id) != except)
            .filter(|(_, m)| m.peer.send_frame(frame.clone()))
            .count()
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, client_id: &ClientId, by: Duration) {
        if let Some(member) = self.members.get_mut(client_id) {
            member.last_seen = member.last_seen.checked_sub(by).unwrap_or(member.last_seen);
        }
    }
}
