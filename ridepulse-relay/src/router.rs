//! Message router: applies the per-type routing policy.
//!
//! | Type            | Delivery                                              |
//! |-----------------|-------------------------------------------------------|
//! | join            | `joined` ack to sender + presence to room             |
//! | heartbeat       | `pong` to sender                                      |
//! | chat            | everyone, sender included                             |
//! | rtc-offer       | `to` if given, else everyone but sender               |
//! | rtc-answer      | `to` only                                             |
//! | rtc-ice         | `to` only                                             |
//! | location        | everyone but sender                                   |
//! | route-set       | leader only; then everyone, sender included           |
//! | leader-transfer | leader only, to a member; presence + ack to requester |
//!
//! Every non-join envelope first refreshes the sender's liveness. Anything
//! that violates the policy is dropped without a reply and reported as a
//! [`DropReason`].

use std::fmt;
use std::time::{Duration, Instant};

use ridepulse_core::{ClientId, RoomId};

use crate::peer::PeerHandle;
use crate::presence;
use crate::protocol::{now_millis, Incoming, Outgoing};
use crate::registry::RoomRegistry;

/// Per-connection routing state.
#[derive(Debug)]
pub struct Session {
    client_id: ClientId,
    peer: PeerHandle,
    room: Option<RoomId>,
}

impl Session {
    pub fn new(client_id: ClientId, peer: PeerHandle) -> Self {
        Self {
            client_id,
            peer,
            room: None,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// Room this connection has joined, if any.
    pub fn room(&self) -> Option<&RoomId> {
        self.room.as_ref()
    }

    pub fn peer(&self) -> &PeerHandle {
        &self.peer
    }
}

/// Why an envelope produced no effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Addressed to a room this connection has not joined.
    NotJoined,
    /// The room no longer exists.
    UnknownRoom,
    /// The sender is no longer a member (evicted).
    NotMember,
    /// Directed at a client that is not in the room.
    UnknownTarget,
    /// Leader-only operation from a non-leader.
    NotLeader,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotJoined => "room not joined",
            Self::UnknownRoom => "unknown room",
            Self::NotMember => "sender not a member",
            Self::UnknownTarget => "target not in room",
            Self::NotLeader => "sender is not the leader",
        };
        f.write_str(s)
    }
}

/// Result of routing one envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Number of frames queued for delivery.
    Delivered(usize),
    Dropped(DropReason),
}

/// The transport-independent relay core.
#[derive(Default)]
pub struct Relay {
    registry: RoomRegistry,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Route one decoded envelope from `session`.
    pub async fn dispatch(&self, session: &mut Session, envelope: Incoming) -> Outcome {
        let kind = envelope.kind();
        let outcome = match envelope {
            Incoming::Join { room_id, .. } => self.join(session, room_id).await,
            other => self.route(session, other).await,
        };
        if let Outcome::Dropped(reason) = outcome {
            log::debug!("Dropped {kind} from {}: {reason}", session.client_id);
        }
        outcome
    }

    /// Attach `session` to `room_id`, creating the room if needed.
    pub async fn join(&self, session: &mut Session, room_id: RoomId) -> Outcome {
        if session.room.as_ref().is_some_and(|current| *current != room_id) {
            self.leave(session).await;
        }

        loop {
            let shared = self.registry.get_or_create(&room_id).await;
            let mut room = shared.lock().await;
            if room.is_closed() {
                // Lost a race with the room's last member leaving.
                drop(room);
                self.registry.remove(&room_id, &shared).await;
                continue;
            }

            let leader_id = room.insert(
                session.client_id.clone(),
                session.peer.clone(),
                Instant::now(),
            );
            session.room = Some(room_id.clone());

            let ack = Outgoing::Joined {
                room_id: room_id.clone(),
                client_id: session.client_id.clone(),
                leader_id: leader_id.clone(),
            };
            let acked = usize::from(session.peer.send(&ack));
            let reached = presence::broadcast(&room);

            log::info!(
                "Client {} joined room {room_id} ({} members, leader {leader_id})",
                session.client_id,
                room.len()
            );
            return Outcome::Delivered(acked + reached);
        }
    }

    /// Detach `session` from its room. No-op if it never joined or was
    /// already evicted.
    pub async fn leave(&self, session: &mut Session) {
        let Some(room_id) = session.room.take() else {
            return;
        };
        let Some(shared) = self.registry.get(&room_id).await else {
            return;
        };

        let mut room = shared.lock().await;
        if room.remove(&session.client_id).is_none() {
            return;
        }
        log::info!("Client {} left room {room_id}", session.client_id);

        if room.is_closed() {
            drop(room);
            self.registry.remove(&room_id, &shared).await;
        } else {
            presence::broadcast(&room);
        }
    }

    /// Evict members silent for longer than `timeout` from every room.
    /// Returns the number of evicted members.
    pub async fn sweep(&self, now: Instant, timeout: Duration) -> usize {
        let mut total = 0;
        for (room_id, shared) in self.registry.snapshot().await {
            let mut room = shared.lock().await;
            let evicted = room.evict_stale(now, timeout);
            if evicted.is_empty() {
                continue;
            }
            total += evicted.len();
            for client_id in &evicted {
                log::warn!("Evicted {client_id} from room {room_id}: heartbeat timeout");
            }

            if room.is_closed() {
                drop(room);
                self.registry.remove(&room_id, &shared).await;
            } else {
                presence::broadcast(&room);
            }
        }
        total
    }

    async fn route(&self, session: &mut Session, envelope: Incoming) -> Outcome {
        if session.room.as_ref() != Some(envelope.room_id()) {
            return Outcome::Dropped(DropReason::NotJoined);
        }
        let room_id = envelope.room_id().clone();
        let Some(shared) = self.registry.get(&room_id).await else {
            return Outcome::Dropped(DropReason::UnknownRoom);
        };

        let mut room = shared.lock().await;
        let from = session.client_id.clone();
        if !room.touch(&from, Instant::now()) {
            return Outcome::Dropped(DropReason::NotMember);
        }

        match envelope {
            // Joins never get here; `dispatch` sends them to `join`.
            Incoming::Join { .. } => Outcome::Delivered(0),

            Incoming::Heartbeat { .. } => {
                let pong = Outgoing::Pong {
                    room_id,
                    ts: now_millis(),
                };
                Outcome::Delivered(usize::from(session.peer.send(&pong)))
            }

            Incoming::Chat { body, .. } => {
                let msg = Outgoing::Chat {
                    room_id,
                    from,
                    body,
                    ts: now_millis(),
                };
                Outcome::Delivered(room.broadcast(&msg))
            }

            Incoming::RtcOffer { sdp, to, .. } => {
                let msg = Outgoing::RtcOffer {
                    room_id,
                    from: from.clone(),
                    sdp,
                };
                match to {
                    Some(to) => direct(&room, &to, &msg),
                    None => Outcome::Delivered(room.broadcast_except(&from, &msg)),
                }
            }

            Incoming::RtcAnswer { sdp, to, .. } => {
                let msg = Outgoing::RtcAnswer {
                    room_id,
                    from,
                    sdp,
                    to: to.clone(),
                };
                direct(&room, &to, &msg)
            }

            Incoming::RtcIce { candidate, to, .. } => {
                let msg = Outgoing::RtcIce {
                    room_id,
                    from,
                    candidate,
                    to: to.clone(),
                };
                direct(&room, &to, &msg)
            }

            Incoming::Location {
                rider_id,
                lat,
                lng,
                heading,
                speed,
                ts,
                ..
            } => {
                let msg = Outgoing::Location {
                    room_id,
                    rider_id,
                    from: from.clone(),
                    lat,
                    lng,
                    heading,
                    speed,
                    ts,
                };
                Outcome::Delivered(room.broadcast_except(&from, &msg))
            }

            Incoming::RouteSet { route, .. } => {
                if !room.set_route(&from, route.clone()) {
                    return Outcome::Dropped(DropReason::NotLeader);
                }
                log::info!(
                    "Route {} set in room {room_id} by {from} ({} waypoints)",
                    route.id,
                    route.waypoints().count()
                );
                let msg = Outgoing::RouteSet {
                    room_id,
                    route,
                    from,
                };
                Outcome::Delivered(room.broadcast(&msg))
            }

            Incoming::LeaderTransfer { to, .. } => {
                if !room.is_leader(&from) {
                    return Outcome::Dropped(DropReason::NotLeader);
                }
                if !room.transfer_leadership(&from, &to) {
                    return Outcome::Dropped(DropReason::UnknownTarget);
                }
                log::info!("Leadership of room {room_id} moved from {from} to {to}");
                let reached = presence::broadcast(&room);
                let ack = Outgoing::LeaderTransfer {
                    room_id,
                    leader_id: to,
                };
                Outcome::Delivered(reached + usize::from(session.peer.send(&ack)))
            }
        }
    }
}

fn direct(room: &crate::room::Room, to: &ClientId, msg: &Outgoing) -> Outcome {
    if !room.contains(to) {
        return Outcome::Dropped(DropReason::UnknownTarget);
    }
    Outcome::Delivered(usize::from(room.send_to(to, msg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use ridepulse_core::{RoutePlan, RouteStop};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct TestClient {
        session: Session,
        rx: mpsc::Receiver<Arc<str>>,
    }

    impl TestClient {
        fn new(id: &str) -> Self {
            let (peer, rx) = PeerHandle::channel(64);
            Self {
                session: Session::new(ClientId::new(id), peer),
                rx,
            }
        }

        fn id(&self) -> ClientId {
            self.session.client_id().clone()
        }

        fn drain(&mut self) -> Vec<Outgoing> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(Outgoing::decode(&frame).unwrap());
            }
            out
        }
    }

    fn room() -> RoomId {
        RoomId::new("R1")
    }

    fn route() -> RoutePlan {
        RoutePlan::new(
            "route-1",
            RouteStop::new("a", "Start", 0.0, 0.0),
            RouteStop::new("b", "End", 1.0, 1.0),
        )
    }

    async fn join(relay: &Relay, client: &mut TestClient) -> Outcome {
        relay
            .dispatch(
                &mut client.session,
                Incoming::Join {
                    room_id: room(),
                    rider_id: None,
                },
            )
            .await
    }

    async fn leader_of(relay: &Relay, id: &RoomId) -> Option<ClientId> {
        let shared = relay.registry().get(id).await?;
        let room = shared.lock().await;
        room.leader().cloned()
    }

    #[tokio::test]
    async fn test_join_acks_and_broadcasts_presence() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");

        join(&relay, &mut a).await;
        let msgs = a.drain();
        assert!(matches!(&msgs[0], Outgoing::Joined { leader_id, .. } if *leader_id == a.id()));
        assert!(matches!(&msgs[1], Outgoing::Presence { clients, .. } if clients.len() == 1));

        join(&relay, &mut b).await;
        let b_msgs = b.drain();
        assert!(matches!(&b_msgs[0], Outgoing::Joined { leader_id, .. } if *leader_id == a.id()));
        let a_msgs = a.drain();
        assert!(matches!(&a_msgs[0], Outgoing::Presence { clients, .. } if clients.len() == 2));
        assert_eq!(leader_of(&relay, &room()).await, Some(a.id()));
    }

    #[tokio::test]
    async fn test_heartbeat_pongs_sender_only() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");
        join(&relay, &mut a).await;
        join(&relay, &mut b).await;
        a.drain();
        b.drain();

        let outcome = relay
            .dispatch(&mut a.session, Incoming::Heartbeat { room_id: room() })
            .await;
        assert_eq!(outcome, Outcome::Delivered(1));
        assert!(matches!(a.drain().as_slice(), [Outgoing::Pong { .. }]));
        assert!(b.drain().is_empty());
    }

    #[tokio::test]
    async fn test_chat_echoes_to_sender() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");
        join(&relay, &mut a).await;
        join(&relay, &mut b).await;
        a.drain();
        b.drain();

        let outcome = relay
            .dispatch(
                &mut b.session,
                Incoming::Chat {
                    room_id: room(),
                    body: "hi".into(),
                },
            )
            .await;
        assert_eq!(outcome, Outcome::Delivered(2));
        for msgs in [a.drain(), b.drain()] {
            assert!(
                matches!(msgs.as_slice(), [Outgoing::Chat { from, body, .. }] if from.as_str() == "b" && body == "hi")
            );
        }
    }

    #[tokio::test]
    async fn test_location_skips_sender() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");
        join(&relay, &mut a).await;
        join(&relay, &mut b).await;
        a.drain();
        b.drain();

        relay
            .dispatch(
                &mut a.session,
                Incoming::Location {
                    room_id: room(),
                    rider_id: "rider-a".into(),
                    lat: 1.0,
                    lng: 2.0,
                    heading: None,
                    speed: Some(5.0),
                    ts: 10.0,
                },
            )
            .await;
        assert!(a.drain().is_empty());
        let got = b.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].rider_location().unwrap().speed, Some(5.0));
    }

    #[tokio::test]
    async fn test_rtc_directed_delivery() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");
        let mut c = TestClient::new("c");
        for client in [&mut a, &mut b, &mut c] {
            join(&relay, client).await;
        }
        a.drain();
        b.drain();
        c.drain();

        // Untargeted offer goes to everyone but the sender.
        relay
            .dispatch(
                &mut a.session,
                Incoming::RtcOffer {
                    room_id: room(),
                    sdp: "offer".into(),
                    to: None,
                },
            )
            .await;
        assert!(a.drain().is_empty());
        assert_eq!(b.drain().len(), 1);
        assert_eq!(c.drain().len(), 1);

        // Targeted offer, answer and ice reach only the target.
        relay
            .dispatch(
                &mut a.session,
                Incoming::RtcOffer {
                    room_id: room(),
                    sdp: "offer".into(),
                    to: Some(b.id()),
                },
            )
            .await;
        relay
            .dispatch(
                &mut b.session,
                Incoming::RtcAnswer {
                    room_id: room(),
                    sdp: "answer".into(),
                    to: a.id(),
                },
            )
            .await;
        relay
            .dispatch(
                &mut b.session,
                Incoming::RtcIce {
                    room_id: room(),
                    candidate: serde_json::json!({"candidate": "x"}),
                    to: a.id(),
                },
            )
            .await;

        let a_msgs = a.drain();
        assert!(matches!(&a_msgs[0], Outgoing::RtcAnswer { from, .. } if *from == b.id()));
        assert!(matches!(&a_msgs[1], Outgoing::RtcIce { .. }));
        assert!(matches!(b.drain().as_slice(), [Outgoing::RtcOffer { .. }]));
        assert!(c.drain().is_empty());
    }

    #[tokio::test]
    async fn test_directed_to_absent_target_dropped() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        join(&relay, &mut a).await;
        a.drain();

        let outcome = relay
            .dispatch(
                &mut a.session,
                Incoming::RtcAnswer {
                    room_id: room(),
                    sdp: "answer".into(),
                    to: ClientId::new("ghost"),
                },
            )
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnknownTarget));
        assert!(a.drain().is_empty());
    }

    #[tokio::test]
    async fn test_route_set_leader_only() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");
        join(&relay, &mut a).await;
        join(&relay, &mut b).await;
        a.drain();
        b.drain();

        let rejected = relay
            .dispatch(
                &mut b.session,
                Incoming::RouteSet {
                    room_id: room(),
                    route: route(),
                },
            )
            .await;
        assert_eq!(rejected, Outcome::Dropped(DropReason::NotLeader));
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());
        {
            let shared = relay.registry().get(&room()).await.unwrap();
            assert!(shared.lock().await.current_route().is_none());
        }

        let accepted = relay
            .dispatch(
                &mut a.session,
                Incoming::RouteSet {
                    room_id: room(),
                    route: route(),
                },
            )
            .await;
        assert_eq!(accepted, Outcome::Delivered(2));
        assert!(matches!(a.drain().as_slice(), [Outgoing::RouteSet { .. }]));
        assert!(matches!(b.drain().as_slice(), [Outgoing::RouteSet { from, .. }] if *from == a.id()));
        let shared = relay.registry().get(&room()).await.unwrap();
        assert_eq!(
            shared.lock().await.current_route().map(|r| r.id.clone()),
            Some("route-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_leader_transfer() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");
        join(&relay, &mut a).await;
        join(&relay, &mut b).await;
        a.drain();
        b.drain();

        // Non-leader request is ignored.
        let b_id = b.id();
        let outcome = relay
            .dispatch(
                &mut b.session,
                Incoming::LeaderTransfer {
                    room_id: room(),
                    to: b_id,
                },
            )
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::NotLeader));

        // Transfer to a non-member is ignored.
        let outcome = relay
            .dispatch(
                &mut a.session,
                Incoming::LeaderTransfer {
                    room_id: room(),
                    to: ClientId::new("ghost"),
                },
            )
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::UnknownTarget));
        assert!(a.drain().is_empty());
        assert!(b.drain().is_empty());

        relay
            .dispatch(
                &mut a.session,
                Incoming::LeaderTransfer {
                    room_id: room(),
                    to: b.id(),
                },
            )
            .await;
        let a_msgs = a.drain();
        assert!(matches!(&a_msgs[0], Outgoing::Presence { leader_id, .. } if *leader_id == b.id()));
        assert!(matches!(&a_msgs[1], Outgoing::LeaderTransfer { leader_id, .. } if *leader_id == b.id()));
        let b_msgs = b.drain();
        assert!(matches!(b_msgs.as_slice(), [Outgoing::Presence { clients, .. }]
            if clients.iter().any(|c| c.client_id == b.id() && c.role == Role::Leader)));
        assert_eq!(leader_of(&relay, &room()).await, Some(b.id()));
    }

    #[tokio::test]
    async fn test_unjoined_room_dropped() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");

        let outcome = relay
            .dispatch(
                &mut a.session,
                Incoming::Chat {
                    room_id: room(),
                    body: "anyone?".into(),
                },
            )
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::NotJoined));

        join(&relay, &mut a).await;
        let outcome = relay
            .dispatch(
                &mut a.session,
                Incoming::Chat {
                    room_id: RoomId::new("other"),
                    body: "wrong room".into(),
                },
            )
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::NotJoined));
    }

    #[tokio::test]
    async fn test_leave_reelects_and_destroys_empty_room() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");
        join(&relay, &mut a).await;
        join(&relay, &mut b).await;
        b.drain();

        relay.leave(&mut a.session).await;
        assert_eq!(leader_of(&relay, &room()).await, Some(b.id()));
        assert!(matches!(b.drain().as_slice(), [Outgoing::Presence { leader_id, clients, .. }]
            if *leader_id == b.id() && clients.len() == 1));

        relay.leave(&mut b.session).await;
        assert!(!relay.registry().contains(&room()).await);

        // Leaving twice is harmless.
        relay.leave(&mut b.session).await;

        // A later join recreates the room with a fresh leader.
        let mut c = TestClient::new("c");
        join(&relay, &mut c).await;
        assert_eq!(leader_of(&relay, &room()).await, Some(c.id()));
    }

    #[tokio::test]
    async fn test_switching_rooms_leaves_previous() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        join(&relay, &mut a).await;

        relay
            .dispatch(
                &mut a.session,
                Incoming::Join {
                    room_id: RoomId::new("R2"),
                    rider_id: None,
                },
            )
            .await;
        assert!(!relay.registry().contains(&room()).await);
        assert_eq!(a.session.room(), Some(&RoomId::new("R2")));
    }

    #[tokio::test]
    async fn test_sweep_evicts_silent_members() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        let mut b = TestClient::new("b");
        join(&relay, &mut a).await;
        join(&relay, &mut b).await;
        a.drain();
        b.drain();

        // Only `b` stays alive past the timeout.
        let later = Instant::now() + Duration::from_secs(31);
        {
            let shared = relay.registry().get(&room()).await.unwrap();
            shared.lock().await.touch(&b.id(), later);
        }

        let evicted = relay.sweep(later, Duration::from_secs(30)).await;
        assert_eq!(evicted, 1);
        assert!(a.session.peer().is_closed());
        assert_eq!(leader_of(&relay, &room()).await, Some(b.id()));
        assert!(matches!(b.drain().as_slice(), [Outgoing::Presence { clients, .. }]
            if clients.len() == 1 && clients[0].client_id == b.id()));

        // The evicted connection's later traffic is ignored.
        let outcome = relay
            .dispatch(&mut a.session, Incoming::Heartbeat { room_id: room() })
            .await;
        assert_eq!(outcome, Outcome::Dropped(DropReason::NotMember));
    }

    #[tokio::test]
    async fn test_sweep_destroys_room_when_all_silent() {
        let relay = Relay::new();
        let mut a = TestClient::new("a");
        join(&relay, &mut a).await;

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(relay.sweep(later, Duration::from_secs(30)).await, 1);
        assert!(!relay.registry().contains(&room()).await);

        // Nothing left to sweep.
        assert_eq!(relay.sweep(later, Duration::from_secs(30)).await, 0);
    }
}
