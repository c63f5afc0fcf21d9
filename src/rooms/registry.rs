use std::{collections::HashSet, sync::Arc};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{
    error::ChatError,
    session::{Rejection, SessionClaim, SessionCodec},
};

use super::msg::ServerEvent;

pub type ConnectionId = Uuid;

/// Events are shared between every connection a broadcast reaches.
pub type Outbound = Arc<ServerEvent>;

pub fn room_key(group_id: i64) -> String {
    format!("group_{group_id}")
}

struct LiveConnection {
    claim: SessionClaim,
    rooms: HashSet<String>,
    sender: mpsc::Sender<Outbound>,
}

/// The transport's half of a freshly authenticated connection.
pub struct Registration {
    pub id: ConnectionId,
    pub claim: SessionClaim,
    pub outbound: mpsc::Receiver<Outbound>,
}

/// Live connections and the rooms they are subscribed to.
///
/// Lock order is `connections` then `rooms`; nothing holds a `rooms` entry
/// while touching `connections`.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, LiveConnection>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
    queue_capacity: usize,
}

enum Delivery {
    Queued,
    Gone,
    Evicted,
}

impl ConnectionRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Verifies `token` and registers a connection for it. Nothing is
    /// registered when the token is refused.
    pub fn authenticate(&self, codec: &SessionCodec, token: &str) -> Result<Registration, Rejection> {
        let claim = codec.verify(token)?;
        Ok(self.register(claim))
    }

    pub fn register(&self, claim: SessionClaim) -> Registration {
        let id = Uuid::now_v7();
        let (sender, outbound) = mpsc::channel(self.queue_capacity);

        self.connections.insert(
            id,
            LiveConnection {
                claim: claim.clone(),
                rooms: HashSet::new(),
                sender,
            },
        );

        tracing::debug!(connection_id = %id, user_id = claim.id, "connection registered");
        Registration { id, claim, outbound }
    }

    pub fn claim(&self, id: ConnectionId) -> Option<SessionClaim> {
        self.connections.get(&id).map(|conn| conn.claim.clone())
    }

    /// Adds the connection to the group's room. Returns `false` if it was
    /// already there.
    pub fn subscribe(&self, id: ConnectionId, group_id: i64) -> Result<bool, ChatError> {
        let key = room_key(group_id);
        let mut conn = self.connections.get_mut(&id).ok_or(ChatError::Unauthorized)?;

        let added = conn.rooms.insert(key.clone());
        self.rooms.entry(key).or_default().insert(id);
        Ok(added)
    }

    pub fn unsubscribe(&self, id: ConnectionId, group_id: i64) -> bool {
        let key = room_key(group_id);
        self.leave_room(&key, id);

        match self.connections.get_mut(&id) {
            Some(mut conn) => conn.rooms.remove(&key),
            None => false,
        }
    }

    /// Drops the connection and every subscription it holds. Returns the
    /// rooms it was in.
    pub fn unsubscribe_all(&self, id: ConnectionId) -> Vec<String> {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return Vec::new();
        };

        for key in &conn.rooms {
            self.leave_room(key, id);
        }

        tracing::debug!(connection_id = %id, rooms = conn.rooms.len(), "connection unregistered");
        conn.rooms.into_iter().collect()
    }

    fn leave_room(&self, key: &str, id: ConnectionId) {
        if let Some(mut subscribers) = self.rooms.get_mut(key) {
            subscribers.remove(&id);
        }
        self.rooms.remove_if(key, |_, subscribers| subscribers.is_empty());
    }

    pub fn is_subscribed(&self, id: ConnectionId, group_id: i64) -> bool {
        self.connections
            .get(&id)
            .is_some_and(|conn| conn.rooms.contains(&room_key(group_id)))
    }

    pub fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        matches!(self.deliver(id, &Arc::new(event)), Delivery::Queued)
    }

    /// Queues `event` for everyone subscribed to `room` at the time of the
    /// call. Returns how many connections it was queued for.
    pub fn broadcast(&self, room: &str, event: ServerEvent) -> usize {
        let targets: Vec<ConnectionId> = match self.rooms.get(room) {
            Some(subscribers) => subscribers.iter().copied().collect(),
            None => return 0,
        };

        let event = Arc::new(event);
        targets
            .into_iter()
            .filter(|id| matches!(self.deliver(*id, &event), Delivery::Queued))
            .count()
    }

    fn deliver(&self, id: ConnectionId, event: &Outbound) -> Delivery {
        let Some(sender) = self.connections.get(&id).map(|conn| conn.sender.clone()) else {
            return Delivery::Gone;
        };

        match sender.try_send(event.clone()) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Closed(_)) => Delivery::Gone,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(connection_id = %id, "send queue full, evicting connection");
                self.unsubscribe_all(id);
                Delivery::Evicted
            }
        }
    }

    /// Removes `user_id`'s connections from the group's room and tells them so.
    pub fn revoke(&self, user_id: i64, group_id: i64) -> usize {
        let ids: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|conn| conn.claim.id == user_id)
            .map(|conn| *conn.key())
            .collect();

        let mut revoked = 0;
        for id in ids {
            if self.unsubscribe(id, group_id) {
                self.send_to(id, ServerEvent::Left { group_id });
                revoked += 1;
            }
        }

        if revoked > 0 {
            tracing::info!(user_id, group_id, connections = revoked, "membership revoked");
        }
        revoked
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriber_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |subscribers| subscribers.len())
    }
}
