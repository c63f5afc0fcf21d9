//! Join and submit handling for room connections.
//!
//! A submission is persisted before anyone sees it, and submissions to one
//! group are committed and broadcast one at a time so every subscriber sees
//! the log's commit order. Different groups do not wait on each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    db::{NewMessage, Store},
    error::ChatError,
    session::SessionClaim,
};

use super::{
    membership,
    msg::{MessageView, ServerEvent, SubmitMessage},
    registry::{ConnectionId, ConnectionRegistry, room_key},
};

/// One async lock per group, created on first use and dropped once nobody
/// holds or waits on it.
#[derive(Default)]
struct GroupLocks(DashMap<i64, Arc<Mutex<()>>>);

impl GroupLocks {
    async fn acquire(self: &Arc<Self>, group_id: i64) -> GroupTurn {
        let lock = self.0.entry(group_id).or_default().clone();
        GroupTurn {
            guard: Some(lock.lock_owned().await),
            locks: self.clone(),
            group_id,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.len()
    }
}

struct GroupTurn {
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<GroupLocks>,
    group_id: i64,
}

impl Drop for GroupTurn {
    fn drop(&mut self) {
        self.guard.take();
        // waiters hold a clone, so a count of one means the map's is the last
        self.locks
            .0
            .remove_if(&self.group_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[derive(Clone)]
pub struct RoomPipeline {
    store: Store,
    registry: Arc<ConnectionRegistry>,
    // commit order per group
    sequencers: Arc<GroupLocks>,
    // join authorization vs. membership removal per group
    gates: Arc<GroupLocks>,
}

impl RoomPipeline {
    pub fn new(store: Store, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            store,
            registry,
            sequencers: Arc::default(),
            gates: Arc::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Authorizes and subscribes under the group's gate, so a concurrent
    /// [`remove_member`](Self::remove_member) sees either no subscription and
    /// a refused join, or the subscription and revokes it.
    pub async fn handle_join(&self, conn: ConnectionId, group_id: i64) -> Result<(), ChatError> {
        let claim = self.registry.claim(conn).ok_or(ChatError::Unauthorized)?;

        let _gate = self.gates.acquire(group_id).await;
        self.join_locked(conn, &claim, group_id).await
    }

    async fn join_locked(&self, conn: ConnectionId, claim: &SessionClaim, group_id: i64) -> Result<(), ChatError> {
        if !membership::is_authorized(&self.store, claim, group_id).await? {
            tracing::info!(connection_id = %conn, user_id = claim.id, group_id, "join refused");
            return Err(ChatError::Forbidden);
        }

        if self.registry.subscribe(conn, group_id)? {
            tracing::info!(connection_id = %conn, user_id = claim.id, group_id, "joined room");
        }
        // queued before the gate opens, so a revoke's `left` always follows it
        self.registry.send_to(conn, ServerEvent::Joined { group_id });
        Ok(())
    }

    pub async fn handle_leave(&self, conn: ConnectionId, group_id: i64) -> Result<(), ChatError> {
        if !self.registry.unsubscribe(conn, group_id) {
            return Err(ChatError::NotJoined(group_id));
        }
        self.registry.send_to(conn, ServerEvent::Left { group_id });
        Ok(())
    }

    /// Deletes the membership row and revokes the user's live subscriptions
    /// to the room. Returns whether a row was removed and how many
    /// connections were revoked.
    pub async fn remove_member(&self, user_id: i64, group_id: i64) -> Result<(bool, usize), ChatError> {
        let _gate = self.gates.acquire(group_id).await;
        let removed = self.store.remove_member(user_id, group_id).await?;
        Ok((removed, self.registry.revoke(user_id, group_id)))
    }

    /// Persists the message and broadcasts it to the group's room.
    ///
    /// The commit runs on its own task: once started it finishes even if the
    /// submitting connection goes away.
    pub async fn handle_submit(&self, conn: ConnectionId, submit: SubmitMessage) -> Result<MessageView, ChatError> {
        let claim = self.registry.claim(conn).ok_or(ChatError::Unauthorized)?;
        if !self.registry.is_subscribed(conn, submit.group_id) {
            return Err(ChatError::NotJoined(submit.group_id));
        }
        let message = submit.validate(&claim)?;

        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.commit(claim, message).await }).await?
    }

    async fn commit(&self, sender: SessionClaim, message: NewMessage) -> Result<MessageView, ChatError> {
        let _turn = self.sequencers.acquire(message.group_id).await;

        let committed = self.store.insert_message(&message).await.inspect_err(|err| {
            tracing::error!(user_id = sender.id, group_id = message.group_id, error = %err, "message not persisted");
        })?;

        let view = MessageView::new(&sender, message, committed);
        let delivered = self
            .registry
            .broadcast(&room_key(view.group_id), ServerEvent::Message(view.clone()));

        tracing::debug!(
            message_id = view.id,
            group_id = view.group_id,
            user_id = sender.id,
            delivered,
            "message broadcast"
        );
        Ok(view)
    }

    pub fn handle_disconnect(&self, conn: ConnectionId) {
        let rooms = self.registry.unsubscribe_all(conn);
        tracing::debug!(connection_id = %conn, rooms = ?rooms, "left rooms on disconnect");
    }
}
