use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use chrono::{Duration, SubsecRound, Utc};
use futures::{
    channel::{mpsc, oneshot},
    select, FutureExt, StreamExt,
};
use parking_lot::Mutex;

use crate::{
    api::{
        Channel, ChannelEvent, Comment, CommentId, ConfirmedId, FeedMessage, Identity,
        MessageStore, NewComment, ResourceId, RoomName, Subscription, TempId, Time, Transport,
    },
    ChatEvent,
};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
}

/// Everything the engine reports to its owner, in emission order
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SyncUpdate {
    Chat(ChatEvent),
    Connection(ConnState),
}

/// Why an operation was dropped without doing anything
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum IgnoreReason {
    EmptyContent,
    ConnectionNotReady,
    /// The comment never made it to the store
    NotPersisted,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SendOutcome {
    Ignored(IgnoreReason),
    Confirmed(ConfirmedId),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeleteOutcome {
    Ignored(IgnoreReason),
    /// The whole reply closure, root first
    Deleted(Vec<ConfirmedId>),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Failed to load comment history: {err:#}")]
    LoadFailed { err: anyhow::Error },

    #[error("Failed to subscribe to room {room}: {err:#}")]
    SubscribeFailed { room: RoomName, err: anyhow::Error },

    #[error("Failed to save comment: {err:#}")]
    InsertFailed { temp_id: TempId, err: anyhow::Error },

    #[error("Failed to delete {} comments: {err:#}", .ids.len())]
    DeleteFailed {
        ids: Vec<ConfirmedId>,
        err: anyhow::Error,
    },

    #[error("Failed to list replies of comment {id}: {err:#}")]
    ChildLookupFailed { id: ConfirmedId, err: anyhow::Error },

    #[error("Comment {temp_id:?} replies to {parent:?}, which was never saved")]
    ParentNotSaved { temp_id: TempId, parent: TempId },
}

/// Live synchronization of one room's comments
///
/// Local state is never touched directly: every change is reported on the
/// `on_change` channel, and the owner folds it into its own [`CommentList`](crate::CommentList).
/// Changes are always reported before the matching network round trip
/// completes.
pub struct RealtimeSync {
    room: RoomName,
    identity: Identity,
    resource: ResourceId,
    store: Arc<dyn MessageStore>,
    on_change: mpsc::UnboundedSender<SyncUpdate>,
    session: Mutex<Session>,
}

struct Session {
    /// Bumped on teardown, so that late completions can notice they are stale
    generation: u64,
    state: ConnState,
    channel: Option<Arc<dyn Channel>>,
    cancel: Option<oneshot::Sender<()>>,
    /// Temporary ids not settled yet, with whoever waits for their store id
    pending: HashMap<TempId, Vec<oneshot::Sender<Option<ConfirmedId>>>>,
    /// Store ids of settled temporary ids, None for the ones that were dropped
    settled: HashMap<TempId, Option<ConfirmedId>>,
    last_created_at: Option<Time>,
}

/// Store id of a comment, either already known or to be learnt once it is saved
enum Saved {
    Known(ConfirmedId),
    Pending(TempId, oneshot::Receiver<Option<ConfirmedId>>),
}

impl Saved {
    fn id(&self) -> CommentId {
        match self {
            Saved::Known(id) => CommentId::Confirmed(*id),
            Saved::Pending(t, _) => CommentId::Temporary(*t),
        }
    }
}

impl Session {
    fn track(&mut self, t: TempId) {
        if !self.settled.contains_key(&t) {
            self.pending.entry(t).or_default();
        }
    }

    /// Records the fate of `t` and wakes everyone waiting on it; the first outcome wins
    fn settle(&mut self, t: TempId, outcome: Option<ConfirmedId>) {
        let outcome = *self.settled.entry(t).or_insert(outcome);
        for waiter in self.pending.remove(&t).into_iter().flatten() {
            let _ = waiter.send(outcome);
        }
    }

    /// None if `t` is unknown or was dropped
    fn saved(&mut self, t: TempId) -> Option<Saved> {
        match self.settled.get(&t) {
            Some(Some(id)) => Some(Saved::Known(*id)),
            Some(None) => None,
            None => self.pending.get_mut(&t).map(|waiters| {
                let (sender, receiver) = oneshot::channel();
                waiters.push(sender);
                Saved::Pending(t, receiver)
            }),
        }
    }

    /// Wall clock time, nudged forward so that two sends never share a timestamp
    fn next_timestamp(&mut self) -> Time {
        let now = Utc::now().trunc_subsecs(6);
        let res = match self.last_created_at {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_created_at = Some(res);
        res
    }
}

impl RealtimeSync {
    pub fn new(
        room: RoomName,
        identity: Identity,
        resource: ResourceId,
        store: Arc<dyn MessageStore>,
        on_change: mpsc::UnboundedSender<SyncUpdate>,
    ) -> RealtimeSync {
        RealtimeSync {
            room,
            identity,
            resource,
            store,
            on_change,
            session: Mutex::new(Session {
                generation: 0,
                state: ConnState::Idle,
                channel: None,
                cancel: None,
                pending: HashMap::new(),
                settled: HashMap::new(),
                last_created_at: None,
            }),
        }
    }

    pub fn room(&self) -> &RoomName {
        &self.room
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn state(&self) -> ConnState {
        self.session.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    fn generation(&self) -> u64 {
        self.session.lock().generation
    }

    fn still_active(&self, generation: u64) -> bool {
        self.session.lock().generation == generation
    }

    fn settle(&self, generation: u64, t: TempId, outcome: Option<ConfirmedId>) {
        let mut s = self.session.lock();
        if s.generation == generation {
            s.settle(t, outcome);
        }
    }

    /// Retracts a temporary comment locally and from every other subscriber
    async fn roll_back(&self, generation: u64, channel: &Arc<dyn Channel>, temp_id: TempId) {
        self.settle(generation, temp_id, None);
        if self.emit(generation, SyncUpdate::Chat(ChatEvent::RollbackRemove(temp_id))) {
            channel
                .publish(FeedMessage::Delete {
                    id: CommentId::Temporary(temp_id),
                })
                .await;
        }
    }

    /// Reports `update` unless the session it belongs to was torn down
    fn emit(&self, generation: u64, update: SyncUpdate) -> bool {
        let s = self.session.lock();
        if s.generation != generation {
            tracing::debug!(?update, "dropping update from a stale session");
            return false;
        }
        // the owner going away is not an error for the engine
        let _ = self.on_change.unbounded_send(update);
        true
    }

    fn set_state(&self, generation: u64, state: ConnState) {
        let changed = {
            let mut s = self.session.lock();
            if s.generation != generation || s.state == state {
                false
            } else {
                s.state = state;
                if state != ConnState::Connected {
                    s.channel = None;
                }
                true
            }
        };
        if changed {
            self.emit(generation, SyncUpdate::Connection(state));
        }
    }

    /// Fetches the durable history and reports it as [`ChatEvent::Loaded`]
    pub async fn refresh(&self) -> Result<Vec<Comment>, SyncError> {
        let generation = self.generation();
        let history = self
            .store
            .list_for_resource(self.resource)
            .await
            .map_err(|err| SyncError::LoadFailed { err })?;
        tracing::debug!(room = %self.room, num = history.len(), "loaded comment history");
        {
            let mut s = self.session.lock();
            if let Some(last) = history.iter().map(|c| c.created_at).max() {
                s.last_created_at = Some(s.last_created_at.map_or(last, |l| l.max(last)));
            }
        }
        self.emit(generation, SyncUpdate::Chat(ChatEvent::Loaded(history.clone())));
        Ok(history)
    }

    /// Joins the room and relays its feed until teardown or until the feed drops
    ///
    /// When the feed drops, the engine stays [`ConnState::Connecting`] and this
    /// returns `Ok`: the caller decides whether to reconnect.
    pub async fn run(&self, transport: &dyn Transport) -> Result<(), SyncError> {
        let (generation, cancel) = {
            let mut s = self.session.lock();
            let (sender, receiver) = oneshot::channel();
            s.cancel = Some(sender);
            (s.generation, receiver)
        };
        self.set_state(generation, ConnState::Connecting);

        let Subscription { channel, events } =
            transport
                .subscribe(&self.room)
                .await
                .map_err(|err| SyncError::SubscribeFailed {
                    room: self.room.clone(),
                    err,
                })?;
        let channel: Arc<dyn Channel> = Arc::from(channel);
        let torn_down = {
            let mut s = self.session.lock();
            match s.generation == generation {
                true => {
                    s.channel = Some(channel.clone());
                    false
                }
                false => true,
            }
        };
        if torn_down {
            channel.unsubscribe().await;
            return Ok(());
        }
        tracing::debug!(room = %self.room, "joining room");

        let mut events = events;
        let mut cancel = cancel.fuse();
        loop {
            select! {
                _ = cancel => {
                    tracing::info!(room = %self.room, "left room");
                    return Ok(());
                }
                evt = events.next() => match evt {
                    None => {
                        tracing::warn!(room = %self.room, "lost room feed");
                        self.set_state(generation, ConnState::Connecting);
                        return Ok(());
                    }
                    Some(ChannelEvent::Subscribed) => {
                        tracing::info!(room = %self.room, "subscribed to room");
                        self.set_state(generation, ConnState::Connected);
                    }
                    Some(ChannelEvent::Message(msg)) => self.handle_feed(generation, msg),
                }
            }
        }
    }

    fn handle_feed(&self, generation: u64, msg: FeedMessage) {
        tracing::trace!(?msg, "received feed message");
        let evt = match msg {
            FeedMessage::Add { comment } => {
                if let Some(t) = comment.temp_id() {
                    self.session.lock().track(t);
                }
                ChatEvent::BroadcastAdd(comment)
            }
            FeedMessage::Confirm { temp_id, comment } => {
                match comment.id.confirmed() {
                    Some(id) => self.settle(generation, temp_id, Some(id)),
                    None => {
                        tracing::warn!(?comment, "ignoring confirmation without a store id");
                        return;
                    }
                }
                ChatEvent::Confirmed { temp_id, comment }
            }
            FeedMessage::Delete { id } => {
                if let CommentId::Temporary(t) = id {
                    self.settle(generation, t, None);
                }
                ChatEvent::BroadcastDelete(id)
            }
        };
        self.emit(generation, SyncUpdate::Chat(evt));
    }

    /// Leaves the room; in-flight operations keep running but stop reporting
    pub async fn teardown(&self) {
        let (channel, cancel) = {
            let mut s = self.session.lock();
            s.generation += 1;
            s.state = ConnState::Idle;
            // dropping the waiters tells them the session is over
            s.pending.clear();
            s.settled.clear();
            (s.channel.take(), s.cancel.take())
        };
        if let Some(cancel) = cancel {
            let _ = cancel.send(());
        }
        let _ = self
            .on_change
            .unbounded_send(SyncUpdate::Connection(ConnState::Idle));
        if let Some(channel) = channel {
            channel.unsubscribe().await;
        }
        tracing::debug!(room = %self.room, "torn down");
    }

    /// Posts a comment, optionally as a reply
    ///
    /// The comment is reported and broadcast under a temporary id right away,
    /// then promoted once the store accepted it, or retracted everywhere if
    /// the store refused it. A reply to a comment that is not saved yet is
    /// shown at once, and only handed to the store after its parent.
    pub async fn send_message(
        &self,
        content: &str,
        parent: Option<CommentId>,
    ) -> Result<SendOutcome, SyncError> {
        if content.trim().is_empty() {
            tracing::debug!("ignoring empty comment");
            return Ok(SendOutcome::Ignored(IgnoreReason::EmptyContent));
        }
        let temp_id = TempId::generate();
        let (generation, channel, parent, created_at) = {
            let mut s = self.session.lock();
            let channel = match (&s.state, &s.channel) {
                (ConnState::Connected, Some(c)) => c.clone(),
                _ => {
                    tracing::debug!(state = ?s.state, "ignoring send on a room that is not connected");
                    return Ok(SendOutcome::Ignored(IgnoreReason::ConnectionNotReady));
                }
            };
            let parent = match parent {
                None => None,
                Some(CommentId::Confirmed(id)) => Some(Saved::Known(id)),
                Some(CommentId::Temporary(t)) => match s.saved(t) {
                    Some(saved) => Some(saved),
                    None => {
                        tracing::info!(parent = ?t, "refusing reply to a comment that was never saved");
                        return Err(SyncError::ParentNotSaved { temp_id, parent: t });
                    }
                },
            };
            s.track(temp_id);
            (s.generation, channel, parent, s.next_timestamp())
        };

        let comment = Comment {
            id: CommentId::Temporary(temp_id),
            content: String::from(content),
            author: self.identity.author(),
            created_at,
            parent_id: parent.as_ref().map(Saved::id),
        };
        self.emit(generation, SyncUpdate::Chat(ChatEvent::OptimisticAdd(comment.clone())));
        channel
            .publish(FeedMessage::Add {
                comment: comment.clone(),
            })
            .await;

        let parent = match parent {
            None => None,
            Some(Saved::Known(id)) => Some(id),
            Some(Saved::Pending(p, saved)) => match saved.await {
                Ok(Some(id)) => Some(id),
                Ok(None) => {
                    tracing::info!(?temp_id, parent = ?p, "reply target was dropped, retracting reply");
                    self.roll_back(generation, &channel, temp_id).await;
                    return Err(SyncError::ParentNotSaved { temp_id, parent: p });
                }
                Err(oneshot::Canceled) => {
                    tracing::debug!(?temp_id, "room torn down while waiting for the reply target");
                    return Ok(SendOutcome::Ignored(IgnoreReason::ConnectionNotReady));
                }
            },
        };
        let comment = Comment {
            parent_id: parent.map(CommentId::Confirmed),
            ..comment
        };

        let res = self
            .store
            .insert(NewComment {
                author_id: self.identity.id,
                resource_id: self.resource,
                content: comment.content.clone(),
                parent_id: parent,
                created_at,
            })
            .await;
        match res {
            Ok(id) => {
                if !self.still_active(generation) {
                    tracing::debug!(?id, "comment saved after teardown");
                    return Ok(SendOutcome::Confirmed(id));
                }
                self.settle(generation, temp_id, Some(id));
                let comment = comment.confirmed_as(id);
                self.emit(
                    generation,
                    SyncUpdate::Chat(ChatEvent::Confirmed {
                        temp_id,
                        comment: comment.clone(),
                    }),
                );
                channel.publish(FeedMessage::Confirm { temp_id, comment }).await;
                Ok(SendOutcome::Confirmed(id))
            }
            Err(err) => {
                tracing::warn!(?temp_id, ?err, "store refused comment, rolling back");
                self.roll_back(generation, &channel, temp_id).await;
                Err(SyncError::InsertFailed { temp_id, err })
            }
        }
    }

    /// Deletes a comment along with every comment transitively replying to it
    ///
    /// Removal is reported and broadcast before the store is asked to delete.
    /// A store failure is returned as-is: the removal is not undone, and the
    /// next [`RealtimeSync::refresh`] brings the comments back.
    ///
    /// A comment that is not saved yet disappears locally at once, and is
    /// deleted for everyone once the store assigned it an id.
    pub async fn delete_message(&self, id: CommentId) -> Result<DeleteOutcome, SyncError> {
        let (generation, channel, target) = {
            let mut s = self.session.lock();
            let channel = match (&s.state, &s.channel) {
                (ConnState::Connected, Some(c)) => c.clone(),
                _ => {
                    tracing::debug!(state = ?s.state, "ignoring delete on a room that is not connected");
                    return Ok(DeleteOutcome::Ignored(IgnoreReason::ConnectionNotReady));
                }
            };
            let target = match id {
                CommentId::Confirmed(id) => Some(Saved::Known(id)),
                CommentId::Temporary(t) => s.saved(t),
            };
            (s.generation, channel, target)
        };

        let root = match target {
            Some(Saved::Known(id)) => id,
            target => {
                // only hidden here: peers keep it until it gets a store id
                self.emit(generation, SyncUpdate::Chat(ChatEvent::BroadcastDelete(id)));
                let saved = match target {
                    Some(Saved::Pending(_, saved)) => saved,
                    _ => {
                        tracing::debug!(?id, "comment was never saved, removed it locally");
                        return Ok(DeleteOutcome::Ignored(IgnoreReason::NotPersisted));
                    }
                };
                match saved.await {
                    Ok(Some(root)) => root,
                    Ok(None) => {
                        tracing::debug!(?id, "comment was dropped before being saved");
                        return Ok(DeleteOutcome::Ignored(IgnoreReason::NotPersisted));
                    }
                    Err(oneshot::Canceled) => {
                        return Ok(DeleteOutcome::Ignored(IgnoreReason::ConnectionNotReady))
                    }
                }
            }
        };

        let ids = collect_reply_closure(&*self.store, root).await?;
        if !self.still_active(generation) {
            tracing::debug!(?root, "room torn down while collecting replies");
            return Ok(DeleteOutcome::Ignored(IgnoreReason::ConnectionNotReady));
        }
        for id in &ids {
            self.emit(
                generation,
                SyncUpdate::Chat(ChatEvent::BroadcastDelete(CommentId::Confirmed(*id))),
            );
        }
        for id in &ids {
            channel
                .publish(FeedMessage::Delete {
                    id: CommentId::Confirmed(*id),
                })
                .await;
        }

        match self.store.delete_many(&ids).await {
            Ok(()) => {
                tracing::debug!(?root, num = ids.len(), "deleted comment thread");
                Ok(DeleteOutcome::Deleted(ids))
            }
            Err(err) => {
                tracing::error!(?ids, ?err, "store refused to delete comments");
                Err(SyncError::DeleteFailed { ids, err })
            }
        }
    }
}

/// `root` and every comment transitively replying to it, breadth first
pub async fn collect_reply_closure(
    store: &dyn MessageStore,
    root: ConfirmedId,
) -> Result<Vec<ConfirmedId>, SyncError> {
    let mut res = vec![root];
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);
    while let Some(id) = queue.pop_front() {
        let children = store
            .list_children(id)
            .await
            .map_err(|err| SyncError::ChildLookupFailed { id, err })?;
        for c in children {
            if seen.insert(c) {
                res.push(c);
                queue.push_back(c);
            }
        }
    }
    Ok(res)
}
