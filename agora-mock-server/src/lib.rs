use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};

use agora_api::{
    Author, Channel, ChannelEvent, Comment, CommentId, ConfirmedId, Error, FeedMessage,
    MessageStore, NewComment, ResourceId, RoomName, Subscription, Transport, UserId, Uuid,
};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::channel::mpsc;
use tokio::sync::{watch, Mutex, RwLock};

/// In-memory comment table, with knobs to make operations fail or stall
pub struct MockStore {
    db: Mutex<DbState>,
    inserts_paused: watch::Sender<bool>,
}

#[derive(Debug)]
struct DbState {
    next_id: i64,
    users: HashMap<UserId, Author>,
    comments: BTreeMap<ConfirmedId, NewComment>,
    fail_inserts: bool,
    fail_children: bool,
    fail_deletes: bool,
    delete_batches: Vec<Vec<ConfirmedId>>,
}

impl MockStore {
    pub fn new() -> MockStore {
        MockStore::with_next_id(1)
    }

    /// Store whose first insert will be assigned `next_id`
    pub fn with_next_id(next_id: i64) -> MockStore {
        let (inserts_paused, _) = watch::channel(false);
        MockStore {
            db: Mutex::new(DbState {
                next_id,
                users: HashMap::new(),
                comments: BTreeMap::new(),
                fail_inserts: false,
                fail_children: false,
                fail_deletes: false,
                delete_batches: Vec::new(),
            }),
            inserts_paused,
        }
    }

    pub async fn add_user(&self, id: UserId, author: Author) {
        self.db.lock().await.users.insert(id, author);
    }

    /// Directly writes a comment, bypassing validation and failure knobs
    pub async fn seed(&self, comment: NewComment) -> ConfirmedId {
        let mut db = self.db.lock().await;
        let id = ConfirmedId(db.next_id);
        db.next_id += 1;
        db.comments.insert(id, comment);
        id
    }

    pub async fn fail_inserts(&self, fail: bool) {
        self.db.lock().await.fail_inserts = fail;
    }

    pub async fn fail_children(&self, fail: bool) {
        self.db.lock().await.fail_children = fail;
    }

    pub async fn fail_deletes(&self, fail: bool) {
        self.db.lock().await.fail_deletes = fail;
    }

    /// Inserts wait until [`MockStore::resume_inserts`] is called
    pub fn pause_inserts(&self) {
        self.inserts_paused.send_replace(true);
    }

    pub fn resume_inserts(&self) {
        self.inserts_paused.send_replace(false);
    }

    pub async fn test_contains(&self, id: ConfirmedId) -> bool {
        self.db.lock().await.comments.contains_key(&id)
    }

    pub async fn test_num_comments(&self) -> usize {
        self.db.lock().await.comments.len()
    }

    /// Every id set passed to `delete_many`, in call order
    pub async fn test_delete_batches(&self) -> Vec<Vec<ConfirmedId>> {
        self.db.lock().await.delete_batches.clone()
    }

    async fn wait_for_inserts(&self) {
        let mut paused = self.inserts_paused.subscribe();
        while *paused.borrow_and_update() {
            if paused.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for MockStore {
    fn default() -> MockStore {
        MockStore::new()
    }
}

#[async_trait]
impl MessageStore for MockStore {
    async fn list_for_resource(&self, resource: ResourceId) -> anyhow::Result<Vec<Comment>> {
        let db = self.db.lock().await;
        let mut res = db
            .comments
            .iter()
            .filter(|(_, c)| c.resource_id == resource)
            .map(|(id, c)| Comment {
                id: CommentId::Confirmed(*id),
                content: c.content.clone(),
                author: db.users.get(&c.author_id).cloned().unwrap_or(Author {
                    name: String::from("Anonymous"),
                    avatar_url: None,
                }),
                created_at: c.created_at,
                parent_id: c.parent_id.map(CommentId::Confirmed),
            })
            .collect::<Vec<_>>();
        res.sort_by_key(|c| (c.created_at, c.id));
        Ok(res)
    }

    async fn insert(&self, comment: NewComment) -> anyhow::Result<ConfirmedId> {
        self.wait_for_inserts().await;
        comment.validate()?;
        let mut db = self.db.lock().await;
        if db.fail_inserts {
            return Err(anyhow!("mock store refused the insert"));
        }
        if let Some(parent) = comment.parent_id {
            // replies never cross resources
            match db.comments.get(&parent) {
                Some(p) if p.resource_id == comment.resource_id => (),
                _ => return Err(Error::UnknownParent(parent).into()),
            }
        }
        let id = ConfirmedId(db.next_id);
        db.next_id += 1;
        tracing::trace!(?id, "mock store inserted comment");
        db.comments.insert(id, comment);
        Ok(id)
    }

    async fn list_children(&self, id: ConfirmedId) -> anyhow::Result<Vec<ConfirmedId>> {
        let db = self.db.lock().await;
        if db.fail_children {
            return Err(anyhow!("mock store refused to list children of {id}"));
        }
        Ok(db
            .comments
            .iter()
            .filter(|(_, c)| c.parent_id == Some(id))
            .map(|(child, _)| *child)
            .collect())
    }

    async fn delete_many(&self, ids: &[ConfirmedId]) -> anyhow::Result<()> {
        let mut db = self.db.lock().await;
        db.delete_batches.push(ids.to_vec());
        if db.fail_deletes {
            return Err(anyhow!("mock store refused to delete {} comments", ids.len()));
        }
        let orphaned = db
            .comments
            .iter()
            .filter(|(id, _)| !ids.contains(id))
            .filter_map(|(_, c)| c.parent_id)
            .filter(|p| ids.contains(p))
            .min();
        if let Some(parent) = orphaned {
            return Err(Error::HasReplies(parent).into());
        }
        for id in ids {
            db.comments.remove(id);
        }
        Ok(())
    }
}

/// In-memory pub/sub hub fanning every publication out to all room members
#[derive(Clone)]
pub struct MockBroker(Arc<BrokerState>);

struct BrokerState {
    rooms: RwLock<HashMap<RoomName, HashMap<Uuid, mpsc::UnboundedSender<ChannelEvent>>>>,
    withhold_subscriptions: bool,
    pending: Mutex<Vec<(Uuid, mpsc::UnboundedSender<ChannelEvent>)>>,
    published: Mutex<Vec<(RoomName, FeedMessage)>>,
}

impl MockBroker {
    pub fn new() -> MockBroker {
        MockBroker::build(false)
    }

    /// Broker that never confirms subscriptions until [`MockBroker::confirm_subscriptions`]
    pub fn withholding_subscriptions() -> MockBroker {
        MockBroker::build(true)
    }

    fn build(withhold_subscriptions: bool) -> MockBroker {
        MockBroker(Arc::new(BrokerState {
            rooms: RwLock::new(HashMap::new()),
            withhold_subscriptions,
            pending: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        }))
    }

    pub async fn confirm_subscriptions(&self) {
        for (_, s) in self.0.pending.lock().await.drain(..) {
            let _ = s.unbounded_send(ChannelEvent::Subscribed);
        }
    }

    /// Delivers `msg` to the room as if another client had published it
    pub async fn inject(&self, room: &RoomName, msg: FeedMessage) {
        self.0.fan_out(room, msg).await;
    }

    pub async fn test_num_members(&self, room: &RoomName) -> usize {
        self.0.rooms.read().await.get(room).map_or(0, |r| r.len())
    }

    pub async fn test_published(&self) -> Vec<(RoomName, FeedMessage)> {
        self.0.published.lock().await.clone()
    }
}

impl Default for MockBroker {
    fn default() -> MockBroker {
        MockBroker::new()
    }
}

impl BrokerState {
    async fn fan_out(&self, room: &RoomName, msg: FeedMessage) {
        self.published.lock().await.push((room.clone(), msg.clone()));
        if let Some(members) = self.rooms.read().await.get(room) {
            for m in members.values() {
                let _ = m.unbounded_send(ChannelEvent::Message(msg.clone()));
            }
        }
    }
}

#[async_trait]
impl Transport for MockBroker {
    async fn subscribe(&self, room: &RoomName) -> anyhow::Result<Subscription> {
        let (sender, events) = mpsc::unbounded();
        let member = Uuid::new_v4();
        if self.0.withhold_subscriptions {
            self.0.pending.lock().await.push((member, sender.clone()));
        } else {
            sender
                .unbounded_send(ChannelEvent::Subscribed)
                .map_err(|_| anyhow!("subscription receiver vanished"))?;
        }
        self.0
            .rooms
            .write()
            .await
            .entry(room.clone())
            .or_insert_with(HashMap::new)
            .insert(member, sender);
        Ok(Subscription {
            channel: Box::new(MockChannel {
                broker: self.0.clone(),
                room: room.clone(),
                member,
            }),
            events,
        })
    }
}

struct MockChannel {
    broker: Arc<BrokerState>,
    room: RoomName,
    member: Uuid,
}

#[async_trait]
impl Channel for MockChannel {
    async fn publish(&self, msg: FeedMessage) {
        self.broker.fan_out(&self.room, msg).await;
    }

    async fn unsubscribe(&self) {
        let mut rooms = self.broker.rooms.write().await;
        if let Some(members) = rooms.get_mut(&self.room) {
            members.remove(&self.member);
            if members.is_empty() {
                rooms.remove(&self.room);
            }
        }
        // the pending confirmation holds a sender too, drop it so the stream ends
        self.broker
            .pending
            .lock()
            .await
            .retain(|(m, _)| *m != self.member);
    }
}
