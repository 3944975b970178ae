use std::{collections::HashMap, sync::Arc};

use agora_api::{FeedMessage, RelayMessage, RoomName, Uuid};
use axum::extract::ws::Message;
use futures::{channel::mpsc, select, SinkExt, StreamExt};
use tokio::sync::RwLock;

/// Members of every open room, by room name
#[derive(Clone, Debug)]
pub struct RoomFeeds(
    Arc<RwLock<HashMap<RoomName, HashMap<Uuid, mpsc::UnboundedSender<RelayMessage>>>>>,
);

impl RoomFeeds {
    pub fn new() -> RoomFeeds {
        RoomFeeds(Arc::new(RwLock::new(HashMap::new())))
    }

    /// Relays `room` to a websocket until the client closes it
    ///
    /// The client sends `ping`, answered by a pong, or a json-encoded
    /// [`FeedMessage`], which is broadcast to every member of the room,
    /// including the client itself.
    pub async fn add_member<W, R>(self, room: RoomName, mut write: W, read: R)
    where
        W: 'static + Send + Unpin + futures::Sink<Message>,
        <W as futures::Sink<Message>>::Error: Send,
        R: 'static + Send + Unpin + futures::Stream<Item = Result<Message, axum::Error>>,
    {
        // Note: if this were bounded, there would be a deadlock between the write-lock to remove a member and the read-lock to broadcast to all members
        let (sender, mut receiver) = mpsc::unbounded();
        let member = Uuid::new_v4();
        let _ = sender.unbounded_send(RelayMessage::Subscribed);

        // TODO: limit the number of members per room, to avoid starvations
        self.0
            .write()
            .await
            .entry(room.clone())
            .or_insert_with(HashMap::new)
            .insert(member, sender);
        tracing::debug!(%room, ?member, "member joined room");

        let this = self.clone();
        let mut read = read.fuse();
        tokio::spawn(async move {
            macro_rules! remove_self {
                () => {{
                    this.remove(&room, member).await;
                    return;
                }};
            }
            macro_rules! send_message {
                ( $msg:expr ) => {{
                    let msg: RelayMessage = $msg;
                    let json = match serde_json::to_vec(&msg) {
                        Ok(json) => json,
                        Err(err) => {
                            tracing::error!(?err, ?msg, "failed serializing message to json");
                            continue;
                        }
                    };
                    if let Err(_) = write.send(Message::Binary(json)).await {
                        remove_self!();
                    }
                }};
            }
            loop {
                select! {
                    msg = receiver.next() => match msg {
                        None => remove_self!(),
                        Some(msg) => send_message!(msg),
                    },
                    msg = read.next() => match msg {
                        None => remove_self!(),
                        Some(Ok(Message::Close(_))) => remove_self!(),
                        Some(Ok(Message::Text(msg))) if msg == "ping" => {
                            send_message!(RelayMessage::Pong)
                        }
                        Some(Ok(Message::Text(msg))) => {
                            match serde_json::from_str::<FeedMessage>(&msg) {
                                Ok(msg) => this.broadcast(&room, msg).await,
                                Err(err) => {
                                    tracing::warn!(?err, "received unexpected message from client: {msg:?}");
                                    remove_self!();
                                }
                            }
                        }
                        Some(Ok(Message::Binary(msg))) => {
                            match serde_json::from_slice::<FeedMessage>(&msg) {
                                Ok(msg) => this.broadcast(&room, msg).await,
                                Err(err) => {
                                    tracing::warn!(?err, "received unexpected binary message from client");
                                    remove_self!();
                                }
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => (),
                        Some(Err(err)) => {
                            tracing::debug!(?err, "room websocket failed");
                            remove_self!();
                        }
                    },
                }
            }
        });
    }

    /// Fire-and-forget delivery to every current member of `room`
    pub async fn broadcast(&self, room: &RoomName, msg: FeedMessage) {
        if let Some(members) = self.0.read().await.get(room) {
            tracing::trace!(%room, members = members.len(), ?msg, "broadcasting");
            for m in members.values() {
                let _ = m.unbounded_send(RelayMessage::Broadcast(msg.clone()));
            }
        }
    }

    async fn remove(&self, room: &RoomName, member: Uuid) {
        let mut rooms = self.0.write().await;
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&member);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
        tracing::debug!(%room, ?member, "member left room");
    }

    pub async fn num_members(&self, room: &RoomName) -> usize {
        self.0.read().await.get(room).map_or(0, |m| m.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use agora_api::{CommentId, ConfirmedId, ResourceId};

    use super::*;

    struct Client {
        to_server: mpsc::UnboundedSender<Result<Message, axum::Error>>,
        from_server: mpsc::UnboundedReceiver<Message>,
    }

    impl Client {
        async fn join(feeds: &RoomFeeds, room: &RoomName) -> Client {
            let (to_server, read) = mpsc::unbounded();
            let (write, from_server) = mpsc::unbounded();
            feeds.clone().add_member(room.clone(), write, read).await;
            let mut client = Client {
                to_server,
                from_server,
            };
            assert_eq!(client.recv().await, RelayMessage::Subscribed);
            client
        }

        fn send(&self, msg: Message) {
            self.to_server.unbounded_send(Ok(msg)).unwrap();
        }

        async fn recv(&mut self) -> RelayMessage {
            let msg = tokio::time::timeout(Duration::from_secs(5), self.from_server.next())
                .await
                .expect("timed out waiting for server message")
                .expect("server closed the feed");
            match msg {
                Message::Binary(b) => serde_json::from_slice(&b).unwrap(),
                msg => panic!("unexpected server message {msg:?}"),
            }
        }
    }

    fn delete(id: i64) -> FeedMessage {
        FeedMessage::Delete {
            id: CommentId::Confirmed(ConfirmedId(id)),
        }
    }

    #[tokio::test]
    async fn fan_out_includes_sender() {
        let feeds = RoomFeeds::new();
        let room = RoomName::for_resource(ResourceId(1));
        let other_room = RoomName::for_resource(ResourceId(2));
        let mut a = Client::join(&feeds, &room).await;
        let mut b = Client::join(&feeds, &room).await;
        let mut c = Client::join(&feeds, &other_room).await;
        assert_eq!(feeds.num_members(&room).await, 2);

        a.send(Message::Text(serde_json::to_string(&delete(1)).unwrap()));
        assert_eq!(a.recv().await, RelayMessage::Broadcast(delete(1)));
        assert_eq!(b.recv().await, RelayMessage::Broadcast(delete(1)));

        c.send(Message::Binary(serde_json::to_vec(&delete(2)).unwrap()));
        assert_eq!(c.recv().await, RelayMessage::Broadcast(delete(2)));
        assert!(a.from_server.try_next().is_err());
    }

    #[tokio::test]
    async fn ping_pong() {
        let feeds = RoomFeeds::new();
        let room = RoomName::for_resource(ResourceId(1));
        let mut a = Client::join(&feeds, &room).await;
        a.send(Message::Text(String::from("ping")));
        assert_eq!(a.recv().await, RelayMessage::Pong);
    }

    #[tokio::test]
    async fn members_leave_on_close_and_garbage() {
        let feeds = RoomFeeds::new();
        let room = RoomName::for_resource(ResourceId(1));
        let a = Client::join(&feeds, &room).await;
        let b = Client::join(&feeds, &room).await;
        a.send(Message::Close(None));
        b.send(Message::Text(String::from("not json")));
        for _ in 0..100 {
            if feeds.num_members(&room).await == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("members were not removed");
    }
}
