use std::time::{Duration, Instant};

use agora_client::api::{
    Channel, ChannelEvent, Comment, ConfirmedId, Error as ApiError, FeedMessage, MessageStore,
    NewComment, RelayMessage, ResourceId, RoomName, Subscription, Transport,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::{channel::mpsc, SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

// Pings will be sent every PING_INTERVAL
const PING_INTERVAL: Duration = Duration::from_secs(10);
// If no pong arrived for DISCONNECT_INTERVAL, the feed is considered lost
const DISCONNECT_INTERVAL: Duration = Duration::from_secs(20);

/// Comment store reached through the server's http api
#[derive(Clone)]
pub struct HttpStore {
    client: reqwest::Client,
    host: String,
}

impl HttpStore {
    pub fn new(host: String) -> HttpStore {
        HttpStore {
            client: reqwest::Client::new(),
            host,
        }
    }
}

/// Turns error answers back into the [`ApiError`] the server sent, when possible
async fn check(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.bytes().await.context("reading error body")?;
    Err(match ApiError::parse(&body) {
        Ok(err) => err.into(),
        Err(_) => anyhow!(
            "server answered {status}: {}",
            String::from_utf8_lossy(&body)
        ),
    })
}

#[async_trait]
impl MessageStore for HttpStore {
    async fn list_for_resource(&self, resource: ResourceId) -> anyhow::Result<Vec<Comment>> {
        let resp = self
            .client
            .get(format!("{}/api/resources/{}/comments", self.host, resource.0))
            .send()
            .await
            .context("fetching comment history")?;
        check(resp)
            .await?
            .json()
            .await
            .context("parsing comment history")
    }

    async fn insert(&self, comment: NewComment) -> anyhow::Result<ConfirmedId> {
        let resp = self
            .client
            .post(format!("{}/api/comments", self.host))
            .json(&comment)
            .send()
            .await
            .context("submitting comment")?;
        check(resp)
            .await?
            .json()
            .await
            .context("parsing comment id")
    }

    async fn list_children(&self, id: ConfirmedId) -> anyhow::Result<Vec<ConfirmedId>> {
        let resp = self
            .client
            .get(format!("{}/api/comments/{}/children", self.host, id.0))
            .send()
            .await
            .with_context(|| format!("fetching replies of comment {id}"))?;
        check(resp)
            .await?
            .json()
            .await
            .context("parsing reply ids")
    }

    async fn delete_many(&self, ids: &[ConfirmedId]) -> anyhow::Result<()> {
        let resp = self
            .client
            .post(format!("{}/api/comments/delete", self.host))
            .json(ids)
            .send()
            .await
            .context("deleting comments")?;
        check(resp).await?;
        Ok(())
    }
}

/// Room feeds relayed by the server's websocket endpoint
pub struct WsTransport {
    host: String,
}

impl WsTransport {
    pub fn new(host: String) -> WsTransport {
        WsTransport { host }
    }

    fn room_url(&self, room: &RoomName) -> anyhow::Result<String> {
        let rest = self
            .host
            .strip_prefix("http")
            .ok_or_else(|| anyhow!("host {:?} is not an http(s) url", self.host))?;
        Ok(format!("ws{rest}/ws/room/{room}"))
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn subscribe(&self, room: &RoomName) -> anyhow::Result<Subscription> {
        let url = self.room_url(room)?;
        let (sock, _) = tokio_tungstenite::connect_async(&url)
            .await
            .with_context(|| format!("connecting to {url}"))?;
        tracing::debug!(%url, "connected to room websocket");
        let (mut write, read) = sock.split();
        let (events_sender, events) = mpsc::unbounded();
        let (out_sender, mut out) = mpsc::unbounded::<Message>();

        tokio::spawn(async move {
            let mut read = read.fuse();
            let mut ping = tokio::time::interval(PING_INTERVAL);
            let mut last_pong = Instant::now();
            loop {
                tokio::select! {
                    msg = out.next() => match msg {
                        None => return,
                        Some(msg) => {
                            if let Err(err) = write.send(msg).await {
                                tracing::warn!(?err, "failed writing to room websocket");
                                return;
                            }
                        }
                    },
                    _ = ping.tick() => {
                        if last_pong.elapsed() > DISCONNECT_INTERVAL {
                            tracing::warn!("room websocket stopped answering pings");
                            return;
                        }
                        if write.send(Message::Text(String::from("ping"))).await.is_err() {
                            return;
                        }
                    }
                    msg = read.next() => {
                        let msg: RelayMessage = match msg {
                            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                            Some(Ok(Message::Text(t))) => match serde_json::from_str(&t) {
                                Ok(msg) => msg,
                                Err(err) => {
                                    tracing::warn!(?err, "ignoring unparseable relay message");
                                    continue;
                                }
                            },
                            Some(Ok(Message::Binary(b))) => match serde_json::from_slice(&b) {
                                Ok(msg) => msg,
                                Err(err) => {
                                    tracing::warn!(?err, "ignoring unparseable relay message");
                                    continue;
                                }
                            },
                            Some(Ok(_)) => continue,
                        };
                        let evt = match msg {
                            RelayMessage::Pong => {
                                last_pong = Instant::now();
                                continue;
                            }
                            RelayMessage::Subscribed => ChannelEvent::Subscribed,
                            RelayMessage::Broadcast(msg) => ChannelEvent::Message(msg),
                        };
                        if events_sender.unbounded_send(evt).is_err() {
                            // nobody listens anymore
                            let _ = write.close().await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(Subscription {
            channel: Box::new(WsChannel { out: out_sender }),
            events,
        })
    }
}

struct WsChannel {
    out: mpsc::UnboundedSender<Message>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn publish(&self, msg: FeedMessage) {
        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(err) => {
                tracing::error!(?err, ?msg, "failed serializing message to json");
                return;
            }
        };
        if self.out.unbounded_send(Message::Text(json)).is_err() {
            tracing::debug!(?msg, "dropping publication on a closed room websocket");
        }
    }

    async fn unsubscribe(&self) {
        let _ = self.out.unbounded_send(Message::Close(None));
        self.out.close_channel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_urls() {
        let room = RoomName::for_resource(ResourceId(4));
        assert_eq!(
            WsTransport::new(String::from("http://localhost:3000"))
                .room_url(&room)
                .unwrap(),
            "ws://localhost:3000/ws/room/blog-post-4"
        );
        assert_eq!(
            WsTransport::new(String::from("https://example.org"))
                .room_url(&room)
                .unwrap(),
            "wss://example.org/ws/room/blog-post-4"
        );
        assert!(WsTransport::new(String::from("example.org"))
            .room_url(&room)
            .is_err());
    }
}
