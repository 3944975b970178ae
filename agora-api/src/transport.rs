use async_trait::async_trait;
use futures::channel::mpsc;

use crate::{FeedMessage, RoomName};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChannelEvent {
    /// The room accepted this subscription
    Subscribed,
    Message(FeedMessage),
}

/// Pub/sub broadcast provider with at-least-once, unordered delivery
#[async_trait]
pub trait Transport: Send + Sync {
    /// Joins `room`; the subscription is live once [`ChannelEvent::Subscribed`] arrives
    async fn subscribe(&self, room: &RoomName) -> anyhow::Result<Subscription>;
}

/// Handle on one room membership
#[async_trait]
pub trait Channel: Send + Sync {
    /// Fire-and-forget send to every member of the room, including this one
    async fn publish(&self, msg: FeedMessage);

    /// Leaves the room, which ends the event stream
    async fn unsubscribe(&self);
}

pub struct Subscription {
    pub channel: Box<dyn Channel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}
