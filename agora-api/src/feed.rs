use crate::{Comment, CommentId, TempId};

/// Payload broadcast to every subscriber of a room, the sender included
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedMessage {
    Add {
        comment: Comment,
    },

    /// The store accepted the comment that was broadcast under `temp_id`
    Confirm {
        temp_id: TempId,
        comment: Comment,
    },

    /// Removes one comment, also used to retract a comment whose insertion failed
    Delete {
        id: CommentId,
    },
}

/// Frames sent by the relay server to a room member
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum RelayMessage {
    Subscribed,
    Pong,
    Broadcast(FeedMessage),
}
