use anyhow::{anyhow, Context};
use serde_json::json;

use crate::ConfirmedId;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Comment content is empty")]
    EmptyContent,

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid room name {0:?}")]
    InvalidRoomName(String),

    #[error("Parent comment {0} does not exist")]
    UnknownParent(ConfirmedId),

    #[error("Comment {0} still has replies")]
    HasReplies(ConfirmedId),
}

impl Error {
    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::EmptyContent => StatusCode::BAD_REQUEST,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::InvalidRoomName(_) => StatusCode::BAD_REQUEST,
            Error::UnknownParent(_) => StatusCode::NOT_FOUND,
            Error::HasReplies(_) => StatusCode::CONFLICT,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::EmptyContent => json!({
                "message": "comment content is empty",
                "type": "empty-content",
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::InvalidRoomName(n) => json!({
                "message": "room names are made of ascii letters, digits, '-', '_' and '.'",
                "type": "invalid-room-name",
                "name": n,
            }),
            Error::UnknownParent(id) => json!({
                "message": "parent comment does not exist",
                "type": "unknown-parent",
                "id": id.0,
            }),
            Error::HasReplies(id) => json!({
                "message": "comment still has replies, delete them along with it",
                "type": "has-replies",
                "id": id.0,
            }),
        })
        .expect("serializing json value")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(String::from(
                    data.get("message")
                        .and_then(|msg| msg.as_str())
                        .unwrap_or(""),
                )),
                "empty-content" => Error::EmptyContent,
                "null-byte" => Error::NullByteInString(String::from(
                    data.get("string").and_then(|s| s.as_str()).ok_or_else(|| {
                        anyhow!("error is a null-byte-in-string without a string")
                    })?,
                )),
                "invalid-room-name" => Error::InvalidRoomName(String::from(
                    data.get("name")
                        .and_then(|s| s.as_str())
                        .ok_or_else(|| anyhow!("error is an invalid room name without a name"))?,
                )),
                "unknown-parent" => Error::UnknownParent(ConfirmedId(
                    data.get("id")
                        .and_then(|id| id.as_i64())
                        .ok_or_else(|| anyhow!("error is an unknown parent without an id"))?,
                )),
                "has-replies" => Error::HasReplies(ConfirmedId(
                    data.get("id")
                        .and_then(|id| id.as_i64())
                        .ok_or_else(|| anyhow!("error is a has-replies without an id"))?,
                )),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}
