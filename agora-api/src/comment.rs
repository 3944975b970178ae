use chrono::Utc;
use uuid::Uuid;

use crate::{Error, ResourceId, Time, UserId};

/// Client-generated placeholder id, valid until the store assigns a [`ConfirmedId`]
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct TempId(pub Uuid);

impl TempId {
    pub fn generate() -> TempId {
        TempId(Uuid::new_v4())
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct ConfirmedId(pub i64);

impl std::fmt::Display for ConfirmedId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum CommentId {
    Temporary(TempId),
    Confirmed(ConfirmedId),
}

impl CommentId {
    pub fn is_temporary(&self) -> bool {
        matches!(self, CommentId::Temporary(_))
    }

    pub fn confirmed(&self) -> Option<ConfirmedId> {
        match self {
            CommentId::Confirmed(id) => Some(*id),
            CommentId::Temporary(_) => None,
        }
    }
}

impl From<TempId> for CommentId {
    fn from(id: TempId) -> CommentId {
        CommentId::Temporary(id)
    }
}

impl From<ConfirmedId> for CommentId {
    fn from(id: ConfirmedId) -> CommentId {
        CommentId::Confirmed(id)
    }
}

impl std::fmt::Display for CommentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommentId::Temporary(TempId(t)) => write!(f, "tmp-{}", t.as_simple()),
            CommentId::Confirmed(c) => write!(f, "{c}"),
        }
    }
}

/// Display identity of a comment's author, not an authorization credential
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Author {
    pub name: String,

    #[serde(rename = "avatarUrl", default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl Author {
    pub fn display_name(&self) -> &str {
        match self.name.trim() {
            "" => "Anonymous",
            name => name,
        }
    }
}

/// Comment record, as held in local state and sent over the broadcast channel
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Comment {
    pub id: CommentId,
    pub content: String,

    #[serde(rename = "user")]
    pub author: Author,

    #[serde(rename = "createdAt")]
    pub created_at: Time,

    /// None for top-level comments
    #[serde(rename = "parent_comment_id", default)]
    pub parent_id: Option<CommentId>,
}

impl Comment {
    pub fn temp_id(&self) -> Option<TempId> {
        match self.id {
            CommentId::Temporary(t) => Some(t),
            CommentId::Confirmed(_) => None,
        }
    }

    /// The same comment, promoted to its store-assigned id
    pub fn confirmed_as(&self, id: ConfirmedId) -> Comment {
        Comment {
            id: CommentId::Confirmed(id),
            ..self.clone()
        }
    }
}

/// A comment as submitted to the durable store
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub author_id: UserId,
    pub resource_id: ResourceId,
    pub content: String,
    pub parent_id: Option<ConfirmedId>,
    pub created_at: Time,
}

impl NewComment {
    pub fn now(
        author_id: UserId,
        resource_id: ResourceId,
        content: String,
        parent_id: Option<ConfirmedId>,
    ) -> NewComment {
        NewComment {
            author_id,
            resource_id,
            content,
            parent_id,
            created_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_content(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let c = Comment {
            id: CommentId::Confirmed(ConfirmedId(42)),
            content: String::from("hello"),
            author: Author {
                name: String::from("hugo"),
                avatar_url: None,
            },
            created_at: chrono::DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            parent_id: None,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["id"], serde_json::json!({ "confirmed": 42 }));
        assert_eq!(json["user"], serde_json::json!({ "name": "hugo" }));
        assert_eq!(json["parent_comment_id"], serde_json::Value::Null);
        assert!(json.get("createdAt").is_some());
        assert_eq!(serde_json::from_value::<Comment>(json).unwrap(), c);
    }

    #[test]
    fn missing_parent_defaults_to_top_level() {
        let c: Comment = serde_json::from_value(serde_json::json!({
            "id": { "confirmed": 1 },
            "content": "x",
            "user": { "name": "a", "avatarUrl": "https://example.org/a.png" },
            "createdAt": "2024-01-01T10:00:00Z",
        }))
        .unwrap();
        assert_eq!(c.parent_id, None);
        assert_eq!(
            c.author.avatar_url.as_deref(),
            Some("https://example.org/a.png")
        );
    }

    #[test]
    fn anonymous_display_name() {
        let a = Author {
            name: String::from("  "),
            avatar_url: None,
        };
        assert_eq!(a.display_name(), "Anonymous");
    }

    #[test]
    fn temporary_ids_never_equal_confirmed_ids() {
        let t = CommentId::from(TempId::generate());
        assert!(t.is_temporary());
        assert_eq!(t.confirmed(), None);
        assert_ne!(t, CommentId::from(ConfirmedId(0)));
        assert_eq!(CommentId::from(ConfirmedId(7)).to_string(), "7");
    }
}
