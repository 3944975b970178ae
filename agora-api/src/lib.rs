use chrono::Utc;

mod comment;
pub use comment::{Author, Comment, CommentId, ConfirmedId, NewComment, TempId};

mod error;
pub use error::Error;

mod feed;
pub use feed::{FeedMessage, RelayMessage};

mod store;
pub use store::MessageStore;

mod transport;
pub use transport::{Channel, ChannelEvent, Subscription, Transport};

mod user;
pub use user::{Identity, UserId};

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct ResourceId(pub i64);

/// Broadcast scope of one discussion thread
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct RoomName(pub String);

impl RoomName {
    pub fn for_resource(resource: ResourceId) -> RoomName {
        RoomName(format!("blog-post-{}", resource.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// Functions that validate strings and times before they reach the store.
// They are called both client-side, to avoid submitting doomed comments, and
// server-side, as the store cannot be trusted to reject them on its own.

pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        return Err(Error::NullByteInString(String::from(s)));
    }
    Ok(())
}

pub fn validate_content(s: &str) -> Result<(), Error> {
    validate_string(s)?;
    if s.trim().is_empty() {
        return Err(Error::EmptyContent);
    }
    Ok(())
}

pub fn validate_room_name(s: &str) -> Result<(), Error> {
    validate_string(s)?;
    if s.is_empty()
        || !s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidRoomName(String::from(s)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_name_for_resource() {
        assert_eq!(RoomName::for_resource(ResourceId(12)).as_str(), "blog-post-12");
        assert!(validate_room_name(RoomName::for_resource(ResourceId(12)).as_str()).is_ok());
    }

    #[test]
    fn content_validation() {
        assert_eq!(validate_content("   \n"), Err(Error::EmptyContent));
        assert_eq!(
            validate_content("a\0b"),
            Err(Error::NullByteInString(String::from("a\0b")))
        );
        assert_eq!(validate_content(" hello "), Ok(()));
    }

    #[test]
    fn room_name_validation() {
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("room/../etc").is_err());
        assert!(validate_room_name("room 1").is_err());
        assert!(validate_room_name("blog-post-1").is_ok());
    }
}
