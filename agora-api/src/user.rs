use crate::{Author, STUB_UUID};

use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

/// The current user, as handed over by the authentication provider
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Identity {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl Identity {
    pub fn new(id: UserId, display_name: String) -> Identity {
        Identity {
            id,
            display_name,
            avatar_url: None,
        }
    }

    pub fn author(&self) -> Author {
        Author {
            name: self.display_name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}
