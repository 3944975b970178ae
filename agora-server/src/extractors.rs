use std::sync::Arc;

use agora_api::{MessageStore, RoomName};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path},
    http::request,
};

use crate::{Error, RoomFeeds};

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub store: Arc<dyn MessageStore>,
    pub feeds: RoomFeeds,
}

/// Room name taken from the last path segment, rejected unless well-formed
pub struct ValidRoom(pub RoomName);

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ValidRoom {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &S) -> Result<ValidRoom, Error> {
        let Path(name) = Path::<String>::from_request_parts(req, state)
            .await
            .map_err(|err| anyhow::anyhow!("parsing room path: {err}"))?;
        agora_api::validate_room_name(&name)?;
        Ok(ValidRoom(RoomName(name)))
    }
}
