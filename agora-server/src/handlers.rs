use std::sync::Arc;

use agora_api::{Comment, ConfirmedId, MessageStore, NewComment, ResourceId};
use anyhow::Context;
use axum::{
    extract::{Path, State, WebSocketUpgrade},
    Json,
};
use futures::StreamExt;

use crate::{extractors::ValidRoom, Error, RoomFeeds};

pub async fn list_comments(
    State(store): State<Arc<dyn MessageStore>>,
    Path(resource): Path<i64>,
) -> Result<Json<Vec<Comment>>, Error> {
    Ok(Json(
        store
            .list_for_resource(ResourceId(resource))
            .await
            .with_context(|| format!("fetching comments of resource {resource}"))?,
    ))
}

pub async fn insert_comment(
    State(store): State<Arc<dyn MessageStore>>,
    Json(comment): Json<NewComment>,
) -> Result<Json<ConfirmedId>, Error> {
    comment.validate()?;
    let id = store.insert(comment).await.map_err(Error::from_store)?;
    tracing::debug!(?id, "saved comment");
    Ok(Json(id))
}

pub async fn list_children(
    State(store): State<Arc<dyn MessageStore>>,
    Path(id): Path<i64>,
) -> Result<Json<Vec<ConfirmedId>>, Error> {
    Ok(Json(
        store
            .list_children(ConfirmedId(id))
            .await
            .map_err(Error::from_store)?,
    ))
}

pub async fn delete_comments(
    State(store): State<Arc<dyn MessageStore>>,
    Json(ids): Json<Vec<ConfirmedId>>,
) -> Result<(), Error> {
    if ids.is_empty() {
        return Ok(());
    }
    store.delete_many(&ids).await.map_err(Error::from_store)?;
    Ok(())
}

pub async fn room_feed(
    ws: WebSocketUpgrade,
    ValidRoom(room): ValidRoom,
    State(feeds): State<RoomFeeds>,
) -> axum::response::Response {
    ws.on_upgrade(move |sock| {
        tracing::debug!(%room, "room websocket connected");
        let (write, read) = sock.split();
        feeds.add_member(room, write, read)
    })
}
