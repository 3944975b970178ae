use async_trait::async_trait;

use crate::{Comment, ConfirmedId, NewComment, ResourceId};

/// Durable comment table
///
/// The store does not cascade deletes: callers compute the closure of replies
/// with [`MessageStore::list_children`] and hand the whole set to
/// [`MessageStore::delete_many`].
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Chronologically ordered history of a resource's comments
    async fn list_for_resource(&self, resource: ResourceId) -> anyhow::Result<Vec<Comment>>;

    async fn insert(&self, comment: NewComment) -> anyhow::Result<ConfirmedId>;

    /// Direct replies only
    async fn list_children(&self, id: ConfirmedId) -> anyhow::Result<Vec<ConfirmedId>>;

    async fn delete_many(&self, ids: &[ConfirmedId]) -> anyhow::Result<()>;
}
