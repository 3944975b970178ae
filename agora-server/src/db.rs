use agora_api::{
    Author, Comment, CommentId, ConfirmedId, Error as ApiError, MessageStore, NewComment,
    ResourceId, Time,
};
use anyhow::Context;
use async_trait::async_trait;
use futures::TryStreamExt;
use sqlx::Row;

/// The comments table, backed by postgres
///
/// Nothing cascades on the database side: deleting a comment without all of
/// its replies is refused with [`ApiError::HasReplies`].
#[derive(Clone)]
pub struct PgStore {
    pool: sqlx::PgPool,
}

impl PgStore {
    pub fn new(pool: sqlx::PgPool) -> PgStore {
        PgStore { pool }
    }
}

#[async_trait]
impl MessageStore for PgStore {
    async fn list_for_resource(&self, resource: ResourceId) -> anyhow::Result<Vec<Comment>> {
        let mut conn = self.pool.acquire().await.context("acquiring db connection")?;
        sqlx::query(
            "
                SELECT c.id, c.content, c.created_at, c.parent_comment_id,
                    u.display_name, u.avatar_url
                FROM comments c
                LEFT JOIN users u
                    ON u.id = c.author_id
                WHERE c.resource_id = $1
                ORDER BY c.created_at, c.id
            ",
        )
        .bind(resource.0)
        .fetch(&mut *conn)
        .map_err(anyhow::Error::from)
        .and_then(|row| async move {
            let name: Option<String> = row.try_get("display_name")?;
            Ok::<_, anyhow::Error>(Comment {
                id: CommentId::Confirmed(ConfirmedId(row.try_get("id")?)),
                content: row.try_get("content")?,
                author: Author {
                    name: name.unwrap_or_else(|| String::from("Anonymous")),
                    avatar_url: row.try_get("avatar_url")?,
                },
                created_at: row.try_get::<Time, _>("created_at")?,
                parent_id: row
                    .try_get::<Option<i64>, _>("parent_comment_id")?
                    .map(|p| CommentId::Confirmed(ConfirmedId(p))),
            })
        })
        .try_collect()
        .await
        .with_context(|| format!("listing comments of resource {}", resource.0))
    }

    async fn insert(&self, comment: NewComment) -> anyhow::Result<ConfirmedId> {
        comment.validate()?;
        let mut transaction = self.pool.begin().await.context("opening transaction")?;
        if let Some(parent) = comment.parent_id {
            let found = sqlx::query("SELECT resource_id FROM comments WHERE id = $1")
                .bind(parent.0)
                .fetch_optional(&mut *transaction)
                .await
                .with_context(|| format!("checking parent comment {parent}"))?;
            let parent_resource = match found {
                Some(row) => Some(row.try_get::<i64, _>("resource_id")?),
                None => None,
            };
            // replies never cross resources
            if parent_resource != Some(comment.resource_id.0) {
                return Err(ApiError::UnknownParent(parent).into());
            }
        }
        let id: i64 = sqlx::query(
            "
                INSERT INTO comments
                    (author_id, resource_id, content, parent_comment_id, created_at)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING id
            ",
        )
        .bind(comment.author_id.0)
        .bind(comment.resource_id.0)
        .bind(&comment.content)
        .bind(comment.parent_id.map(|p| p.0))
        .bind(comment.created_at)
        .fetch_one(&mut *transaction)
        .await
        .context("inserting comment")?
        .try_get("id")?;
        transaction
            .commit()
            .await
            .context("committing comment insertion")?;
        Ok(ConfirmedId(id))
    }

    async fn list_children(&self, id: ConfirmedId) -> anyhow::Result<Vec<ConfirmedId>> {
        let mut conn = self.pool.acquire().await.context("acquiring db connection")?;
        sqlx::query("SELECT id FROM comments WHERE parent_comment_id = $1 ORDER BY id")
            .bind(id.0)
            .fetch(&mut *conn)
            .map_err(anyhow::Error::from)
            .and_then(|row| async move { Ok::<_, anyhow::Error>(ConfirmedId(row.try_get("id")?)) })
            .try_collect()
            .await
            .with_context(|| format!("listing replies of comment {id}"))
    }

    async fn delete_many(&self, ids: &[ConfirmedId]) -> anyhow::Result<()> {
        let ids = ids.iter().map(|id| id.0).collect::<Vec<i64>>();
        let mut transaction = self.pool.begin().await.context("opening transaction")?;
        let orphaned = sqlx::query(
            "
                SELECT MIN(parent_comment_id) AS parent
                FROM comments
                WHERE parent_comment_id = ANY($1)
                    AND NOT (id = ANY($1))
            ",
        )
        .bind(&ids)
        .fetch_one(&mut *transaction)
        .await
        .with_context(|| format!("checking for replies to comments {ids:?}"))?
        .try_get::<Option<i64>, _>("parent")?;
        if let Some(parent) = orphaned {
            return Err(ApiError::HasReplies(ConfirmedId(parent)).into());
        }
        let res = sqlx::query("DELETE FROM comments WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *transaction)
            .await
            .with_context(|| format!("deleting comments {ids:?}"))?;
        transaction
            .commit()
            .await
            .context("committing comment deletion")?;
        tracing::debug!(requested = ids.len(), deleted = res.rows_affected(), "deleted comments");
        Ok(())
    }
}
