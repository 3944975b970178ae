use std::collections::{hash_map::Entry, HashMap, VecDeque};

use crate::api::{Comment, CommentId, ConfirmedId, TempId};

// Retired temporary ids remembered at most; echoes older than that are not expected
const RETIRED_CAPACITY: usize = 1024;

/// Every transition the canonical comment list of a room can go through
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChatEvent {
    /// Durable history, fetched from the store
    Loaded(Vec<Comment>),
    BroadcastAdd(Comment),
    BroadcastDelete(CommentId),
    OptimisticAdd(Comment),
    Confirmed { temp_id: TempId, comment: Comment },
    RollbackRemove(TempId),
}

/// Deduplicated list of a room's comments, ordered by creation date
///
/// Ties on the creation date keep the order in which comments entered the list.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommentList {
    comments: Vec<Comment>,

    /// Temporary ids that must never come back: confirmed ones map to their
    /// store id, rolled back or deleted ones to None
    retired: HashMap<TempId, Option<ConfirmedId>>,
    retired_order: VecDeque<TempId>,
}

impl CommentList {
    pub fn new(history: Vec<Comment>) -> CommentList {
        let mut res = CommentList::default();
        res.apply(ChatEvent::Loaded(history));
        res
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn get(&self, id: &CommentId) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == *id)
    }

    /// Follows a temporary id to the id it was confirmed as, if any
    pub fn resolve(&self, id: CommentId) -> CommentId {
        match id {
            CommentId::Temporary(t) => match self.retired.get(&t) {
                Some(Some(confirmed)) => CommentId::Confirmed(*confirmed),
                _ => id,
            },
            CommentId::Confirmed(_) => id,
        }
    }

    /// Applies one event, returning whether the list changed
    pub fn apply(&mut self, event: ChatEvent) -> bool {
        match event {
            ChatEvent::Loaded(history) => self.load(history),
            ChatEvent::BroadcastAdd(c) | ChatEvent::OptimisticAdd(c) => {
                if let Some(t) = c.temp_id() {
                    if self.retired.contains_key(&t) {
                        tracing::trace!(?t, "ignoring late add of a retired temporary comment");
                        return false;
                    }
                }
                let c = Comment {
                    parent_id: c.parent_id.map(|p| self.resolve(p)),
                    ..c
                };
                self.upsert(c)
            }
            ChatEvent::BroadcastDelete(id) => {
                if let CommentId::Temporary(t) = id {
                    self.retire(t, None);
                }
                self.remove(&id)
            }
            ChatEvent::RollbackRemove(t) => {
                self.retire(t, None);
                self.remove(&CommentId::Temporary(t))
            }
            ChatEvent::Confirmed { temp_id, comment } => self.confirm(temp_id, comment),
        }
    }

    fn load(&mut self, history: Vec<Comment>) -> bool {
        let pending = std::mem::take(&mut self.comments)
            .into_iter()
            .filter(|c| c.id.is_temporary())
            .collect::<Vec<_>>();
        let before = pending.len();
        for c in history.into_iter().chain(pending) {
            self.upsert(c);
        }
        tracing::trace!(
            loaded = self.comments.len(),
            kept_pending = before,
            "loaded comment history"
        );
        true
    }

    fn upsert(&mut self, c: Comment) -> bool {
        match self.comments.iter().position(|old| old.id == c.id) {
            Some(pos) => {
                if self.comments[pos] == c {
                    return false;
                }
                let moved = self.comments[pos].created_at != c.created_at;
                self.comments[pos] = c;
                if moved {
                    self.sort();
                }
            }
            None => {
                self.comments.push(c);
                self.sort();
            }
        }
        true
    }

    fn remove(&mut self, id: &CommentId) -> bool {
        let len = self.comments.len();
        self.comments.retain(|c| c.id != *id);
        self.comments.len() != len
    }

    fn confirm(&mut self, temp_id: TempId, comment: Comment) -> bool {
        let confirmed = match comment.id.confirmed() {
            Some(id) => id,
            None => {
                tracing::warn!(?comment, "confirmation does not carry a confirmed id");
                return false;
            }
        };
        if let Some(None) = self.retired.get(&temp_id) {
            tracing::debug!(?temp_id, "confirmation for a comment that was already removed");
            return false;
        }
        self.retire(temp_id, Some(confirmed));

        let temp = CommentId::Temporary(temp_id);
        let mut changed = match self.comments.iter().position(|c| c.id == temp) {
            Some(pos) => {
                // the confirmed record may already be there, eg. from an echo
                self.comments.retain(|c| c.id != comment.id);
                let pos = self
                    .comments
                    .iter()
                    .position(|c| c.id == temp)
                    .unwrap_or(pos);
                self.comments[pos] = comment;
                true
            }
            None => self.upsert(comment),
        };
        for c in self.comments.iter_mut() {
            if c.parent_id == Some(temp) {
                c.parent_id = Some(CommentId::Confirmed(confirmed));
                changed = true;
            }
        }
        changed
    }

    /// A removal never overrides a confirmation
    fn retire(&mut self, t: TempId, confirmed: Option<ConfirmedId>) {
        match self.retired.entry(t) {
            Entry::Occupied(mut e) => {
                if confirmed.is_some() {
                    e.insert(confirmed);
                }
                return;
            }
            Entry::Vacant(e) => {
                e.insert(confirmed);
            }
        }
        self.retired_order.push_back(t);
        while self.retired_order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }

    fn sort(&mut self) {
        // stable, so that equal timestamps keep their insertion order
        self.comments.sort_by_key(|c| c.created_at);
    }
}
