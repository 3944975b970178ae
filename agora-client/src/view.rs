use std::{collections::HashSet, sync::Arc};

use crate::{
    api::{Comment, CommentId, Identity, Time},
    build_thread, excerpt, relative_time, Avatar, AvatarCache, ChatEvent, CommentList, ConnState,
    Depth, SyncUpdate, ThreadedComment,
};

const REPLY_PREVIEW_CHARS: usize = 50;

/// What the owner of a [`ChatView`] should do after applying an update
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Redraw {
    pub changed: bool,
    pub scroll_to_bottom: bool,
}

/// A comment ready to be handed over to [`RealtimeSync::send_message`](crate::RealtimeSync::send_message)
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Draft {
    pub content: String,
    pub parent: Option<CommentId>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReplyPreview {
    pub id: CommentId,
    pub author: String,
    pub excerpt: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommentRow {
    pub id: CommentId,
    pub level: u8,
    pub author: String,
    pub avatar: Avatar,
    pub content: String,
    pub time: String,
    pub is_own: bool,
    pub reply_count: usize,
    pub collapsed: bool,
}

/// Scrolls on growth, unless the user interacted with the list since the last send
#[derive(Clone, Copy, Debug)]
struct AutoScroll {
    prev_len: usize,
    suppressed: bool,
}

impl AutoScroll {
    fn after_change(&mut self, len: usize) -> bool {
        let grew = len > self.prev_len;
        self.prev_len = len;
        grew && !self.suppressed
    }
}

/// Chat state of one room, as seen by one user
pub struct ChatView {
    identity: Identity,
    is_moderator: bool,
    connected: bool,
    list: CommentList,
    collapsed: HashSet<CommentId>,
    reply_target: Option<CommentId>,
    scroll: AutoScroll,
    avatars: Arc<AvatarCache>,
}

impl ChatView {
    pub fn new(identity: Identity, history: Vec<Comment>, avatars: Arc<AvatarCache>) -> ChatView {
        let list = CommentList::new(history);
        ChatView {
            identity,
            is_moderator: false,
            connected: false,
            scroll: AutoScroll {
                prev_len: list.len(),
                suppressed: false,
            },
            list,
            collapsed: HashSet::new(),
            reply_target: None,
            avatars,
        }
    }

    pub fn with_moderator(mut self, is_moderator: bool) -> ChatView {
        self.is_moderator = is_moderator;
        self
    }

    pub fn comments(&self) -> &[Comment] {
        self.list.comments()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn apply(&mut self, update: SyncUpdate) -> Redraw {
        match update {
            SyncUpdate::Connection(state) => {
                let connected = state == ConnState::Connected;
                let changed = connected != self.connected;
                self.connected = connected;
                Redraw {
                    changed,
                    scroll_to_bottom: false,
                }
            }
            SyncUpdate::Chat(evt) => self.apply_chat(evt),
        }
    }

    fn apply_chat(&mut self, evt: ChatEvent) -> Redraw {
        let promoted = match &evt {
            ChatEvent::Confirmed { temp_id, comment } => {
                Some((CommentId::Temporary(*temp_id), comment.id))
            }
            _ => None,
        };
        if !self.list.apply(evt) {
            return Redraw::default();
        }
        if let Some((temp, confirmed)) = promoted {
            if self.collapsed.remove(&temp) {
                self.collapsed.insert(confirmed);
            }
            if self.reply_target == Some(temp) {
                self.reply_target = Some(confirmed);
            }
        }

        let list = &self.list;
        self.collapsed.retain(|id| list.get(id).is_some());
        if let Some(target) = self.reply_target {
            if list.get(&target).is_none() {
                tracing::debug!(?target, "reply target vanished");
                self.reply_target = None;
            }
        }
        Redraw {
            changed: true,
            scroll_to_bottom: self.scroll.after_change(self.list.len()),
        }
    }

    pub fn threads(&self) -> Vec<ThreadedComment> {
        build_thread(self.list.comments(), None, Depth::Top)
    }

    pub fn is_collapsed(&self, id: &CommentId) -> bool {
        self.collapsed.contains(id)
    }

    /// Folds or unfolds the replies of `id`, returning whether it is in the list
    pub fn toggle_collapsed(&mut self, id: CommentId) -> bool {
        let id = self.list.resolve(id);
        if self.list.get(&id).is_none() {
            return false;
        }
        if !self.collapsed.remove(&id) {
            self.collapsed.insert(id);
        }
        self.scroll.suppressed = true;
        true
    }

    /// Starts composing a reply, returning whether `id` could be replied to
    pub fn set_reply_target(&mut self, id: CommentId) -> bool {
        let id = self.list.resolve(id);
        if self.list.get(&id).is_none() {
            return false;
        }
        self.reply_target = Some(id);
        self.scroll.suppressed = true;
        true
    }

    pub fn cancel_reply(&mut self) {
        self.reply_target = None;
        self.scroll.suppressed = false;
    }

    pub fn reply_target(&self) -> Option<&Comment> {
        self.reply_target.and_then(|id| self.list.get(&id))
    }

    pub fn reply_preview(&self) -> Option<ReplyPreview> {
        self.reply_target().map(|c| ReplyPreview {
            id: c.id,
            author: String::from(c.author.display_name()),
            excerpt: excerpt(&c.content, REPLY_PREVIEW_CHARS),
        })
    }

    /// Turns the composer contents into a draft, consuming the reply target
    pub fn compose(&mut self, content: &str) -> Option<Draft> {
        if content.trim().is_empty() || !self.connected {
            return None;
        }
        self.scroll.suppressed = false;
        Some(Draft {
            content: String::from(content),
            parent: self.reply_target.take(),
        })
    }

    /// The comment to hand over to [`RealtimeSync::delete_message`](crate::RealtimeSync::delete_message), if this user may delete it
    pub fn request_delete(&self, id: CommentId) -> Option<CommentId> {
        if !self.is_moderator {
            tracing::debug!(?id, "only moderators can delete comments");
            return None;
        }
        let id = self.list.resolve(id);
        self.list.get(&id).map(|c| c.id)
    }

    pub fn status_line(&self) -> String {
        let n = self.list.len();
        format!(
            "{} • {} message{}",
            match self.connected {
                true => "Connected",
                false => "Disconnected",
            },
            n,
            match n {
                1 => "",
                _ => "s",
            }
        )
    }

    pub fn rows(&self, now: Time) -> Vec<CommentRow> {
        let mut res = Vec::with_capacity(self.list.len());
        for t in self.threads() {
            let collapsed = self.collapsed.contains(&t.comment.id);
            res.push(self.row(&t.comment, 0, t.reply_count(), collapsed, now));
            if collapsed {
                continue;
            }
            for r in t.replies.iter().flatten() {
                res.push(self.row(&r.comment, Depth::Reply.level(), 0, false, now));
            }
        }
        res
    }

    fn row(
        &self,
        c: &Comment,
        level: u8,
        reply_count: usize,
        collapsed: bool,
        now: Time,
    ) -> CommentRow {
        CommentRow {
            id: c.id,
            level,
            author: String::from(c.author.display_name()),
            avatar: self.avatars.resolve(&c.author),
            content: c.content.clone(),
            time: relative_time(c.created_at, now),
            is_own: c.author.name == self.identity.display_name,
            reply_count,
            collapsed,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use futures::{channel::mpsc, StreamExt};

    use super::*;
    use crate::{
        api::{Author, ConfirmedId, ResourceId, RoomName, TempId, UserId, Uuid},
        RealtimeSync, SendOutcome,
    };

    fn at(secs: i64) -> Time {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn id(i: i64) -> CommentId {
        CommentId::Confirmed(ConfirmedId(i))
    }

    fn comment(i: i64, parent: Option<i64>, author: &str) -> Comment {
        Comment {
            id: id(i),
            content: format!("comment {i}"),
            author: Author {
                name: String::from(author),
                avatar_url: None,
            },
            created_at: at(i),
            parent_id: parent.map(id),
        }
    }

    fn view(history: Vec<Comment>) -> ChatView {
        let mut v = ChatView::new(
            Identity::new(UserId::stub(), String::from("ana")),
            history,
            Arc::new(AvatarCache::default()),
        );
        v.apply(SyncUpdate::Connection(ConnState::Connected));
        v
    }

    fn add(c: Comment) -> SyncUpdate {
        SyncUpdate::Chat(ChatEvent::BroadcastAdd(c))
    }

    #[test]
    fn status_line() {
        let mut v = view(vec![comment(1, None, "bob")]);
        assert_eq!(v.status_line(), "Connected • 1 message");
        v.apply(add(comment(2, None, "bob")));
        v.apply(SyncUpdate::Connection(ConnState::Connecting));
        assert_eq!(v.status_line(), "Disconnected • 2 messages");
    }

    #[test]
    fn scrolls_only_on_growth() {
        let mut v = view(vec![comment(1, None, "bob")]);
        assert!(v.apply(add(comment(2, None, "bob"))).scroll_to_bottom);

        let mut edited = comment(2, None, "bob");
        edited.content = String::from("edited");
        let r = v.apply(add(edited));
        assert!(r.changed);
        assert!(!r.scroll_to_bottom);

        let r = v.apply(SyncUpdate::Chat(ChatEvent::BroadcastDelete(id(2))));
        assert!(r.changed);
        assert!(!r.scroll_to_bottom);
        assert_eq!(v.apply(add(comment(1, None, "bob"))), Redraw::default());
    }

    #[test]
    fn manual_interaction_suppresses_scroll_until_send() {
        let mut v = view(vec![comment(1, None, "bob")]);
        v.toggle_collapsed(id(1));
        assert!(!v.apply(add(comment(2, None, "bob"))).scroll_to_bottom);
        assert!(!v.apply(add(comment(3, None, "bob"))).scroll_to_bottom);

        assert!(v.compose("hi").is_some());
        assert!(v.apply(add(comment(4, None, "ana"))).scroll_to_bottom);

        assert!(v.set_reply_target(id(4)));
        assert!(!v.apply(add(comment(5, None, "bob"))).scroll_to_bottom);
        v.cancel_reply();
        assert!(v.apply(add(comment(6, None, "bob"))).scroll_to_bottom);
    }

    #[test]
    fn compose_consumes_reply_target() {
        let mut v = view(vec![comment(1, None, "bob")]);
        assert_eq!(v.compose("   "), None);
        assert!(v.set_reply_target(id(1)));
        assert!(!v.set_reply_target(id(7)));
        assert_eq!(
            v.compose("sure"),
            Some(Draft {
                content: String::from("sure"),
                parent: Some(id(1)),
            })
        );
        assert_eq!(v.reply_target(), None);
        assert_eq!(v.compose("again").unwrap().parent, None);

        v.apply(SyncUpdate::Connection(ConnState::Idle));
        assert_eq!(v.compose("offline"), None);
    }

    #[test]
    fn reply_preview_truncates() {
        let mut long = comment(1, None, "bob");
        long.content = "x".repeat(60);
        let mut v = view(vec![long]);
        assert_eq!(v.reply_preview(), None);
        v.set_reply_target(id(1));
        let preview = v.reply_preview().unwrap();
        assert_eq!(preview.author, "bob");
        assert_eq!(preview.excerpt, format!("{}...", "x".repeat(50)));
    }

    #[test]
    fn ui_state_follows_confirmation() {
        let mut v = view(vec![]);
        let temp_id = TempId::generate();
        let mut temp = comment(0, None, "ana");
        temp.id = CommentId::Temporary(temp_id);
        v.apply(SyncUpdate::Chat(ChatEvent::OptimisticAdd(temp.clone())));
        v.toggle_collapsed(temp.id);
        v.set_reply_target(temp.id);

        v.apply(SyncUpdate::Chat(ChatEvent::Confirmed {
            temp_id,
            comment: temp.confirmed_as(ConfirmedId(9)),
        }));
        assert!(v.is_collapsed(&id(9)));
        assert!(!v.is_collapsed(&temp.id));
        assert_eq!(v.reply_target().map(|c| c.id), Some(id(9)));
    }

    #[test]
    fn late_confirmation_of_removed_comment_leaves_no_state() {
        let mut v = view(vec![]);
        let temp_id = TempId::generate();
        let mut temp = comment(0, None, "ana");
        temp.id = CommentId::Temporary(temp_id);
        v.apply(SyncUpdate::Chat(ChatEvent::OptimisticAdd(temp.clone())));
        assert!(v.toggle_collapsed(temp.id));
        assert!(v.set_reply_target(temp.id));

        v.apply(SyncUpdate::Chat(ChatEvent::RollbackRemove(temp_id)));
        let r = v.apply(SyncUpdate::Chat(ChatEvent::Confirmed {
            temp_id,
            comment: temp.confirmed_as(ConfirmedId(9)),
        }));
        assert_eq!(r, Redraw::default());
        assert!(v.comments().is_empty());
        assert!(v.collapsed.is_empty());
        assert_eq!(v.reply_target, None);
    }

    #[test]
    fn only_listed_comments_collapse() {
        let mut v = view(vec![comment(1, None, "bob")]);
        assert!(!v.toggle_collapsed(id(7)));
        assert!(!v.is_collapsed(&id(7)));
        // not an interaction, so auto-scroll stays on
        assert!(v.apply(add(comment(2, None, "bob"))).scroll_to_bottom);
        assert!(v.toggle_collapsed(id(1)));
        assert!(v.is_collapsed(&id(1)));
    }

    #[test]
    fn avatars_are_never_borrowed_from_other_comments() {
        let mut v = view(vec![]);
        let mut with_picture = comment(1, None, "hugo");
        with_picture.author.avatar_url = Some(String::from("https://example.org/hugo.png"));
        v.apply(add(with_picture));
        v.apply(add(comment(2, None, "hugo")));
        let avatars = v
            .rows(at(3))
            .into_iter()
            .map(|r| r.avatar)
            .collect::<Vec<_>>();
        assert_eq!(
            avatars,
            vec![
                Avatar::Url(String::from("https://example.org/hugo.png")),
                Avatar::Initial(String::from("H")),
            ]
        );
    }

    #[test]
    fn ui_state_forgets_deleted_comments() {
        let mut v = view(vec![comment(1, None, "bob"), comment(2, Some(1), "bob")]);
        v.toggle_collapsed(id(1));
        v.set_reply_target(id(2));
        v.apply(SyncUpdate::Chat(ChatEvent::BroadcastDelete(id(2))));
        assert_eq!(v.reply_target(), None);
        v.apply(SyncUpdate::Chat(ChatEvent::BroadcastDelete(id(1))));
        assert!(!v.is_collapsed(&id(1)));
    }

    #[test]
    fn rows_hide_collapsed_replies() {
        let mut v = view(vec![
            comment(1, None, "bob"),
            comment(2, Some(1), "ana"),
            comment(3, Some(2), "bob"),
            comment(4, None, "ana"),
        ]);
        let now = at(4) + Duration::minutes(3);
        let rows = v.rows(now);
        let shape = rows
            .iter()
            .map(|r| (r.id, r.level, r.reply_count, r.is_own))
            .collect::<Vec<_>>();
        assert_eq!(
            shape,
            vec![
                (id(1), 0, 2, false),
                (id(2), 1, 0, true),
                (id(3), 1, 0, false),
                (id(4), 0, 0, true),
            ]
        );
        assert_eq!(rows[3].time, "3m");
        assert_eq!(rows[0].avatar, Avatar::Initial(String::from("B")));

        v.toggle_collapsed(id(1));
        let rows = v.rows(now);
        assert_eq!(rows.len(), 2);
        assert!(rows[0].collapsed);
        assert_eq!(rows[0].reply_count, 2);
    }

    #[test]
    fn only_moderators_delete() {
        let v = view(vec![comment(1, None, "bob")]);
        assert_eq!(v.request_delete(id(1)), None);
        let v = v.with_moderator(true);
        assert_eq!(v.request_delete(id(1)), Some(id(1)));
        assert_eq!(v.request_delete(id(2)), None);
    }

    async fn pump(
        view: &mut ChatView,
        updates: &mut mpsc::UnboundedReceiver<SyncUpdate>,
        done: impl Fn(&ChatView) -> bool,
    ) {
        let res = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !done(view) {
                match updates.next().await {
                    Some(u) => {
                        view.apply(u);
                    }
                    None => panic!("engine went away"),
                }
            }
        })
        .await;
        if res.is_err() {
            panic!("timed out pumping updates");
        }
    }

    #[tokio::test]
    async fn hello_reaches_the_other_tab() {
        use agora_mock_server::{MockBroker, MockStore};

        let resource = ResourceId(7);
        let room = RoomName::for_resource(resource);
        let store = Arc::new(MockStore::with_next_id(42));
        let broker = MockBroker::new();
        let avatars = Arc::new(AvatarCache::default());

        let mut tabs = Vec::new();
        for name in ["hugo", "ines"] {
            let identity = Identity::new(UserId(Uuid::new_v4()), String::from(name));
            let (sender, updates) = mpsc::unbounded();
            let sync = Arc::new(RealtimeSync::new(
                room.clone(),
                identity.clone(),
                resource,
                store.clone(),
                sender,
            ));
            let history = sync.refresh().await.unwrap();
            tokio::spawn({
                let sync = sync.clone();
                let broker = broker.clone();
                async move { sync.run(&broker).await }
            });
            let view = ChatView::new(identity, history, avatars.clone());
            tabs.push((sync, updates, view));
        }
        for (_, updates, view) in tabs.iter_mut() {
            pump(view, updates, |v| v.is_connected()).await;
        }
        let (b, a) = (tabs.pop().unwrap(), tabs.pop().unwrap());
        let (a_sync, mut a_updates, mut a_view) = a;
        let (_b_sync, mut b_updates, mut b_view) = b;

        store.pause_inserts();
        let draft = a_view.compose("hello").unwrap();
        let send = tokio::spawn({
            let sync = a_sync.clone();
            async move { sync.send_message(&draft.content, draft.parent).await }
        });
        pump(&mut a_view, &mut a_updates, |v| v.comments().len() == 1).await;
        assert!(a_view.comments()[0].id.is_temporary());
        assert_eq!(a_view.comments()[0].content, "hello");

        store.resume_inserts();
        assert_eq!(
            send.await.unwrap().unwrap(),
            SendOutcome::Confirmed(ConfirmedId(42))
        );
        pump(&mut a_view, &mut a_updates, |v| v.comments()[0].id == id(42)).await;
        pump(&mut b_view, &mut b_updates, |v| {
            v.comments().first().map(|c| c.id) == Some(id(42))
        })
        .await;

        let rows = b_view.rows(Utc::now());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "hello");
        assert_eq!(rows[0].author, "hugo");
        assert_eq!(rows[0].avatar, Avatar::Initial(String::from("H")));
        assert!(!rows[0].is_own);
        assert_eq!(rows[0].time, "now");
        assert!(a_view.rows(Utc::now())[0].is_own);
    }
}
