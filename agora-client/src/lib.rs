mod avatar;
pub use avatar::{fallback_initial, Avatar, AvatarCache};

mod comment;
pub use comment::{ChatEvent, CommentList};

mod format;
pub use format::{excerpt, relative_time};

mod sync;
pub use sync::{
    collect_reply_closure, ConnState, DeleteOutcome, IgnoreReason, RealtimeSync, SendOutcome,
    SyncError, SyncUpdate,
};

mod thread;
pub use thread::{build_thread, Depth, ThreadedComment};

mod view;
pub use view::{ChatView, CommentRow, Draft, Redraw, ReplyPreview};

pub mod api {
    pub use agora_api::*;
}
