use std::{sync::Arc, time::Duration};

use agora_client::{
    api::{
        CommentId, ConfirmedId, Identity, MessageStore, ResourceId, RoomName, UserId, Uuid,
    },
    Avatar, AvatarCache, ChatView, ConnState, RealtimeSync, SyncUpdate,
};
use anyhow::{anyhow, Context};
use futures::{channel::mpsc, StreamExt};
use tokio::io::AsyncBufReadExt;

mod api;

use api::{HttpStore, WsTransport};

// Time to wait between two connection attempts to the room feed
const ATTEMPT_SPACING: Duration = Duration::from_secs(1);
// Time one-shot commands wait for the room subscription to be confirmed
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long, default_value = "http://localhost:3000")]
    host: String,

    /// Id of the user to act as, a fresh one is generated if unset
    #[structopt(long, env = "AGORA_USER_ID")]
    user_id: Option<Uuid>,

    /// Display name to comment under
    #[structopt(long, env = "AGORA_NAME", default_value = "Anonymous")]
    name: String,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Print the comment history of a resource
    History {
        /// Resource the comments are attached to
        resource: i64,
    },

    /// List the direct replies to a comment
    Children { id: i64 },

    /// Post a comment
    Send {
        resource: i64,

        text: String,

        /// Comment to reply to
        #[structopt(long)]
        parent: Option<i64>,
    },

    /// Delete a comment and all its replies
    Delete { resource: i64, id: i64 },

    /// Follow the comments of a resource live, reading commands from stdin
    Watch {
        resource: i64,

        /// Allow deleting comments
        #[structopt(long)]
        moderator: bool,
    },
}

struct Room {
    sync: Arc<RealtimeSync>,
    updates: mpsc::UnboundedReceiver<SyncUpdate>,
    transport: Arc<WsTransport>,
}

impl Room {
    fn new(opt: &Opt, store: Arc<HttpStore>, resource: i64) -> Room {
        let identity = Identity::new(
            UserId(opt.user_id.unwrap_or_else(Uuid::new_v4)),
            opt.name.clone(),
        );
        let resource = ResourceId(resource);
        let (sender, updates) = mpsc::unbounded();
        Room {
            sync: Arc::new(RealtimeSync::new(
                RoomName::for_resource(resource),
                identity,
                resource,
                store,
                sender,
            )),
            updates,
            transport: Arc::new(WsTransport::new(opt.host.clone())),
        }
    }

    /// Keeps the room feed alive until teardown, reloading history between attempts
    fn spawn_connection(&self) -> tokio::task::JoinHandle<()> {
        let sync = self.sync.clone();
        let transport = self.transport.clone();
        tokio::spawn(async move {
            loop {
                if let Err(err) = sync.run(&*transport).await {
                    tracing::warn!(err = format!("{err:#}"), "room feed failed");
                }
                if sync.state() == ConnState::Idle {
                    return;
                }
                tokio::time::sleep(ATTEMPT_SPACING).await;
                if let Err(err) = sync.refresh().await {
                    tracing::warn!(err = format!("{err:#}"), "failed reloading history");
                }
            }
        })
    }

    async fn wait_connected(&mut self) -> anyhow::Result<()> {
        tokio::time::timeout(JOIN_TIMEOUT, async {
            while let Some(update) = self.updates.next().await {
                if let SyncUpdate::Connection(ConnState::Connected) = update {
                    return Ok(());
                }
            }
            Err(anyhow!("room engine stopped"))
        })
        .await
        .context("timed out joining the room")?
    }

    /// Runs `op` against a connected room, then leaves it
    async fn oneshot<F, Fut, T>(mut self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(Arc<RealtimeSync>) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let conn = self.spawn_connection();
        let res = match self.wait_connected().await {
            Ok(()) => op(self.sync.clone()).await,
            Err(err) => Err(err),
        };
        self.sync.teardown().await;
        conn.await.context("joining connection task")?;
        res
    }
}

fn render(view: &ChatView) {
    let now = chrono::Utc::now();
    println!("--- {}", view.status_line());
    for row in view.rows(now) {
        let avatar = match row.avatar {
            Avatar::Url(_) => String::from("@"),
            Avatar::Initial(i) => i,
        };
        let indent = "    ".repeat(usize::from(row.level));
        let own = if row.is_own { "*" } else { " " };
        let mut line = format!(
            "{indent}{own}[{}] ({avatar}) {} {}: {}",
            row.id, row.author, row.time, row.content
        );
        if row.reply_count > 0 {
            let fold = if row.collapsed { "+" } else { "-" };
            line.push_str(&format!("  [{fold}{} replies]", row.reply_count));
        }
        println!("{line}");
    }
    if let Some(preview) = view.reply_preview() {
        println!(
            "replying to {} \"{}\" (/cancel to stop)",
            preview.author, preview.excerpt
        );
    }
}

/// Resolves a comment id as printed by [`render`]
fn lookup(view: &ChatView, arg: &str) -> Option<CommentId> {
    view.comments()
        .iter()
        .map(|c| c.id)
        .find(|id| id.to_string() == arg.trim())
}

async fn watch(mut room: Room, moderator: bool) -> anyhow::Result<()> {
    let avatars = Arc::new(AvatarCache::default());
    let mut view = ChatView::new(room.sync.identity().clone(), Vec::new(), avatars)
        .with_moderator(moderator);
    room.sync
        .refresh()
        .await
        .context("loading comment history")?;
    let conn = room.spawn_connection();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            update = room.updates.next() => {
                let Some(update) = update else { break };
                let redraw = view.apply(update);
                if redraw.changed {
                    render(&view);
                }
            }
            line = stdin.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                let (cmd, arg) = match line.strip_prefix('/') {
                    Some(cmd) => cmd.split_once(' ').unwrap_or((cmd, "")),
                    None => ("", line.as_str()),
                };
                match cmd {
                    "quit" => break,
                    "cancel" => {
                        view.cancel_reply();
                        render(&view);
                    }
                    "reply" => match lookup(&view, arg) {
                        Some(id) if view.set_reply_target(id) => render(&view),
                        _ => println!("no comment {arg:?}"),
                    },
                    "collapse" => match lookup(&view, arg) {
                        Some(id) if view.toggle_collapsed(id) => render(&view),
                        _ => println!("no comment {arg:?}"),
                    },
                    "delete" => match lookup(&view, arg).and_then(|id| view.request_delete(id)) {
                        Some(id) => {
                            let sync = room.sync.clone();
                            tokio::spawn(async move {
                                if let Err(err) = sync.delete_message(id).await {
                                    tracing::error!(err = format!("{err:#}"), "deleting comment");
                                }
                            });
                        }
                        None => println!("cannot delete {arg:?}"),
                    },
                    "" => match view.compose(arg) {
                        Some(draft) => {
                            let sync = room.sync.clone();
                            tokio::spawn(async move {
                                if let Err(err) = sync.send_message(&draft.content, draft.parent).await {
                                    tracing::error!(err = format!("{err:#}"), "sending comment");
                                }
                            });
                        }
                        None if !view.is_connected() => println!("not connected yet"),
                        None => (),
                    },
                    _ => println!("unknown command /{cmd}"),
                }
            }
        }
    }

    room.sync.teardown().await;
    conn.await.context("joining connection task")?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opt = <Opt as structopt::StructOpt>::from_args();
    let store = Arc::new(HttpStore::new(opt.host.clone()));

    match opt.cmd {
        Command::History { resource } => {
            for c in store.list_for_resource(ResourceId(resource)).await? {
                let parent = c.parent_id.map(|p| format!(" (reply to {p})")).unwrap_or_default();
                println!(
                    "[{}] {} {}{parent}: {}",
                    c.id,
                    c.created_at.to_rfc3339(),
                    c.author.display_name(),
                    c.content
                );
            }
        }
        Command::Children { id } => {
            for c in store.list_children(ConfirmedId(id)).await? {
                println!("{c}");
            }
        }
        Command::Send {
            resource,
            ref text,
            parent,
        } => {
            let text = text.clone();
            let outcome = Room::new(&opt, store, resource)
                .oneshot(|sync| async move {
                    let parent = parent.map(|p| CommentId::Confirmed(ConfirmedId(p)));
                    Ok(sync.send_message(&text, parent).await?)
                })
                .await?;
            println!("{outcome:?}");
        }
        Command::Delete { resource, id } => {
            let outcome = Room::new(&opt, store, resource)
                .oneshot(|sync| async move {
                    Ok(sync
                        .delete_message(CommentId::Confirmed(ConfirmedId(id)))
                        .await?)
                })
                .await?;
            println!("{outcome:?}");
        }
        Command::Watch {
            resource,
            moderator,
        } => watch(Room::new(&opt, store, resource), moderator).await?,
    }

    Ok(())
}
