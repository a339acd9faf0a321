use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "inboxsync", version, about = "Shared inbox sync and threading")]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    Inboxes(InboxesCmd),
    Sync(SyncCmd),
    /// Syncs due inboxes on a fixed tick until interrupted.
    Watch(WatchCmd),
    Send(SendCmd),
    Threads(ThreadsCmd),
    Thread(ThreadCmd),
    Message(MessageCmd),
}

#[derive(Args, Debug)]
pub(crate) struct InboxesCmd {
    #[command(subcommand)]
    pub(crate) command: InboxesCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum InboxesCommand {
    List,
}

#[derive(Args, Debug)]
pub(crate) struct SyncCmd {
    /// Inbox id or address.
    #[arg(long, conflicts_with_all = ["all", "due"])]
    pub(crate) inbox: Option<String>,
    #[arg(long, conflicts_with = "due")]
    pub(crate) all: bool,
    #[arg(long)]
    pub(crate) due: bool,
}

#[derive(Args, Debug)]
pub(crate) struct WatchCmd {
    #[arg(long, default_value_t = 60)]
    pub(crate) interval_secs: u64,
}

#[derive(Args, Debug)]
pub(crate) struct SendCmd {
    #[arg(long)]
    pub(crate) inbox: String,
    #[arg(long, required = true)]
    pub(crate) to: Vec<String>,
    #[arg(long)]
    pub(crate) cc: Vec<String>,
    #[arg(long, default_value = "")]
    pub(crate) subject: String,
    #[arg(long)]
    pub(crate) body: String,
    #[arg(long)]
    pub(crate) html: Option<String>,
    #[arg(long = "in-reply-to")]
    pub(crate) in_reply_to: Option<String>,
    #[arg(long)]
    pub(crate) thread: Option<i64>,
    #[arg(long = "user")]
    pub(crate) user_id: Option<i64>,
}

#[derive(Args, Debug)]
pub(crate) struct ThreadsCmd {
    #[command(subcommand)]
    pub(crate) command: ThreadsCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ThreadsCommand {
    List(ThreadsList),
}

#[derive(Args, Debug)]
pub(crate) struct ThreadsList {
    #[arg(long)]
    pub(crate) inbox: String,
    #[arg(long)]
    pub(crate) archived: bool,
    #[arg(long, default_value_t = 50)]
    pub(crate) limit: i64,
}

#[derive(Args, Debug)]
pub(crate) struct ThreadCmd {
    #[command(subcommand)]
    pub(crate) command: ThreadCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum ThreadCommand {
    Show(ThreadShow),
    Flag(ThreadFlag),
    LinkBooking(ThreadLinkBooking),
}

#[derive(Args, Debug)]
pub(crate) struct ThreadShow {
    #[arg(long)]
    pub(crate) id: i64,
}

#[derive(Args, Debug)]
pub(crate) struct ThreadFlag {
    #[arg(long)]
    pub(crate) id: i64,
    #[arg(long, conflicts_with = "unread")]
    pub(crate) read: bool,
    #[arg(long)]
    pub(crate) unread: bool,
    #[arg(long, conflicts_with = "unstar")]
    pub(crate) star: bool,
    #[arg(long)]
    pub(crate) unstar: bool,
    #[arg(long, conflicts_with = "unarchive")]
    pub(crate) archive: bool,
    #[arg(long)]
    pub(crate) unarchive: bool,
}

#[derive(Args, Debug)]
pub(crate) struct ThreadLinkBooking {
    #[arg(long)]
    pub(crate) id: i64,
    #[arg(long, conflicts_with = "clear", required_unless_present = "clear")]
    pub(crate) booking: Option<i64>,
    #[arg(long)]
    pub(crate) clear: bool,
}

#[derive(Args, Debug)]
pub(crate) struct MessageCmd {
    #[command(subcommand)]
    pub(crate) command: MessageCommand,
}

#[derive(Subcommand, Debug)]
pub(crate) enum MessageCommand {
    Flag(MessageFlag),
}

#[derive(Args, Debug)]
pub(crate) struct MessageFlag {
    /// Stored message row id, as printed by `thread show`.
    #[arg(long)]
    pub(crate) id: i64,
    #[arg(long, conflicts_with = "unread")]
    pub(crate) read: bool,
    #[arg(long)]
    pub(crate) unread: bool,
    #[arg(long, conflicts_with = "unstar")]
    pub(crate) star: bool,
    #[arg(long)]
    pub(crate) unstar: bool,
}

/// `--on`/`--off` pair to an optional flag update.
pub(crate) fn toggle(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}
