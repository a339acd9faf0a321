use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use serde_json::json;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use inboxsync_core::{
    EntityLinker, Ingestor, MailStore, SqliteMailStore, ThreadFlags, ThreadMatcher, now_ts,
};
use inboxsync_mail::{ImapConnector, SendRequest, Sender, SmtpConnector, SyncEngine};

use super::cli::{
    CliCommand, InboxesCommand, MessageCommand, ThreadCommand, ThreadsCommand, toggle,
};
use super::cli_config::{AppConfig, resolve_db_path};
use super::cli_runtime_helpers::{inbox_to_json, output_error, output_ok, resolve_inbox};

pub(crate) fn run_cli(
    rt: &tokio::runtime::Runtime,
    command: CliCommand,
    config: &AppConfig,
) -> Result<()> {
    let store = rt.block_on(open_store(config))?;
    let ingestor = Ingestor::new(
        Arc::new(store.clone()),
        Arc::new(ThreadMatcher::default()),
        EntityLinker::new(Arc::new(store.clone())),
    );

    match command {
        CliCommand::Inboxes(cmd) => match cmd.command {
            InboxesCommand::List => {
                let inboxes = rt.block_on(store.list_inboxes())?;
                let out: Vec<_> = inboxes.iter().map(inbox_to_json).collect();
                output_ok(json!(out))
            }
        },
        CliCommand::Sync(cmd) => {
            let engine = sync_engine(ingestor, config);
            if let Some(selector) = cmd.inbox.as_deref() {
                let inbox = rt.block_on(resolve_inbox(&store, selector))?;
                let report = rt.block_on(engine.sync_inbox(inbox.id))?;
                return output_ok(json!({ "inbox_id": inbox.id, "report": report }));
            }
            let fleet = if cmd.due {
                rt.block_on(engine.sync_due(now_ts()))?
            } else {
                rt.block_on(engine.sync_all())?
            };
            output_ok(json!(fleet))
        }
        CliCommand::Watch(cmd) => {
            let engine = sync_engine(ingestor, config);
            let period = Duration::from_secs(cmd.interval_secs.max(1));
            rt.block_on(async {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {
                            info!("watch stopped");
                            return Ok::<(), anyhow::Error>(());
                        }
                        _ = ticker.tick() => {
                            match engine.sync_due(now_ts()).await {
                                Ok(fleet) => output_ok(json!(fleet))?,
                                Err(err) => {
                                    warn!(error = %err, "due sync failed");
                                    output_error(&err.to_string())?;
                                }
                            }
                        }
                    }
                }
            })
        }
        CliCommand::Send(cmd) => {
            let inbox = rt.block_on(resolve_inbox(&store, &cmd.inbox))?;
            let sender = Sender::new(ingestor, Arc::new(SmtpConnector));
            let request = SendRequest {
                inbox_id: inbox.id,
                to: cmd.to,
                cc: cmd.cc,
                subject: cmd.subject,
                text: cmd.body,
                html: cmd.html,
                in_reply_to: cmd.in_reply_to,
                thread_id: cmd.thread,
                sent_by_user_id: cmd.user_id,
            };
            let receipt = rt.block_on(sender.send(&request))?;
            output_ok(json!(receipt))
        }
        CliCommand::Threads(cmd) => match cmd.command {
            ThreadsCommand::List(args) => {
                let inbox = rt.block_on(resolve_inbox(&store, &args.inbox))?;
                let threads = rt.block_on(store.list_threads(
                    inbox.id,
                    args.archived,
                    Some(args.limit.max(1)),
                ))?;
                output_ok(json!(threads))
            }
        },
        CliCommand::Thread(cmd) => match cmd.command {
            ThreadCommand::Show(args) => {
                let thread = rt
                    .block_on(store.get_thread(args.id))?
                    .ok_or_else(|| anyhow!("Thread not found"))?;
                let messages = rt.block_on(store.thread_messages(thread.id))?;
                output_ok(json!({ "thread": thread, "messages": messages }))
            }
            ThreadCommand::Flag(args) => {
                let flags = ThreadFlags {
                    read: toggle(args.read, args.unread),
                    starred: toggle(args.star, args.unstar),
                    archived: toggle(args.archive, args.unarchive),
                };
                if flags.read.is_none() && flags.starred.is_none() && flags.archived.is_none() {
                    return output_error("No flag change given");
                }
                rt.block_on(store.set_thread_flags(args.id, &flags))?;
                let thread = rt.block_on(store.get_thread(args.id))?;
                output_ok(json!(thread))
            }
            ThreadCommand::LinkBooking(args) => {
                let booking = if args.clear { None } else { args.booking };
                rt.block_on(store.set_thread_booking(args.id, booking))?;
                let thread = rt.block_on(store.get_thread(args.id))?;
                output_ok(json!(thread))
            }
        },
        CliCommand::Message(cmd) => match cmd.command {
            MessageCommand::Flag(args) => {
                let read = toggle(args.read, args.unread);
                let starred = toggle(args.star, args.unstar);
                if read.is_none() && starred.is_none() {
                    return output_error("No flag change given");
                }
                rt.block_on(store.set_message_flags(args.id, read, starred))?;
                output_ok(json!({ "id": args.id, "read": read, "starred": starred }))
            }
        },
    }
}

/// Opens and migrates the store, then upserts every configured inbox.
async fn open_store(config: &AppConfig) -> Result<SqliteMailStore> {
    let store = SqliteMailStore::connect(&resolve_db_path(&config.db_path)).await?;
    store.init().await?;
    for inbox in &config.inboxes {
        store.upsert_inbox(inbox).await?;
    }
    Ok(store)
}

fn sync_engine(ingestor: Ingestor, config: &AppConfig) -> SyncEngine {
    let connector = ImapConnector::new(
        &config.mailbox,
        config.fetch_chunk_size,
        Duration::from_secs(config.connect_timeout_secs),
    )
    .with_fetch_timeout(Duration::from_secs(config.fetch_timeout_secs));
    SyncEngine::new(ingestor, Arc::new(connector))
}
