use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use shared::domain::{MessageId, RoomId};
use sync_engine::{
    load_settings, load_settings_from, settings::apply_env_overrides, ChatSession, ChatSnapshot,
    ConnectionStatus,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; `chat_sync.toml` in the working directory when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Room to join on startup.
    #[arg(long)]
    room: Option<Uuid>,
    #[arg(long)]
    remote_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => {
            let mut settings = load_settings_from(path)
                .with_context(|| format!("loading {}", path.display()))?;
            apply_env_overrides(&mut settings, |name| std::env::var(name).ok());
            settings
        }
        None => load_settings(),
    };
    if let Some(remote_url) = args.remote_url {
        settings.remote_url = remote_url;
    }

    let session = Arc::new(ChatSession::from_settings(&settings)?);
    let profile = session.start().await?;
    println!("signed in as {} ({:?})", profile.display_name, profile.role);

    if let Some(room) = args.room {
        let room = session.join_room(RoomId(room)).await?;
        println!("joined #{}", room.name);
    }

    let printer = tokio::spawn(print_updates(Arc::clone(&session)));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Err(err) = run_command(&session, line).await {
            warn!(error = %format!("{err:#}"), "command failed");
        }
    }

    printer.abort();
    session.shutdown().await;
    Ok(())
}

async fn run_command(session: &ChatSession, line: &str) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "/join" => {
            let id: Uuid = rest.trim().parse().context("usage: /join <room-id>")?;
            let room = session.join_room(RoomId(id)).await?;
            println!("joined #{}", room.name);
        }
        "/leave" => {
            let room_id = session
                .snapshot()
                .active_room
                .context("no active room")?;
            session.leave_room(room_id).await?;
        }
        "/rooms" => {
            for room in session.refresh_rooms().await? {
                println!("{}  #{}", room.id, room.name);
            }
        }
        "/older" => {
            let loaded = session.load_older_messages().await?;
            println!("loaded {loaded} older messages");
        }
        "/typing" => session.set_typing(rest.trim() != "off").await?,
        "/edit" => {
            let (id, body) = rest.split_once(' ').context("usage: /edit <message-id> <text>")?;
            let id: Uuid = id.parse().context("invalid message id")?;
            session.edit_message(MessageId(id), body).await?;
        }
        "/delete" => {
            let id: Uuid = rest.trim().parse().context("usage: /delete <message-id>")?;
            session.delete_message(MessageId(id)).await?;
        }
        "/reconnect" => session.reconnect_now().await?,
        _ => {
            session.send_message(line, Vec::new()).await?;
        }
    }
    Ok(())
}

/// Prints confirmed messages, typing users and connection changes as the
/// snapshot evolves.
async fn print_updates(session: Arc<ChatSession>) {
    let mut updates = session.watch();
    let mut seen: HashSet<MessageId> = HashSet::new();
    let mut status = ConnectionStatus::Disconnected;
    let mut typing_line = String::new();
    loop {
        let snapshot = updates.borrow_and_update().clone();
        print_snapshot(&snapshot, &mut seen, &mut status, &mut typing_line);
        if updates.changed().await.is_err() {
            break;
        }
    }
}

fn print_snapshot(
    snapshot: &ChatSnapshot,
    seen: &mut HashSet<MessageId>,
    status: &mut ConnectionStatus,
    typing_line: &mut String,
) {
    if snapshot.connection.status != *status {
        *status = snapshot.connection.status;
        match &snapshot.connection.last_error {
            Some(error) => info!(status = status.as_str(), %error, "connection changed"),
            None => info!(status = status.as_str(), "connection changed"),
        }
    }
    for message in snapshot.active_messages() {
        if message.pending || !seen.insert(message.id) {
            continue;
        }
        let edited = if message.edited { " (edited)" } else { "" };
        println!(
            "[{}] {}: {}{edited}",
            message.created_at.format("%H:%M"),
            message.author_id,
            message.body
        );
    }
    let typers = snapshot
        .active_room
        .and_then(|room_id| snapshot.typing.get(&room_id))
        .map(|users| {
            users
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        })
        .unwrap_or_default();
    if typers != *typing_line {
        if !typers.is_empty() {
            println!("typing: {typers}");
        }
        *typing_line = typers;
    }
}
