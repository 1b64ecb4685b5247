//! One-shot commands.

use std::path::Path;
use std::time::Duration;

use miette::Result;
use shopkeep_sync::handoff::RESUME_CHAT;
use shopkeep_sync::{DashboardClient, EntryStatus, Handoff, chats_key, messages_key};
use tracing::{info, warn};

use crate::render;

pub async fn chats(client: &DashboardClient) -> Result<()> {
    let payload = client
        .store()
        .ensure(&chats_key(), client.chats_loader())
        .await
        .map_err(|e| miette::miette!("failed to load chats: {}", e))?;

    let status = client
        .store()
        .get(&chats_key())
        .map_or(EntryStatus::Idle, |entry| entry.status);
    println!("Chats{}", render::status_note(status));
    for chat in payload.as_chats().unwrap_or_default() {
        println!("  {}", render::chat_line(chat));
    }
    Ok(())
}

/// Send a message, wait for the follow-up refreshes, and print the thread.
///
/// The chat is left in the handoff file so the next `watch` reopens it.
pub async fn send(
    client: &DashboardClient,
    chat_id: &str,
    content: &str,
    ai_enabled: bool,
    handoff_path: &Path,
) -> Result<()> {
    let key = messages_key(chat_id);
    let thread = client.watch_messages(chat_id, |_| {});
    if let Err(e) = thread.load().await {
        warn!(chat_id, error = %e, "could not load conversation before sending");
    }

    let sent = client
        .send_message(chat_id, content, ai_enabled)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    info!(chat_id, message_id = %sent.id, "sent");

    // Give the backend time to append the automated reply.
    let settle = client
        .config()
        .revalidate_delays
        .last()
        .copied()
        .unwrap_or_default();
    tokio::time::sleep(settle + Duration::from_millis(200)).await;

    if let Some(payload) = client.store().data(&key) {
        for message in payload.as_messages().unwrap_or_default() {
            println!("{}", render::message_line(message));
        }
    }

    match Handoff::open(handoff_path) {
        Ok(handoff) => {
            if let Err(e) = handoff.put(RESUME_CHAT, chat_id) {
                warn!(error = %e, "failed to save chat for resume");
            }
        }
        Err(e) => warn!(path = %handoff_path.display(), error = %e, "failed to open handoff file"),
    }
    Ok(())
}

pub async fn toggle_ai(client: &DashboardClient, chat_id: &str, enabled: bool) -> Result<()> {
    if let Err(e) = client.store().ensure(&chats_key(), client.chats_loader()).await {
        warn!(error = %e, "could not load chats before toggling");
    }

    let chat = client
        .set_ai_enabled(chat_id, enabled)
        .await
        .map_err(|e| miette::miette!("{}", e))?;
    match chat {
        Some(chat) => println!("{}", render::chat_line(&chat)),
        None => println!("{:<16} {}", chat_id, if enabled { "ai:on" } else { "ai:off" }),
    }
    Ok(())
}
