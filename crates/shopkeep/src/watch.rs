//! Follow the inbox or a conversation until interrupted.

use std::path::Path;
use std::time::Duration;

use miette::Result;
use shopkeep_sync::handoff::RESUME_CHAT;
use shopkeep_sync::{CacheEvent, DashboardClient, Handoff, Payload, QueryHandle};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::render;

/// How often notices are flushed and idle entries evicted.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(client: &DashboardClient, chat: Option<String>, handoff_path: &Path) -> Result<()> {
    let chat = match chat {
        Some(chat) => Some(chat),
        None => resume_chat(handoff_path),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<CacheEvent>();
    let notify = move |event: &CacheEvent| {
        let _ = tx.send(event.clone());
    };

    let handle: QueryHandle<Payload> = match &chat {
        Some(chat_id) => {
            info!(chat_id, demo = client.is_demo_chat(chat_id), "watching conversation");
            client.watch_messages(chat_id, notify)
        }
        None => {
            info!("watching inbox");
            client.watch_chats(notify)
        }
    };

    let mut housekeeping = tokio::time::interval(HOUSEKEEPING_INTERVAL);
    let mut rendered: Option<Payload> = None;

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }

            Some(event) = rx.recv() => {
                debug!(key = %event.key(), "update");
                let Some(payload) = handle.data() else {
                    continue;
                };
                if rendered.as_ref() == Some(&payload) {
                    continue;
                }
                print_payload(&payload, handle.status());
                rendered = Some(payload);
            }

            _ = housekeeping.tick() => {
                for notice in client.notices().drain() {
                    eprintln!("{}", render::notice_line(&notice));
                }
                let evicted = client.evict_idle();
                if evicted > 0 {
                    debug!(evicted, "evicted idle entries");
                }
            }
        }
    }

    drop(handle);
    client.poller().stop_all();
    Ok(())
}

fn resume_chat(path: &Path) -> Option<String> {
    match Handoff::open(path).and_then(|handoff| handoff.take(RESUME_CHAT)) {
        Ok(chat) => chat,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not read handoff file");
            None
        }
    }
}

fn print_payload(payload: &Payload, status: shopkeep_sync::EntryStatus) {
    match payload {
        Payload::Chats(chats) => {
            println!("Chats{}", render::status_note(status));
            for chat in chats {
                println!("  {}", render::chat_line(chat));
            }
        }
        Payload::Messages(messages) => {
            println!("Conversation{}", render::status_note(status));
            for message in messages {
                println!("  {}", render::message_line(message));
            }
        }
    }
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resume_chat_is_consumed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("handoff.json");
        Handoff::open(&path).unwrap().put(RESUME_CHAT, "chat-3").unwrap();

        assert_eq!(resume_chat(&path).as_deref(), Some("chat-3"));
        assert_eq!(resume_chat(&path), None);
    }
}
