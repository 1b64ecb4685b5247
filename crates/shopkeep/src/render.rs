//! Plain-text rendering of dashboard records.

use shopkeep_sync::{ChatSummary, EntryStatus, Message, Notice, NoticeLevel, Sender};

pub fn chat_line(chat: &ChatSummary) -> String {
    let ai = if chat.ai_enabled { "ai:on " } else { "ai:off" };
    let unread = if chat.unread_count > 0 {
        format!(" ({} unread)", chat.unread_count)
    } else {
        String::new()
    };
    let last = chat.last_message.as_deref().unwrap_or("");
    format!("{:<16} {} {}{}  {}", chat.id, ai, chat.name, unread, last)
}

pub fn message_line(message: &Message) -> String {
    let who = match message.sender {
        Sender::Customer => "customer",
        Sender::Assistant => "assistant",
        Sender::Operator => "operator",
    };
    let marker = if message.is_pending() { " (sending)" } else { "" };
    format!(
        "[{}] {:>9}: {}{}",
        message.created_at.format("%H:%M"),
        who,
        message.content,
        marker
    )
}

/// Short suffix describing a degraded entry.
pub fn status_note(status: EntryStatus) -> &'static str {
    match status {
        EntryStatus::Error => " [offline, showing last known or demo data]",
        EntryStatus::Loading => " [loading]",
        EntryStatus::Stale => " [refreshing]",
        EntryStatus::Idle | EntryStatus::Fresh => "",
    }
}

pub fn notice_line(notice: &Notice) -> String {
    let level = match notice.level {
        NoticeLevel::Info => "info",
        NoticeLevel::Success => "ok",
        NoticeLevel::Warning => "warn",
        NoticeLevel::Error => "error",
    };
    format!("! {}: {}", level, notice.message)
}
