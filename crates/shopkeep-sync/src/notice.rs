//! Transient, dismissible user-facing notices.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
    posted: Instant,
}

/// Queue of notices that expire after a fixed time unless dismissed first.
pub struct NoticeBoard {
    ttl: Duration,
    notices: Mutex<Vec<Notice>>,
    next_id: AtomicU64,
}

impl NoticeBoard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            notices: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Post a notice and return its id.
    pub fn push(&self, level: NoticeLevel, message: impl Into<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.notices.lock().push(Notice {
            id,
            level,
            message: message.into(),
            created_at: Utc::now(),
            posted: Instant::now(),
        });
        id
    }

    /// Remove a notice before it expires.
    pub fn dismiss(&self, id: u64) -> bool {
        let mut notices = self.notices.lock();
        let before = notices.len();
        notices.retain(|n| n.id != id);
        notices.len() != before
    }

    /// Unexpired notices, oldest first.
    pub fn active(&self) -> Vec<Notice> {
        let mut notices = self.notices.lock();
        let ttl = self.ttl;
        notices.retain(|n| n.posted.elapsed() < ttl);
        notices.clone()
    }

    /// Take every unexpired notice, leaving the board empty.
    pub fn drain(&self) -> Vec<Notice> {
        let mut notices = self.notices.lock();
        let ttl = self.ttl;
        notices.retain(|n| n.posted.elapsed() < ttl);
        std::mem::take(&mut *notices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_notices_expire() {
        let board = NoticeBoard::new(Duration::from_secs(5));
        board.push(NoticeLevel::Error, "send failed");
        assert_eq!(board.active().len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(board.active().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_and_drain() {
        let board = NoticeBoard::new(Duration::from_secs(5));
        let first = board.push(NoticeLevel::Info, "one");
        board.push(NoticeLevel::Warning, "two");

        assert!(board.dismiss(first));
        assert!(!board.dismiss(first));

        let drained = board.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message, "two");
        assert_eq!(drained[0].level, NoticeLevel::Warning);
        assert!(board.active().is_empty());
    }
}
