//! Dashboard backend: typed records and the client that wires them into the
//! cache, the poller and the mutation coordinator.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use reqwest::Method;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, info};
use uuid::Uuid;

use crate::binding::QueryHandle;
use crate::bus::{CacheEvent, InvalidationBus};
use crate::config::SyncConfig;
use crate::fallback::{FallbackProvider, FallbackSource};
use crate::fetcher::Fetcher;
use crate::mutation::{MutationCoordinator, optimistic};
use crate::notice::NoticeBoard;
use crate::poller::Poller;
use crate::store::{Loader, loader};
use crate::{CacheStore, FetchFailure, LoadResult, QueryKey, SyncError};

/// Id prefix of messages that exist only as optimistic placeholders.
pub const PENDING_PREFIX: &str = "pending-";

const CHATS: &str = "chats";
const MESSAGES: &str = "messages";

/// Reply appended to demo conversations with the assistant enabled.
const DEMO_AUTO_REPLY: &str = "Thanks! The assistant has received your message and will follow up shortly.";

/// One conversation in the inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub name: String,
    pub ai_enabled: bool,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Customer,
    Assistant,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Whether this is a local placeholder not yet confirmed by the backend.
    pub fn is_pending(&self) -> bool {
        self.id.starts_with(PENDING_PREFIX)
    }
}

/// Cache value type for every dashboard key.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Chats(Vec<ChatSummary>),
    Messages(Vec<Message>),
}

impl Payload {
    pub fn as_chats(&self) -> Option<&[ChatSummary]> {
        match self {
            Self::Chats(chats) => Some(chats),
            Self::Messages(_) => None,
        }
    }

    pub fn as_messages(&self) -> Option<&[Message]> {
        match self {
            Self::Messages(messages) => Some(messages),
            Self::Chats(_) => None,
        }
    }

    pub fn into_chats(self) -> Option<Vec<ChatSummary>> {
        match self {
            Self::Chats(chats) => Some(chats),
            Self::Messages(_) => None,
        }
    }

    pub fn into_messages(self) -> Option<Vec<Message>> {
        match self {
            Self::Messages(messages) => Some(messages),
            Self::Chats(_) => None,
        }
    }
}

pub fn chats_key() -> QueryKey {
    QueryKey::new(CHATS)
}

pub fn messages_key(chat_id: &str) -> QueryKey {
    QueryKey::new(MESSAGES).with_id(chat_id)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageRequest {
    chat_id: String,
    content: String,
    ai_enabled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateChatRequest {
    ai_enabled: bool,
}

#[derive(Debug, Default)]
struct DemoState {
    chats: Vec<ChatSummary>,
    messages: HashMap<String, Vec<Message>>,
    next_id: u64,
}

/// Writable demonstration data.
///
/// Serves the chat list when the backend is unreachable and answers every
/// demo conversation outright. Writes to demo chats land here instead of the
/// network, so the usual invalidate-and-refetch cycle picks them up.
#[derive(Debug, Default)]
pub struct DemoDataset {
    state: RwLock<DemoState>,
}

fn demo_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_704_099_600, 0).unwrap_or_default()
}

impl DemoDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two demo conversations with a short history each.
    pub fn builtin(prefix: &str) -> Self {
        let epoch = demo_epoch();
        let first = format!("{prefix}1");
        let second = format!("{prefix}2");

        let message = |id: &str, chat: &str, sender, content: &str, minutes| Message {
            id: id.to_string(),
            chat_id: chat.to_string(),
            content: content.to_string(),
            sender,
            created_at: epoch + ChronoDuration::minutes(minutes),
        };

        let mut messages = HashMap::new();
        messages.insert(
            first.clone(),
            vec![
                message("demo-m1", &first, Sender::Customer, "Hi, do you have the linen shirt in medium?", 0),
                message("demo-m2", &first, Sender::Assistant, "Yes, the linen shirt is in stock in medium.", 1),
                message("demo-m3", &first, Sender::Customer, "Great, can I order two?", 3),
            ],
        );
        messages.insert(
            second.clone(),
            vec![
                message("demo-m4", &second, Sender::Customer, "Where is my order #1042?", 10),
                message("demo-m5", &second, Sender::Operator, "It shipped this morning, tracking is on the way.", 12),
            ],
        );

        let chats = vec![
            ChatSummary {
                id: first,
                name: "Ana (demo)".to_string(),
                ai_enabled: true,
                last_message: Some("Great, can I order two?".to_string()),
                unread_count: 1,
            },
            ChatSummary {
                id: second,
                name: "Bruno (demo)".to_string(),
                ai_enabled: false,
                last_message: Some("It shipped this morning, tracking is on the way.".to_string()),
                unread_count: 0,
            },
        ];

        Self {
            state: RwLock::new(DemoState {
                chats,
                messages,
                next_id: 1,
            }),
        }
    }

    pub fn chats(&self) -> Vec<ChatSummary> {
        self.state.read().chats.clone()
    }

    pub fn messages(&self, chat_id: &str) -> Option<Vec<Message>> {
        self.state.read().messages.get(chat_id).cloned()
    }

    /// Store an operator message, followed by the automated reply when the
    /// assistant is enabled. Returns the stored operator message.
    pub fn append_message(&self, chat_id: &str, content: &str, ai_enabled: bool) -> Message {
        let mut state = self.state.write();
        let created_at = Utc::now();

        let id = state.next_id;
        state.next_id += 2;
        let sent = Message {
            id: format!("demo-sent-{id}"),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            sender: Sender::Operator,
            created_at,
        };

        let mut appended = vec![sent.clone()];
        if ai_enabled {
            appended.push(Message {
                id: format!("demo-sent-{}", id + 1),
                chat_id: chat_id.to_string(),
                content: DEMO_AUTO_REPLY.to_string(),
                sender: Sender::Assistant,
                created_at: created_at + ChronoDuration::seconds(1),
            });
        }

        let last = appended.last().map(|m| m.content.clone());
        state
            .messages
            .entry(chat_id.to_string())
            .or_default()
            .extend(appended);
        if let Some(chat) = state.chats.iter_mut().find(|c| c.id == chat_id) {
            chat.last_message = last;
        }
        sent
    }

    pub fn set_ai_enabled(&self, chat_id: &str, enabled: bool) -> Option<ChatSummary> {
        let mut state = self.state.write();
        let chat = state.chats.iter_mut().find(|c| c.id == chat_id)?;
        chat.ai_enabled = enabled;
        Some(chat.clone())
    }
}

impl FallbackSource<Payload> for DemoDataset {
    fn resolve(&self, key: &QueryKey) -> Option<Payload> {
        match (key.resource(), key.id()) {
            (CHATS, None) => Some(Payload::Chats(self.chats())),
            (MESSAGES, Some(chat_id)) => self.messages(chat_id).map(Payload::Messages),
            _ => None,
        }
    }
}

/// Everything the dashboard needs to read and write backend data.
pub struct DashboardClient {
    fetcher: Fetcher,
    config: SyncConfig,
    store: Arc<CacheStore<Payload>>,
    poller: Arc<Poller<Payload>>,
    coordinator: MutationCoordinator<Payload>,
    fallback: FallbackProvider<Payload>,
    demo: Arc<DemoDataset>,
    notices: Arc<NoticeBoard>,
}

impl DashboardClient {
    /// Build a client for the backend at `base_url`, seeded with the
    /// built-in demo dataset.
    pub fn new(base_url: impl Into<String>, config: SyncConfig) -> Result<Self, SyncError> {
        let demo = Arc::new(DemoDataset::builtin(&config.demo_prefix));
        Self::with_demo(base_url, config, demo)
    }

    pub fn with_demo(
        base_url: impl Into<String>,
        config: SyncConfig,
        demo: Arc<DemoDataset>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let fetcher = Fetcher::new(base_url, config.request_timeout)?;
        let store = CacheStore::new(InvalidationBus::new(), config.retention);
        let poller = Poller::new(Arc::clone(&store));
        let notices = Arc::new(NoticeBoard::new(config.notice_ttl));
        let coordinator =
            MutationCoordinator::new(Arc::clone(&store), config.revalidate_delays.clone())
                .with_notices(Arc::clone(&notices));
        let source: Arc<dyn FallbackSource<Payload>> = demo.clone();
        let fallback = FallbackProvider::from_shared(config.demo_prefix.clone(), source);

        info!(base_url = %fetcher.base_url(), "dashboard client ready");
        Ok(Self {
            fetcher,
            config,
            store,
            poller,
            coordinator,
            fallback,
            demo,
            notices,
        })
    }

    pub fn store(&self) -> &Arc<CacheStore<Payload>> {
        &self.store
    }

    pub fn poller(&self) -> &Arc<Poller<Payload>> {
        &self.poller
    }

    pub fn notices(&self) -> &Arc<NoticeBoard> {
        &self.notices
    }

    pub fn demo(&self) -> &Arc<DemoDataset> {
        &self.demo
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_demo_chat(&self, chat_id: &str) -> bool {
        self.fallback.is_demo(&messages_key(chat_id))
    }

    /// Loader for the chat list. Falls back to the demo chats.
    pub fn chats_loader(&self) -> Loader<Payload> {
        self.payload_loader(chats_key(), vec!["chats".to_string()], Payload::into_chats, Payload::Chats)
    }

    /// Loader for one conversation. Demo chats never reach the network;
    /// other chats fall back to an empty history.
    pub fn messages_loader(&self, chat_id: &str) -> Loader<Payload> {
        self.payload_loader(
            messages_key(chat_id),
            vec!["messages".to_string(), chat_id.to_string()],
            Payload::into_messages,
            Payload::Messages,
        )
    }

    fn payload_loader<T>(
        &self,
        key: QueryKey,
        segments: Vec<String>,
        extract: fn(Payload) -> Option<T>,
        wrap: fn(T) -> Payload,
    ) -> Loader<Payload>
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        let fetcher = self.fetcher.clone();
        let fallback = self.fallback.clone();

        loader(move || {
            let fetcher = fetcher.clone();
            let fallback = fallback.clone();
            let key = key.clone();
            let segments = segments.clone();
            async move {
                fallback
                    .load(&key, |substitute| async move {
                        let substitute = substitute.and_then(extract).unwrap_or_default();
                        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
                        load_payload(&fetcher, &segments, substitute, wrap).await
                    })
                    .await
            }
        })
    }

    /// Subscribe to the chat list, polled at the configured interval.
    pub fn watch_chats<F>(&self, notify: F) -> QueryHandle<Payload>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        QueryHandle::bind(
            Arc::clone(&self.store),
            Some(Arc::clone(&self.poller)),
            chats_key(),
            self.chats_loader(),
            Some(self.config.chats_poll_interval),
            notify,
        )
    }

    /// Subscribe to one conversation, polled at the configured interval.
    pub fn watch_messages<F>(&self, chat_id: &str, notify: F) -> QueryHandle<Payload>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        QueryHandle::bind(
            Arc::clone(&self.store),
            Some(Arc::clone(&self.poller)),
            messages_key(chat_id),
            self.messages_loader(chat_id),
            Some(self.config.messages_poll_interval),
            notify,
        )
    }

    /// Send an operator message.
    ///
    /// A pending copy is appended to the conversation and shown as the
    /// chat's last message right away. The automated reply, if any, arrives
    /// through the staggered refetches that follow. When the backend accepts
    /// the write without returning a readable record, the pending copy is
    /// returned.
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        ai_enabled: bool,
    ) -> Result<Message, SyncError> {
        let pending = Message {
            id: format!("{PENDING_PREFIX}{}", Uuid::new_v4()),
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            sender: Sender::Operator,
            created_at: Utc::now(),
        };
        let thread = messages_key(chat_id);
        let affected = [thread.clone(), chats_key()];
        let echo = pending.clone();

        let patch = {
            let thread = thread.clone();
            optimistic(move |key: &QueryKey, current: Option<&Payload>| {
                if *key == thread {
                    let mut messages = current
                        .and_then(Payload::as_messages)
                        .map(<[Message]>::to_vec)
                        .unwrap_or_default();
                    messages.push(pending.clone());
                    return Some(Payload::Messages(messages));
                }
                let mut chats = current.and_then(Payload::as_chats)?.to_vec();
                let chat = chats.iter_mut().find(|c| c.id == pending.chat_id)?;
                chat.last_message = Some(pending.content.clone());
                Some(Payload::Chats(chats))
            })
        };

        let is_demo = self.fallback.is_demo(&thread);
        let fetcher = self.fetcher.clone();
        let demo = Arc::clone(&self.demo);
        let request = SendMessageRequest {
            chat_id: chat_id.to_string(),
            content: content.to_string(),
            ai_enabled,
        };

        let sent = self
            .coordinator
            .perform(
                "send_message",
                move || async move {
                    if is_demo {
                        debug!(chat_id = %request.chat_id, "storing message in demo dataset");
                        let stored = demo.append_message(&request.chat_id, &request.content, request.ai_enabled);
                        return Ok(Some(stored));
                    }
                    fetcher.send::<_, Message>(Method::POST, &["messages"], &request).await
                },
                &affected,
                Some(patch),
            )
            .await?
            .unwrap_or(echo);

        info!(chat_id, message_id = %sent.id, "message sent");
        Ok(sent)
    }

    /// Turn the assistant on or off for one chat. The flag flips locally
    /// before the backend confirms it.
    ///
    /// Returns the updated chat as the backend reports it, or as the cache
    /// holds it when the backend acknowledges without a readable record.
    /// `None` means the write was accepted but the chat is not cached.
    pub async fn set_ai_enabled(&self, chat_id: &str, enabled: bool) -> Result<Option<ChatSummary>, SyncError> {
        let target = chat_id.to_string();
        let patch = optimistic(move |_: &QueryKey, current: Option<&Payload>| {
            let mut chats = current.and_then(Payload::as_chats)?.to_vec();
            let chat = chats.iter_mut().find(|c| c.id == target)?;
            chat.ai_enabled = enabled;
            Some(Payload::Chats(chats))
        });

        let is_demo = self.is_demo_chat(chat_id);
        let fetcher = self.fetcher.clone();
        let demo = Arc::clone(&self.demo);
        let id = chat_id.to_string();

        let updated = self
            .coordinator
            .perform(
                "set_ai_enabled",
                move || async move {
                    if is_demo {
                        return match demo.set_ai_enabled(&id, enabled) {
                            Some(chat) => Ok(Some(chat)),
                            None => Err(FetchFailure::Status {
                                status: 404,
                                body: format!("unknown demo chat {id}"),
                            }),
                        };
                    }
                    fetcher
                        .send::<_, ChatSummary>(
                            Method::PATCH,
                            &["chats", id.as_str()],
                            &UpdateChatRequest { ai_enabled: enabled },
                        )
                        .await
                },
                &[chats_key()],
                Some(patch),
            )
            .await?;

        info!(chat_id, enabled, "assistant toggled");
        Ok(updated.or_else(|| self.cached_chat(chat_id)))
    }

    fn cached_chat(&self, chat_id: &str) -> Option<ChatSummary> {
        let chats = self.store.data(&chats_key())?;
        chats.as_chats()?.iter().find(|chat| chat.id == chat_id).cloned()
    }

    /// Drop cache entries nobody has watched within the retention window.
    pub fn evict_idle(&self) -> usize {
        self.store.evict_idle()
    }
}

async fn load_payload<T>(
    fetcher: &Fetcher,
    segments: &[&str],
    fallback: T,
    wrap: fn(T) -> Payload,
) -> LoadResult<Payload>
where
    T: DeserializeOwned,
{
    Ok(fetcher.fetch_with_fallback(segments, fallback).await.map(wrap))
}
