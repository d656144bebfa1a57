//! Remote backend contract and an in-process loopback implementation.
//!
//! The backend owns durable message storage and fan-out. The cache only needs
//! three things from it: accept a write, accept a reaction, and push the full
//! ordered message set every time it changes.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

use super::chat_types::{
    Author, DeliveryStatus, Message, MessageOrigin, OutgoingMessage, Reaction, WireMessage,
};
use crate::error::{ChatlineError, Result};

/// Live feed: every item is the complete ordered message set. Dropping the
/// stream unsubscribes.
pub type FeedStream = BoxStream<'static, Result<Vec<WireMessage>>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Store a message and return its backend-assigned id.
    async fn write_message(&self, message: OutgoingMessage) -> Result<String>;
    async fn add_reaction(&self, message_id: &str, reaction: Reaction) -> Result<()>;
    async fn subscribe(&self) -> Result<FeedStream>;
}

// ── Loopback ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct FeedFrame {
    /// Bumped by `drop_subscriptions`; older subscribers end with an error.
    epoch: u64,
    messages: Arc<Vec<WireMessage>>,
}

#[derive(Default)]
struct LoopbackState {
    messages: Vec<WireMessage>,
    next_id: u64,
}

/// Backend living in the same process. Assigns `srv-<n>` ids, stamps writes
/// with the client time plus a configurable latency, and can echo client
/// tokens, reject writes, or cut off subscribers.
pub struct LoopbackBackend {
    state: Mutex<LoopbackState>,
    feed: watch::Sender<FeedFrame>,
    latency: chrono::Duration,
    echo_tokens: bool,
    fail_writes: AtomicBool,
    write_attempts: AtomicUsize,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        let (feed, _) = watch::channel(FeedFrame {
            epoch: 0,
            messages: Arc::new(Vec::new()),
        });
        Self {
            state: Mutex::new(LoopbackState::default()),
            feed,
            latency: chrono::Duration::milliseconds(50),
            echo_tokens: true,
            fail_writes: AtomicBool::new(false),
            write_attempts: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: chrono::Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Behave like a backend that drops unknown fields from writes.
    pub fn without_token_echo(mut self) -> Self {
        self.echo_tokens = false;
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `write_message` calls, accepted or not.
    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn messages(&self) -> Vec<WireMessage> {
        self.lock().messages.clone()
    }

    /// Store a message authored elsewhere (another participant).
    pub fn inject(&self, author: Author, text: &str) -> String {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("srv-{}", state.next_id);
        state.messages.push(WireMessage {
            id: id.clone(),
            text: Some(text.to_string()),
            image: None,
            location: None,
            created_at: chrono::Utc::now(),
            user: author,
            status: DeliveryStatus::Sent,
            reactions: Vec::new(),
            client_token: None,
            local: false,
        });
        self.publish(&state);
        id
    }

    pub fn set_status(&self, message_id: &str, status: DeliveryStatus) -> bool {
        let mut state = self.lock();
        let Some(msg) = state.messages.iter_mut().find(|m| m.id == message_id) else {
            return false;
        };
        msg.status = status;
        self.publish(&state);
        true
    }

    /// End every open subscription with `SubscriptionLost`.
    pub fn drop_subscriptions(&self) {
        self.feed.send_modify(|frame| frame.epoch += 1);
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, state: &LoopbackState) {
        let mut ordered = state.messages.clone();
        ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let messages = Arc::new(ordered);
        self.feed.send_modify(|frame| frame.messages = messages);
    }
}

impl Default for LoopbackBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteBackend for LoopbackBackend {
    async fn write_message(&self, message: OutgoingMessage) -> Result<String> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ChatlineError::RemoteWriteFailed(
                "loopback backend rejected the write".to_string(),
            ));
        }
        let body = message.body()?;

        let mut state = self.lock();
        // A token seen before means a replayed write; answer with the same id.
        if let Some(existing) = state
            .messages
            .iter()
            .find(|m| m.client_token.as_deref() == Some(message.client_token.as_str()))
        {
            return Ok(existing.id.clone());
        }

        state.next_id += 1;
        let id = format!("srv-{}", state.next_id);
        let mut wire = Message {
            origin: MessageOrigin::Confirmed {
                server_id: id.clone(),
            },
            author: message.user.clone(),
            created_at: message.created_at + self.latency,
            body,
            status: DeliveryStatus::Sent,
            reactions: Vec::new(),
            client_token: Some(message.client_token.clone()),
        }
        .to_wire();
        if !self.echo_tokens {
            wire.client_token = None;
        }
        state.messages.push(wire);
        self.publish(&state);
        log::debug!("Loopback stored {} for {}", id, message.client_token);
        Ok(id)
    }

    async fn add_reaction(&self, message_id: &str, reaction: Reaction) -> Result<()> {
        let mut state = self.lock();
        let msg = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ChatlineError::MessageNotFound(message_id.to_string()))?;
        msg.reactions.push(reaction);
        self.publish(&state);
        Ok(())
    }

    async fn subscribe(&self) -> Result<FeedStream> {
        let rx = self.feed.subscribe();
        let epoch = rx.borrow().epoch;
        let stream = futures::stream::unfold(Some((rx, true)), move |state| async move {
            let Some((mut rx, first)) = state else {
                return None;
            };
            if !first && rx.changed().await.is_err() {
                return None;
            }
            let frame = rx.borrow_and_update().clone();
            if frame.epoch != epoch {
                return Some((
                    Err(ChatlineError::SubscriptionLost(
                        "loopback feed reset".to_string(),
                    )),
                    None,
                ));
            }
            Some((Ok(frame.messages.as_ref().clone()), Some((rx, false))))
        });
        Ok(stream.boxed())
    }
}
