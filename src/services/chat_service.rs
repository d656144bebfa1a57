//! MessageSyncCache: the single owner of the ordered message list.
//!
//! Every state change goes through one of the methods below, each called with
//! exclusive access. Network and storage I/O never happens here: remote writes
//! are handed back to the caller (see `chat_session`) and their results come
//! back in through `complete_remote_write`.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::chat_delivery_queue::{DeliveryQueue, FailureOutcome, PendingWrite};
use super::chat_listeners::{ListenerRegistry, Unsubscribe};
use super::chat_message_store::{MessageStore, ReconcileHints, ReconcileReport};
use super::chat_persistence::{decode_snapshot, encode_snapshot, LocalStorage};
use super::chat_types::*;
use super::config::SyncSettings;
use crate::error::{ChatlineError, Result};
use crate::state::SyncContext;

/// Result of `send`: the optimistic entry, plus the write to issue when online.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    pub remote_write: Option<RemoteWrite>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectivityChange {
    Unchanged,
    /// Re-subscribe, then issue `replay` (offline messages, when enabled).
    WentOnline { replay: Vec<RemoteWrite> },
    WentOffline,
}

pub struct MessageSyncCache {
    store: MessageStore,
    connectivity: Connectivity,
    /// local id → server id for writes the backend accepted but the feed has
    /// not shown yet.
    acked: HashMap<String, String>,
    outbox: DeliveryQueue,
    storage: Arc<dyn LocalStorage>,
    storage_key: String,
    settings: SyncSettings,
    listeners: ListenerRegistry,
    snapshot: Snapshot,
    /// Online start: the restored snapshot is shown until the first delivery.
    awaiting_first_delivery: bool,
    placeholder_ids: HashSet<String>,
    feed_healthy: bool,
}

impl MessageSyncCache {
    pub fn new(ctx: &SyncContext, connectivity: Connectivity) -> Self {
        Self {
            store: MessageStore::new(ctx.settings.max_cached_messages),
            connectivity,
            acked: HashMap::new(),
            outbox: DeliveryQueue::new(ctx.settings.retry_base_delay()),
            storage: ctx.storage.clone(),
            storage_key: ctx.storage_key(),
            settings: ctx.settings.clone(),
            listeners: ListenerRegistry::new(),
            snapshot: Arc::from(Vec::new()),
            awaiting_first_delivery: false,
            placeholder_ids: HashSet::new(),
            feed_healthy: false,
        }
    }

    // ── Start-up ───────────────────────────────────────────────

    /// Read the last persisted snapshot. Unreadable data counts as none.
    pub fn load_persisted(&self) -> Option<Vec<Message>> {
        let bytes = match self.storage.get(&self.storage_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Failed to read cached messages: {}", e);
                return None;
            }
        };
        match decode_snapshot(&bytes) {
            Ok(messages) => Some(messages),
            Err(e) => {
                log::warn!("Failed to parse cached messages: {}", e);
                None
            }
        }
    }

    /// Load state. Offline, the snapshot is the truth; online, it is a
    /// placeholder until the first feed delivery.
    ///
    /// With offline replay enabled, unconfirmed entries from the snapshot are
    /// queued again together with their reactions. Online, their writes are
    /// returned for the caller to issue right away.
    pub fn initialize(&mut self, persisted: Option<Vec<Message>>) -> Vec<RemoteWrite> {
        self.store.seed(persisted.unwrap_or_default());
        self.acked.clear();
        self.outbox.clear();

        if self.settings.replay_offline_on_reconnect {
            let mut held = Vec::new();
            let mut reactions = Vec::new();
            for message in self.store.iter() {
                let Some(outgoing) = OutgoingMessage::from_message(message) else {
                    continue;
                };
                held.push(PendingWrite::new(
                    message.id(),
                    outgoing,
                    self.settings.max_write_retries,
                ));
                reactions.extend(message.reactions.iter().map(|reaction| ReactionWrite {
                    message_id: message.id().to_string(),
                    reaction: reaction.clone(),
                }));
            }
            for write in held {
                self.outbox.hold_offline(write);
            }
            for reaction in reactions {
                self.outbox.hold_reaction(reaction);
            }
        }

        self.placeholder_ids.clear();
        self.awaiting_first_delivery = self.connectivity.is_online();
        if self.awaiting_first_delivery {
            self.placeholder_ids = self.store.iter().map(|m| m.id().to_string()).collect();
        }

        log::info!(
            "Message cache initialized with {} messages ({})",
            self.store.len(),
            if self.awaiting_first_delivery {
                "placeholder until first feed delivery"
            } else {
                "offline"
            }
        );
        self.publish_snapshot();

        if self.connectivity.is_online() && self.settings.replay_offline_on_reconnect {
            let replay = self.outbox.take_offline();
            if !replay.is_empty() {
                log::info!("Replaying {} messages left from last session", replay.len());
            }
            replay
        } else {
            Vec::new()
        }
    }

    // ── Operations ─────────────────────────────────────────────

    /// Optimistically add a locally authored message.
    pub fn send(&mut self, draft: Draft) -> Result<SendOutcome> {
        self.validate(&draft)?;

        let online = self.connectivity.is_online();
        let message = Message {
            origin: MessageOrigin::Pending {
                local_id: format!("local-{}", uuid::Uuid::new_v4()),
            },
            author: draft.author,
            created_at: Utc::now(),
            body: draft.body,
            // Offline there is no round trip to wait for.
            status: if online {
                DeliveryStatus::Pending
            } else {
                DeliveryStatus::Sent
            },
            reactions: Vec::new(),
            client_token: Some(uuid::Uuid::new_v4().to_string()),
        };
        let local_id = message.id().to_string();
        let outgoing = OutgoingMessage::from_message(&message).ok_or_else(|| {
            ChatlineError::InvalidMessage("message has no client token".to_string())
        })?;

        self.store.insert_local(message.clone());

        let remote_write = if online {
            self.outbox.begin(PendingWrite::new(
                &local_id,
                outgoing.clone(),
                self.settings.max_write_retries,
            ));
            Some(RemoteWrite {
                local_id: local_id.clone(),
                message: outgoing,
            })
        } else {
            if self.settings.replay_offline_on_reconnect {
                self.outbox.hold_offline(PendingWrite::new(
                    &local_id,
                    outgoing,
                    self.settings.max_write_retries,
                ));
            }
            None
        };

        log::info!(
            "Queued {} message {} ({})",
            message.body.kind(),
            local_id,
            if online { "online" } else { "offline" }
        );
        self.commit();
        Ok(SendOutcome {
            message,
            remote_write,
        })
    }

    /// Merge a full snapshot delivered by the live feed.
    pub fn on_remote_feed_update(&mut self, wire: Vec<WireMessage>) -> ReconcileReport {
        if !self.connectivity.is_online() {
            log::debug!("Ignoring feed delivery while offline");
            return ReconcileReport::default();
        }
        self.feed_healthy = true;

        let mut incoming = Vec::with_capacity(wire.len());
        for entry in wire {
            match Message::from_feed(entry) {
                Ok(message) => incoming.push(message),
                Err(e) => log::warn!("Skipping malformed feed entry: {}", e),
            }
        }

        if self.awaiting_first_delivery {
            self.awaiting_first_delivery = false;
            let placeholders = std::mem::take(&mut self.placeholder_ids);
            let outbox = &self.outbox;
            let acked = &self.acked;
            self.store.retain(|m| {
                !placeholders.contains(m.id())
                    || (!m.is_confirmed()
                        && (outbox.holds(m.id()) || acked.contains_key(m.id())))
            });
            log::info!("First feed delivery replaced the cached placeholder");
        }

        let window = self.settings.reconciliation_window();
        let hints = ReconcileHints {
            acked: &self.acked,
            window,
        };
        let report = self.store.reconcile(incoming, &hints);

        for (local_id, server_id) in report.confirmed.iter().chain(&report.collapsed) {
            self.acked.remove(local_id);
            self.outbox.forget(local_id);
            self.outbox.rekey_reactions(local_id, server_id);
        }
        for ambiguous in &report.ambiguous {
            log::warn!(
                "Server message {} matched {} local candidates; chose {}",
                ambiguous.server_id,
                ambiguous.candidates.len(),
                ambiguous.chosen_local_id
            );
            self.listeners
                .emit(&CacheEvent::Signal(SyncSignal::ReconciliationAmbiguous {
                    server_id: ambiguous.server_id.clone(),
                    chosen_local_id: ambiguous.chosen_local_id.clone(),
                    candidates: ambiguous.candidates.clone(),
                }));
        }

        log::debug!(
            "Feed reconciled: {} updated, {} inserted, {} confirmed, {} evicted",
            report.updated,
            report.inserted,
            report.confirmed.len(),
            report.evicted
        );

        self.prune_tracking();
        if !self.store.iter().eq(self.snapshot.iter()) {
            self.commit();
        }
        report
    }

    /// Apply the result of a remote write issued for `local_id`.
    pub fn complete_remote_write(&mut self, local_id: &str, result: Result<String>) {
        if !self.store.contains(local_id) {
            // The feed confirmed it first.
            self.outbox.forget(local_id);
            return;
        }

        match result {
            Ok(server_id) => {
                self.outbox.complete(local_id);
                if self.store.collapse_into(local_id, &server_id) {
                    log::info!("Write {} landed as already-cached {}", local_id, server_id);
                    self.outbox.rekey_reactions(local_id, &server_id);
                    self.prune_tracking();
                    self.commit();
                } else {
                    log::debug!("Write {} accepted as {}", local_id, server_id);
                    self.acked.insert(local_id.to_string(), server_id);
                }
            }
            Err(e) => {
                let will_retry = self.outbox.fail(local_id) == Some(FailureOutcome::Retrying);
                log::warn!("Remote write for {} failed: {}", local_id, e);
                self.listeners
                    .emit(&CacheEvent::Signal(SyncSignal::RemoteWriteFailed {
                        local_id: local_id.to_string(),
                        reason: e.to_string(),
                        will_retry,
                    }));
            }
        }
    }

    pub fn set_connectivity(&mut self, online: bool) -> ConnectivityChange {
        let next = Connectivity::from_online(online);
        if next == self.connectivity {
            return ConnectivityChange::Unchanged;
        }
        self.connectivity = next;
        log::info!("Connectivity changed to {:?}", next);
        self.listeners
            .emit(&CacheEvent::Signal(SyncSignal::ConnectivityChanged(next)));

        if online {
            let replay = if self.settings.replay_offline_on_reconnect {
                self.outbox.take_offline()
            } else {
                Vec::new()
            };
            if !replay.is_empty() {
                log::info!("Replaying {} messages written offline", replay.len());
            }
            ConnectivityChange::WentOnline { replay }
        } else {
            self.feed_healthy = false;
            ConnectivityChange::WentOffline
        }
    }

    /// Append a reaction. Returns the write to forward when the target is
    /// confirmed and we are online.
    ///
    /// Otherwise the reaction is held when its target will still reach the
    /// server: a write in progress, or a reconnect with offline replay on.
    /// Held reactions come back out of `take_ready_reactions` once the target
    /// is confirmed, under its server id. Anything else stays local.
    pub fn add_reaction(
        &mut self,
        message_id: &str,
        emoji: &str,
        reactor_id: &str,
    ) -> Result<Option<ReactionWrite>> {
        let reaction = Reaction::new(emoji, reactor_id);
        if !self.store.add_reaction(message_id, reaction.clone()) {
            return Err(ChatlineError::MessageNotFound(message_id.to_string()));
        }
        let confirmed = self
            .store
            .get(message_id)
            .is_some_and(Message::is_confirmed);
        self.commit();

        let write = ReactionWrite {
            message_id: message_id.to_string(),
            reaction,
        };
        if self.connectivity.is_online() {
            if confirmed {
                return Ok(Some(write));
            }
            if self.outbox.holds(message_id) || self.acked.contains_key(message_id) {
                self.outbox.hold_reaction(write);
            }
        } else if self.settings.replay_offline_on_reconnect {
            self.outbox.hold_reaction(write);
        }
        Ok(None)
    }

    /// Held reactions whose target is now confirmed. Nothing is released
    /// offline.
    pub fn take_ready_reactions(&mut self) -> Vec<ReactionWrite> {
        if !self.connectivity.is_online() {
            return Vec::new();
        }
        let store = &self.store;
        let ready = self
            .outbox
            .take_reactions(|id| store.get(id).is_some_and(Message::is_confirmed));
        if !ready.is_empty() {
            log::debug!("Releasing {} held reactions", ready.len());
        }
        ready
    }

    pub fn on_subscription_lost(&mut self, reason: &str) {
        self.feed_healthy = false;
        log::warn!("Feed subscription lost: {}", reason);
        self.listeners
            .emit(&CacheEvent::Signal(SyncSignal::SubscriptionLost {
                reason: reason.to_string(),
            }));
    }

    /// Writes whose retry backoff has elapsed.
    pub fn take_due_writes(&mut self) -> Vec<RemoteWrite> {
        if !self.connectivity.is_online() {
            return Vec::new();
        }
        self.outbox.take_due()
    }

    /// Re-issue writes that ran out of retries. Nothing happens offline.
    pub fn retry_failed_writes(&mut self) -> Vec<RemoteWrite> {
        if !self.connectivity.is_online() {
            return Vec::new();
        }
        self.outbox.retry_failed()
    }

    /// Drop everything, including the persisted snapshot (logout).
    pub fn clear(&mut self) {
        self.store.clear();
        self.acked.clear();
        self.outbox.clear();
        self.placeholder_ids.clear();
        self.awaiting_first_delivery = false;
        if let Err(e) = self.storage.remove(&self.storage_key) {
            self.report_persistence_failure(&e);
        }
        log::info!("Message cache cleared");
        self.publish_snapshot();
    }

    // ── Reads ──────────────────────────────────────────────────

    pub fn get_snapshot(&self) -> Snapshot {
        self.snapshot.clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    pub fn listeners(&self) -> &ListenerRegistry {
        &self.listeners
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.store.get(id).cloned()
    }

    pub fn connectivity(&self) -> Connectivity {
        self.connectivity
    }

    pub fn is_feed_healthy(&self) -> bool {
        self.feed_healthy
    }

    /// Writes issued and not yet answered.
    pub fn pending_write_count(&self) -> usize {
        self.outbox.in_flight_count()
    }

    pub fn failed_write_count(&self) -> usize {
        self.outbox.failed_count()
    }

    pub fn held_offline_count(&self) -> usize {
        self.outbox.offline_count()
    }

    pub fn held_reaction_count(&self) -> usize {
        self.outbox.held_reaction_count()
    }

    /// Acknowledged writes the feed has not shown yet.
    pub fn acked_write_count(&self) -> usize {
        self.acked.len()
    }

    // ── internals ──────────────────────────────────────────────

    fn validate(&self, draft: &Draft) -> Result<()> {
        if draft.author.id.is_empty() {
            return Err(ChatlineError::InvalidMessage(
                "author id is required".to_string(),
            ));
        }
        match &draft.body {
            MessageBody::Text(text) => {
                if text.trim().is_empty() {
                    return Err(ChatlineError::InvalidMessage("empty message".to_string()));
                }
                if text.len() > self.settings.max_message_size {
                    return Err(ChatlineError::InvalidMessage(format!(
                        "Message too large: {} bytes (max {})",
                        text.len(),
                        self.settings.max_message_size
                    )));
                }
            }
            MessageBody::Image(url) => {
                if url.trim().is_empty() {
                    return Err(ChatlineError::InvalidMessage(
                        "empty image reference".to_string(),
                    ));
                }
            }
            MessageBody::Location(p) => {
                let valid = p.latitude.is_finite()
                    && p.longitude.is_finite()
                    && (-90.0..=90.0).contains(&p.latitude)
                    && (-180.0..=180.0).contains(&p.longitude);
                if !valid {
                    return Err(ChatlineError::InvalidMessage(format!(
                        "coordinates out of range: {}, {}",
                        p.latitude, p.longitude
                    )));
                }
            }
        }
        Ok(())
    }

    /// Drop acks for entries that are gone or confirmed, and held reactions
    /// whose target is gone.
    fn prune_tracking(&mut self) {
        let store = &self.store;
        self.acked
            .retain(|local_id, _| store.get(local_id).is_some_and(|m| !m.is_confirmed()));
        self.outbox.retain_reactions(|id| store.contains(id));
    }

    fn commit(&mut self) {
        self.persist();
        self.publish_snapshot();
    }

    /// Best-effort; memory stays authoritative when the write fails.
    fn persist(&self) {
        let result = encode_snapshot(&self.store.messages())
            .and_then(|bytes| self.storage.set(&self.storage_key, &bytes));
        if let Err(e) = result {
            self.report_persistence_failure(&e);
        }
    }

    fn report_persistence_failure(&self, e: &ChatlineError) {
        log::warn!("Failed to persist message cache: {}", e);
        self.listeners
            .emit(&CacheEvent::Signal(SyncSignal::PersistenceFailed {
                reason: e.to_string(),
            }));
    }

    fn publish_snapshot(&mut self) {
        self.snapshot = Arc::from(self.store.messages());
        self.listeners
            .emit(&CacheEvent::Snapshot(self.snapshot.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::chat_backend::LoopbackBackend;
    use crate::services::chat_persistence::MemoryStorage;
    use rstest::rstest;
    use std::sync::Mutex;

    struct BrokenStorage;

    impl LocalStorage for BrokenStorage {
        fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
            Err(ChatlineError::PersistenceFailed("disk full".to_string()))
        }
        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn context_with(storage: Arc<dyn LocalStorage>, settings: SyncSettings) -> SyncContext {
        SyncContext::new(Arc::new(LoopbackBackend::new()), storage, settings, "test")
    }

    fn cache(online: bool) -> MessageSyncCache {
        cache_with(online, SyncSettings::default())
    }

    fn cache_with(online: bool, settings: SyncSettings) -> MessageSyncCache {
        let ctx = context_with(Arc::new(MemoryStorage::new()), settings);
        let mut cache = MessageSyncCache::new(&ctx, Connectivity::from_online(online));
        assert!(cache.initialize(None).is_empty());
        cache
    }

    fn feed_entry(id: &str, author: &str, text: &str, at: chrono::DateTime<Utc>) -> WireMessage {
        WireMessage {
            id: id.to_string(),
            text: Some(text.to_string()),
            image: None,
            location: None,
            created_at: at,
            user: Author::new(author, author),
            status: DeliveryStatus::Sent,
            reactions: Vec::new(),
            client_token: None,
            local: false,
        }
    }

    fn collect_signals(cache: &MessageSyncCache) -> (Arc<Mutex<Vec<SyncSignal>>>, Unsubscribe) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = cache.subscribe(move |event| {
            if let CacheEvent::Signal(signal) = event {
                sink.lock().unwrap().push(signal.clone());
            }
        });
        (seen, handle)
    }

    #[test]
    fn test_offline_send_is_sent_without_remote_write() {
        let mut cache = cache(false);
        let outcome = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();

        assert!(outcome.remote_write.is_none());
        let snapshot = cache.get_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, DeliveryStatus::Sent);
        assert_eq!(cache.pending_write_count(), 0);
    }

    #[test]
    fn test_online_send_then_feed_confirms_single_entry() {
        let mut cache = cache(true);
        let outcome = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        assert_eq!(outcome.message.status, DeliveryStatus::Pending);
        let write = outcome.remote_write.unwrap();
        assert_eq!(write.message.text.as_deref(), Some("hi"));
        assert_eq!(cache.pending_write_count(), 1);

        let at = outcome.message.created_at + chrono::Duration::milliseconds(50);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", at)]);

        let snapshot = cache.get_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "srv1");
        assert_eq!(snapshot[0].status, DeliveryStatus::Sent);
        assert_eq!(cache.pending_write_count(), 0);
    }

    #[test]
    fn test_identical_redelivery_changes_nothing() {
        let mut cache = cache(true);
        let now = Utc::now();
        let feed = vec![
            feed_entry("srv2", "u2", "second", now),
            feed_entry("srv1", "u2", "first", now - chrono::Duration::seconds(5)),
        ];

        cache.on_remote_feed_update(feed.clone());
        let first = cache.get_snapshot();
        cache.on_remote_feed_update(feed);
        let second = cache.get_snapshot();

        assert_eq!(first.to_vec(), second.to_vec());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_reaction_is_additive() {
        let mut cache = cache(true);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", Utc::now())]);

        let write = cache.add_reaction("srv1", "👍", "u2").unwrap();
        assert!(write.is_some());
        cache.add_reaction("srv1", "👍", "u2").unwrap();

        let msg = cache.message("srv1").unwrap();
        assert_eq!(msg.reactions.len(), 2);
        assert_eq!(msg.reaction_count(&Reaction::new("👍", "u2")), 2);
    }

    #[test]
    fn test_reaction_on_unknown_message() {
        let mut cache = cache(true);
        assert!(matches!(
            cache.add_reaction("nope", "👍", "u2"),
            Err(ChatlineError::MessageNotFound(_))
        ));
    }

    #[test]
    fn test_reaction_offline_stays_local() {
        let mut cache = cache(false);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        let write = cache.add_reaction(sent.message.id(), "🎉", "u1").unwrap();
        assert!(write.is_none());
        assert_eq!(cache.message(sent.message.id()).unwrap().reactions.len(), 1);
        assert_eq!(cache.held_reaction_count(), 0);

        cache.set_connectivity(true);
        assert!(cache.take_ready_reactions().is_empty());
    }

    #[test]
    fn test_reaction_on_pending_target_forwarded_after_confirmation() {
        let mut cache = cache(true);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        let local_id = sent.message.id().to_string();

        assert!(cache.add_reaction(&local_id, "👍", "u2").unwrap().is_none());
        assert_eq!(cache.held_reaction_count(), 1);
        assert!(cache.take_ready_reactions().is_empty());

        cache.complete_remote_write(&local_id, Ok("srv1".to_string()));
        assert!(cache.take_ready_reactions().is_empty());

        let at = sent.message.created_at + chrono::Duration::milliseconds(30);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", at)]);
        let ready = cache.take_ready_reactions();
        assert_eq!(
            ready,
            vec![ReactionWrite {
                message_id: "srv1".to_string(),
                reaction: Reaction::new("👍", "u2"),
            }]
        );
        assert_eq!(cache.held_reaction_count(), 0);
        assert_eq!(cache.message("srv1").unwrap().reactions.len(), 1);
    }

    #[test]
    fn test_reaction_on_collapsed_target_uses_server_id() {
        let mut cache = cache(true);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        cache.add_reaction(sent.message.id(), "🔥", "u2").unwrap();

        let late = sent.message.created_at + chrono::Duration::minutes(10);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", late)]);
        cache.complete_remote_write(sent.message.id(), Ok("srv1".to_string()));

        let ready = cache.take_ready_reactions();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, "srv1");
    }

    #[test]
    fn test_reactions_made_offline_forwarded_on_reconnect_with_replay() {
        let settings = SyncSettings {
            replay_offline_on_reconnect: true,
            ..SyncSettings::default()
        };
        let mut cache = cache_with(true, settings);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u2", "yo", Utc::now())]);
        cache.set_connectivity(false);

        let sent = cache.send(Draft::text("u1", "Ada", "back soon")).unwrap();
        assert!(cache.add_reaction("srv1", "👍", "u1").unwrap().is_none());
        assert!(cache.add_reaction(sent.message.id(), "🎉", "u1").unwrap().is_none());
        assert!(cache.take_ready_reactions().is_empty());

        let ConnectivityChange::WentOnline { replay } = cache.set_connectivity(true) else {
            panic!("expected to go online");
        };
        let ready = cache.take_ready_reactions();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, "srv1");

        let mut echo = feed_entry("srv2", "u1", "back soon", Utc::now());
        echo.client_token = Some(replay[0].message.client_token.clone());
        cache.on_remote_feed_update(vec![echo, feed_entry("srv1", "u2", "yo", Utc::now())]);
        let ready = cache.take_ready_reactions();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].message_id, "srv2");
        assert_eq!(ready[0].reaction.emoji, "🎉");
    }

    #[rstest]
    #[case(0, true)]
    #[case(50, true)]
    #[case(-4_999, true)]
    #[case(5_000, false)]
    #[case(60_000, false)]
    fn test_reconciliation_window(#[case] delta_ms: i64, #[case] matches: bool) {
        let mut cache = cache(true);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        let at = sent.message.created_at + chrono::Duration::milliseconds(delta_ms);

        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", at)]);

        let snapshot = cache.get_snapshot();
        if matches {
            assert_eq!(snapshot.len(), 1);
            assert_eq!(snapshot[0].id(), "srv1");
        } else {
            assert_eq!(snapshot.len(), 2);
            let local = cache.message(sent.message.id()).unwrap();
            assert_eq!(local.status, DeliveryStatus::Pending);
        }
    }

    #[test]
    fn test_payload_or_author_mismatch_never_matches() {
        let mut cache = cache(true);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        let at = sent.message.created_at;

        cache.on_remote_feed_update(vec![
            feed_entry("srv1", "u1", "hi!", at),
            feed_entry("srv2", "u2", "hi", at),
        ]);

        assert_eq!(cache.get_snapshot().len(), 3);
    }

    #[test]
    fn test_failed_write_stays_pending_and_signals() {
        let mut cache = cache(true);
        let (signals, _handle) = collect_signals(&cache);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        let local_id = sent.message.id().to_string();

        cache.complete_remote_write(
            &local_id,
            Err(ChatlineError::RemoteWriteFailed("timeout".to_string())),
        );

        assert_eq!(
            cache.message(&local_id).unwrap().status,
            DeliveryStatus::Pending
        );
        assert_eq!(cache.failed_write_count(), 1);
        assert!(cache.take_due_writes().is_empty());
        let signals = signals.lock().unwrap();
        assert!(signals.iter().any(|s| matches!(
            s,
            SyncSignal::RemoteWriteFailed { will_retry: false, .. }
        )));

        drop(signals);
        let retried = cache.retry_failed_writes();
        assert_eq!(retried.len(), 1);
        assert_eq!(retried[0].local_id, local_id);
    }

    #[test]
    fn test_failed_write_with_retry_budget_is_rescheduled() {
        let settings = SyncSettings {
            max_write_retries: 2,
            retry_base_delay_ms: 0,
            ..SyncSettings::default()
        };
        let mut cache = cache_with(true, settings);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();

        cache.complete_remote_write(
            sent.message.id(),
            Err(ChatlineError::RemoteWriteFailed("503".to_string())),
        );

        let due = cache.take_due_writes();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message.client_token, sent.message.client_token.clone().unwrap());
    }

    #[test]
    fn test_write_ack_links_echo_outside_window() {
        let mut cache = cache(true);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        cache.complete_remote_write(sent.message.id(), Ok("srv1".to_string()));
        assert_eq!(cache.pending_write_count(), 0);

        let late = sent.message.created_at + chrono::Duration::minutes(10);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", late)]);

        let snapshot = cache.get_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "srv1");
    }

    #[test]
    fn test_write_ack_after_feed_insert_collapses_duplicate() {
        let mut cache = cache(true);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();

        // Backend clock far off: the feed shows it before the ack arrives.
        let late = sent.message.created_at + chrono::Duration::minutes(10);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", late)]);
        assert_eq!(cache.get_snapshot().len(), 2);

        cache.complete_remote_write(sent.message.id(), Ok("srv1".to_string()));
        let snapshot = cache.get_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "srv1");
    }

    #[test]
    fn test_ack_tracking_pruned_once_settled() {
        let mut cache = cache(true);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        cache.complete_remote_write(sent.message.id(), Ok("srv1".to_string()));
        assert_eq!(cache.acked_write_count(), 1);

        // An ack whose entry is no longer cached.
        cache
            .acked
            .insert("local-gone".to_string(), "srv-gone".to_string());
        cache.on_remote_feed_update(Vec::new());
        assert_eq!(cache.acked_write_count(), 1);

        let late = sent.message.created_at + chrono::Duration::minutes(10);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", late)]);
        assert_eq!(cache.acked_write_count(), 0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Step {
        SendA,
        SendB,
        AckA,
        AckB,
        /// Feed shows only the first message.
        FeedA,
        FeedAll,
    }

    const SERVER_IDS: [&str; 2] = ["srv-a", "srv-b"];

    fn body_of(i: usize, same_body: bool) -> &'static str {
        match (same_body, i) {
            (true, _) => "hi",
            (false, 0) => "one",
            (false, _) => "two",
        }
    }

    fn server_copy(i: usize, sent: &Message, same_body: bool, echo: bool) -> WireMessage {
        let at = sent.created_at + chrono::Duration::milliseconds(20 * (i as i64 + 1));
        let mut entry = feed_entry(SERVER_IDS[i], "u1", body_of(i, same_body), at);
        if echo {
            entry.client_token = sent.client_token.clone();
        }
        entry
    }

    #[rstest]
    #[case(&[Step::SendA, Step::SendB, Step::AckA, Step::AckB, Step::FeedAll])]
    #[case(&[Step::SendA, Step::SendB, Step::FeedAll, Step::AckA, Step::AckB])]
    #[case(&[Step::SendA, Step::AckA, Step::SendB, Step::FeedA, Step::AckB, Step::FeedAll])]
    #[case(&[Step::SendA, Step::SendB, Step::FeedA, Step::AckB, Step::AckA, Step::FeedAll])]
    #[case(&[Step::SendA, Step::SendB, Step::AckB, Step::FeedA, Step::FeedAll, Step::AckA])]
    fn test_send_ack_feed_interleavings_settle_without_duplicates(
        #[case] steps: &'static [Step],
        #[values(true, false)] echo: bool,
        #[values(true, false)] same_body: bool,
    ) {
        let mut cache = cache(true);
        let mut sent: [Option<Message>; 2] = [None, None];

        for step in steps {
            match *step {
                Step::SendA | Step::SendB => {
                    let i = if matches!(*step, Step::SendA) { 0 } else { 1 };
                    let outcome = cache
                        .send(Draft::text("u1", "Ada", body_of(i, same_body)))
                        .unwrap();
                    sent[i] = Some(outcome.message);
                }
                Step::AckA | Step::AckB => {
                    let i = if matches!(*step, Step::AckA) { 0 } else { 1 };
                    let local_id = sent[i].as_ref().unwrap().id().to_string();
                    cache.complete_remote_write(&local_id, Ok(SERVER_IDS[i].to_string()));
                }
                Step::FeedA => {
                    let a = server_copy(0, sent[0].as_ref().unwrap(), same_body, echo);
                    cache.on_remote_feed_update(vec![a]);
                }
                Step::FeedAll => {
                    let a = server_copy(0, sent[0].as_ref().unwrap(), same_body, echo);
                    let b = server_copy(1, sent[1].as_ref().unwrap(), same_body, echo);
                    cache.on_remote_feed_update(vec![b, a]);
                }
            }
        }

        let snapshot = cache.get_snapshot();
        let ids: Vec<&str> = snapshot.iter().map(Message::id).collect();
        assert_eq!(ids, vec!["srv-b", "srv-a"]);
        assert!(snapshot.iter().all(Message::is_confirmed));
        assert!(snapshot
            .windows(2)
            .all(|pair| pair[0].created_at >= pair[1].created_at));
        assert_eq!(cache.pending_write_count(), 0);
        assert_eq!(cache.acked_write_count(), 0);
    }

    #[test]
    fn test_ambiguous_match_is_signalled() {
        let mut cache = cache(true);
        let (signals, _handle) = collect_signals(&cache);
        let first = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        cache.send(Draft::text("u1", "Ada", "hi")).unwrap();

        let at = first.message.created_at + chrono::Duration::milliseconds(20);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u1", "hi", at)]);

        let signals = signals.lock().unwrap();
        let chosen = signals.iter().find_map(|s| match s {
            SyncSignal::ReconciliationAmbiguous {
                chosen_local_id, ..
            } => Some(chosen_local_id.clone()),
            _ => None,
        });
        assert_eq!(chosen.as_deref(), Some(first.message.id()));
    }

    #[test]
    fn test_persistence_failure_is_not_fatal() {
        let ctx = context_with(Arc::new(BrokenStorage), SyncSettings::default());
        let mut cache = MessageSyncCache::new(&ctx, Connectivity::Offline);
        cache.initialize(None);
        let (signals, _handle) = collect_signals(&cache);

        cache.send(Draft::text("u1", "Ada", "still works")).unwrap();

        assert_eq!(cache.get_snapshot().len(), 1);
        assert!(signals
            .lock()
            .unwrap()
            .iter()
            .any(|s| matches!(s, SyncSignal::PersistenceFailed { .. })));
    }

    #[test]
    fn test_online_start_replaces_placeholder_on_first_delivery() {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::new());
        let ctx = context_with(storage.clone(), SyncSettings::default());
        {
            let mut offline = MessageSyncCache::new(&ctx, Connectivity::Offline);
            offline.initialize(None);
            offline.send(Draft::text("u1", "Ada", "written offline")).unwrap();
        }

        let mut cache = MessageSyncCache::new(&ctx, Connectivity::Online);
        let persisted = cache.load_persisted();
        assert_eq!(persisted.as_ref().map(Vec::len), Some(1));
        cache.initialize(persisted);
        assert_eq!(cache.get_snapshot().len(), 1);

        cache.on_remote_feed_update(vec![feed_entry("srv1", "u2", "from server", Utc::now())]);
        let snapshot = cache.get_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "srv1");
    }

    #[test]
    fn test_offline_messages_survive_placeholder_when_replay_enabled() {
        let settings = SyncSettings {
            replay_offline_on_reconnect: true,
            ..SyncSettings::default()
        };
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::new());
        let ctx = context_with(storage, settings);
        {
            let mut offline = MessageSyncCache::new(&ctx, Connectivity::Offline);
            offline.initialize(None);
            offline.send(Draft::text("u1", "Ada", "written offline")).unwrap();
        }

        let mut cache = MessageSyncCache::new(&ctx, Connectivity::Online);
        let persisted = cache.load_persisted();
        let replay = cache.initialize(persisted);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].message.text.as_deref(), Some("written offline"));
        assert_eq!(cache.held_offline_count(), 0);
        assert_eq!(cache.pending_write_count(), 1);

        // Acked before the first delivery: still kept as an unconfirmed entry.
        cache.complete_remote_write(&replay[0].local_id, Ok("srv1".to_string()));
        cache.on_remote_feed_update(Vec::new());
        assert_eq!(cache.get_snapshot().len(), 1);

        let mut echo = feed_entry("srv1", "u1", "written offline", Utc::now());
        echo.client_token = Some(replay[0].message.client_token.clone());
        cache.on_remote_feed_update(vec![echo]);
        let snapshot = cache.get_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "srv1");
        assert_eq!(cache.acked_write_count(), 0);
    }

    #[test]
    fn test_offline_start_keeps_replay_for_reconnect() {
        let settings = SyncSettings {
            replay_offline_on_reconnect: true,
            ..SyncSettings::default()
        };
        let ctx = context_with(Arc::new(MemoryStorage::new()), settings);
        {
            let mut offline = MessageSyncCache::new(&ctx, Connectivity::Offline);
            offline.initialize(None);
            offline.send(Draft::text("u1", "Ada", "written offline")).unwrap();
        }

        let mut cache = MessageSyncCache::new(&ctx, Connectivity::Offline);
        let persisted = cache.load_persisted();
        assert!(cache.initialize(persisted).is_empty());
        assert_eq!(cache.held_offline_count(), 1);
    }

    #[test]
    fn test_offline_messages_not_replayed_by_default() {
        let mut cache = cache(false);
        cache.send(Draft::text("u1", "Ada", "hi")).unwrap();

        let change = cache.set_connectivity(true);
        assert_eq!(change, ConnectivityChange::WentOnline { replay: Vec::new() });
        assert_eq!(cache.get_snapshot().len(), 1);
    }

    #[test]
    fn test_offline_messages_replayed_when_enabled() {
        let settings = SyncSettings {
            replay_offline_on_reconnect: true,
            ..SyncSettings::default()
        };
        let mut cache = cache_with(false, settings);
        let sent = cache.send(Draft::text("u1", "Ada", "hi")).unwrap();

        let ConnectivityChange::WentOnline { replay } = cache.set_connectivity(true) else {
            panic!("expected to go online");
        };
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].local_id, sent.message.id());
        assert_eq!(cache.pending_write_count(), 1);
    }

    #[test]
    fn test_going_offline_keeps_messages_and_ignores_late_feed() {
        let mut cache = cache(true);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u2", "yo", Utc::now())]);

        assert_eq!(cache.set_connectivity(false), ConnectivityChange::WentOffline);
        assert_eq!(cache.set_connectivity(false), ConnectivityChange::Unchanged);
        cache.on_remote_feed_update(Vec::new());
        cache.on_remote_feed_update(vec![feed_entry("srv2", "u2", "late", Utc::now())]);

        let snapshot = cache.get_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id(), "srv1");
    }

    #[rstest]
    #[case(Draft::text("u1", "Ada", "   "))]
    #[case(Draft::text("", "Ada", "hi"))]
    #[case(Draft { body: MessageBody::Location(GeoPoint { latitude: 91.0, longitude: 0.0 }), author: Author::new("u1", "Ada") })]
    #[case(Draft { body: MessageBody::Image(String::new()), author: Author::new("u1", "Ada") })]
    fn test_invalid_drafts_rejected(#[case] draft: Draft) {
        let mut cache = cache(true);
        assert!(matches!(
            cache.send(draft),
            Err(ChatlineError::InvalidMessage(_))
        ));
        assert!(cache.get_snapshot().is_empty());
    }

    #[test]
    fn test_oversized_text_rejected() {
        let settings = SyncSettings {
            max_message_size: 8,
            ..SyncSettings::default()
        };
        let mut cache = cache_with(true, settings);
        assert!(cache.send(Draft::text("u1", "Ada", "way too long")).is_err());
    }

    #[test]
    fn test_clear_drops_messages_and_snapshot() {
        let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::new());
        let ctx = context_with(storage.clone(), SyncSettings::default());
        let mut cache = MessageSyncCache::new(&ctx, Connectivity::Offline);
        cache.initialize(None);
        cache.send(Draft::text("u1", "Ada", "hi")).unwrap();
        assert!(storage.get(&ctx.storage_key()).unwrap().is_some());

        cache.clear();
        assert!(cache.get_snapshot().is_empty());
        assert!(storage.get(&ctx.storage_key()).unwrap().is_none());
    }

    #[test]
    fn test_subscription_lost_keeps_state() {
        let mut cache = cache(true);
        let (signals, _handle) = collect_signals(&cache);
        cache.on_remote_feed_update(vec![feed_entry("srv1", "u2", "yo", Utc::now())]);
        assert!(cache.is_feed_healthy());

        cache.on_subscription_lost("socket closed");
        assert!(!cache.is_feed_healthy());
        assert_eq!(cache.get_snapshot().len(), 1);
        assert!(signals
            .lock()
            .unwrap()
            .iter()
            .any(|s| matches!(s, SyncSignal::SubscriptionLost { .. })));
    }
}
