//! Async driver around `MessageSyncCache`.
//!
//! Owns the feed subscription and issues remote writes on background tasks.
//! All cache mutation goes through one fair `RwLock`, so feed deliveries,
//! write results and user actions are applied in the order they arrive.

use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use super::chat_backend::{FeedStream, RemoteBackend};
use super::chat_listeners::Unsubscribe;
use super::chat_service::{ConnectivityChange, MessageSyncCache};
use super::chat_types::*;
use crate::error::Result;
use crate::state::SyncContext;

pub type SharedCache = Arc<RwLock<MessageSyncCache>>;

struct BackgroundTask {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Issues backend writes on spawned tasks and feeds the results back into the
/// cache.
#[derive(Clone)]
struct Dispatcher {
    backend: Arc<dyn RemoteBackend>,
    cache: SharedCache,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Dispatcher {
    fn issue(&self, writes: Vec<RemoteWrite>) {
        for write in writes {
            let dispatcher = self.clone();
            self.track(tokio::spawn(async move {
                let RemoteWrite { local_id, message } = write;
                let result = dispatcher.backend.write_message(message).await;
                let ready = {
                    let mut cache = dispatcher.cache.write().await;
                    cache.complete_remote_write(&local_id, result);
                    cache.take_ready_reactions()
                };
                dispatcher.issue_reactions(ready);
            }));
        }
    }

    fn issue_reactions(&self, writes: Vec<ReactionWrite>) {
        for write in writes {
            self.issue_reaction(write);
        }
    }

    /// Forward whatever held reactions became ready.
    async fn release_reactions(&self) {
        let ready = self.cache.write().await.take_ready_reactions();
        self.issue_reactions(ready);
    }

    fn issue_reaction(&self, write: ReactionWrite) {
        let backend = self.backend.clone();
        self.track(tokio::spawn(async move {
            if let Err(e) = backend
                .add_reaction(&write.message_id, write.reaction)
                .await
            {
                // The local overlay keeps showing it.
                log::warn!("Failed to forward reaction on {}: {}", write.message_id, e);
            }
        }));
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    /// Wait for every write issued so far, including the ones those writes
    /// issue in turn.
    async fn flush(&self) {
        loop {
            let pending: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
            if pending.is_empty() {
                break;
            }
            for handle in pending {
                if let Err(e) = handle.await {
                    log::warn!("Remote write task failed: {}", e);
                }
            }
        }
    }

    fn abort_all(&self) {
        for handle in lock(&self.tasks).drain(..) {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SyncSession {
    ctx: SyncContext,
    cache: SharedCache,
    dispatcher: Dispatcher,
    feed: Option<BackgroundTask>,
    outbox_loop: Option<BackgroundTask>,
}

impl SyncSession {
    /// Load the persisted snapshot, initialize the cache and, when online,
    /// subscribe to the feed and issue writes left over from the last session.
    /// A failed subscription is reported as `SubscriptionLost`; see
    /// `resubscribe`.
    pub async fn start(ctx: SyncContext, online: bool) -> Self {
        let mut cache = MessageSyncCache::new(&ctx, Connectivity::from_online(online));
        let persisted = cache.load_persisted();
        let replay = cache.initialize(persisted);
        let cache = Arc::new(RwLock::new(cache));

        let dispatcher = Dispatcher {
            backend: ctx.backend.clone(),
            cache: cache.clone(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        };
        let mut session = Self {
            ctx,
            cache,
            dispatcher,
            feed: None,
            outbox_loop: None,
        };

        if online {
            session.open_feed().await;
            session.dispatcher.issue(replay);
        }
        if session.ctx.settings.max_write_retries > 0 {
            session.run_outbox_loop();
        }
        log::info!(
            "Sync session started ({})",
            if online { "online" } else { "offline" }
        );
        session
    }

    pub fn cache(&self) -> SharedCache {
        self.cache.clone()
    }

    pub async fn send(&self, draft: Draft) -> Result<Message> {
        let outcome = self.cache.write().await.send(draft)?;
        if let Some(write) = outcome.remote_write {
            self.dispatcher.issue(vec![write]);
        }
        Ok(outcome.message)
    }

    pub async fn add_reaction(&self, message_id: &str, emoji: &str, reactor_id: &str) -> Result<()> {
        let write = self
            .cache
            .write()
            .await
            .add_reaction(message_id, emoji, reactor_id)?;
        if let Some(write) = write {
            self.dispatcher.issue_reaction(write);
        }
        Ok(())
    }

    pub async fn set_connectivity(&mut self, online: bool) {
        if !online {
            // Stop deliveries before the cache flips, so none lands late.
            self.close_feed().await;
        }
        let change = self.cache.write().await.set_connectivity(online);
        match change {
            ConnectivityChange::WentOnline { replay } => {
                self.open_feed().await;
                self.dispatcher.issue(replay);
                self.dispatcher.release_reactions().await;
            }
            ConnectivityChange::WentOffline | ConnectivityChange::Unchanged => {}
        }
    }

    /// Re-establish the feed after it was lost. No-op while offline.
    pub async fn resubscribe(&mut self) {
        if !self.cache.read().await.connectivity().is_online() {
            log::debug!("Not resubscribing while offline");
            return;
        }
        self.open_feed().await;
    }

    /// Issue writes whose retry backoff elapsed. Returns how many went out.
    pub async fn process_outbox(&self) -> usize {
        let due = self.cache.write().await.take_due_writes();
        let count = due.len();
        self.dispatcher.issue(due);
        count
    }

    /// Tick `process_outbox` every `outbox_tick_ms` until shutdown.
    pub fn run_outbox_loop(&mut self) {
        if self.outbox_loop.is_some() {
            return;
        }
        let (cancel, mut cancel_rx) = watch::channel(false);
        let dispatcher = self.dispatcher.clone();
        let tick = self.ctx.settings.outbox_tick();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + tick, tick);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => break,
                    _ = interval.tick() => {
                        let due = dispatcher.cache.write().await.take_due_writes();
                        if !due.is_empty() {
                            log::info!("Retrying {} queued writes", due.len());
                            dispatcher.issue(due);
                        }
                    }
                }
            }
        });
        self.outbox_loop = Some(BackgroundTask { cancel, task });
        log::info!("Outbox processor started ({:?} tick)", tick);
    }

    /// Re-issue writes parked after failing.
    pub async fn retry_failed(&self) -> usize {
        let writes = self.cache.write().await.retry_failed_writes();
        let count = writes.len();
        self.dispatcher.issue(writes);
        count
    }

    /// Wait for every remote write issued so far to complete.
    pub async fn flush(&self) {
        self.dispatcher.flush().await;
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.cache.read().await.get_snapshot()
    }

    pub async fn subscribe<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.cache.read().await.subscribe(listener)
    }

    pub async fn is_feed_healthy(&self) -> bool {
        self.cache.read().await.is_feed_healthy()
    }

    /// Stop syncing and drop every cached message, including the persisted
    /// snapshot.
    pub async fn logout(&mut self) {
        self.close_feed().await;
        self.dispatcher.abort_all();
        self.cache.write().await.clear();
        log::info!("Logged out of sync session");
    }

    pub async fn shutdown(mut self) {
        self.close_feed().await;
        if let Some(outbox) = self.outbox_loop.take() {
            let _ = outbox.cancel.send(true);
            if let Err(e) = outbox.task.await {
                log::warn!("Outbox processor ended abnormally: {}", e);
            }
        }
        self.dispatcher.flush().await;
        self.cache.read().await.listeners().clear();
        log::info!("Sync session shut down");
    }

    // ── feed ───────────────────────────────────────────────────

    async fn open_feed(&mut self) {
        self.close_feed().await;
        let stream = match self.ctx.backend.subscribe().await {
            Ok(stream) => stream,
            Err(e) => {
                self.cache.write().await.on_subscription_lost(&e.to_string());
                return;
            }
        };
        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(pump_feed(stream, self.dispatcher.clone(), cancel_rx));
        self.feed = Some(BackgroundTask { cancel, task });
        log::debug!("Feed subscription opened");
    }

    async fn close_feed(&mut self) {
        if let Some(feed) = self.feed.take() {
            let _ = feed.cancel.send(true);
            if let Err(e) = feed.task.await {
                log::warn!("Feed task ended abnormally: {}", e);
            }
            log::debug!("Feed subscription closed");
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.take() {
            feed.task.abort();
        }
        if let Some(outbox) = self.outbox_loop.take() {
            outbox.task.abort();
        }
    }
}

async fn pump_feed(
    mut stream: FeedStream,
    dispatcher: Dispatcher,
    mut cancel_rx: watch::Receiver<bool>,
) {
    let cache = dispatcher.cache.clone();
    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.changed() => break,
            item = stream.next() => match item {
                Some(Ok(snapshot)) => {
                    let ready = {
                        let mut cache = cache.write().await;
                        cache.on_remote_feed_update(snapshot);
                        cache.take_ready_reactions()
                    };
                    dispatcher.issue_reactions(ready);
                }
                Some(Err(e)) => {
                    cache.write().await.on_subscription_lost(&e.to_string());
                    break;
                }
                None => {
                    cache.write().await.on_subscription_lost("feed closed by backend");
                    break;
                }
            }
        }
    }
}
