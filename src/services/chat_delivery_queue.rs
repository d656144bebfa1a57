//! Outbox of remote writes waiting to be (re)issued, with exponential backoff.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::chat_types::{OutgoingMessage, ReactionWrite, RemoteWrite};

/// A write that has not reached the backend yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub local_id: String,
    pub message: OutgoingMessage,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PendingWrite {
    pub fn new(local_id: &str, message: OutgoingMessage, max_retries: u32) -> Self {
        Self {
            local_id: local_id.to_string(),
            message,
            retry_count: 0,
            max_retries,
            last_attempt: None,
            created_at: Utc::now(),
        }
    }

    /// Backoff after the n-th failure, in units of `base`:
    /// 0, 1, 3, 9, 24, then capped at 60 (5s, 15s, 45s, 2min, 5min for a 5s base).
    fn backoff_duration(&self, base: Duration) -> Duration {
        let units = match self.retry_count {
            0 => 0,
            1 => 1,
            2 => 3,
            3 => 9,
            4 => 24,
            _ => 60,
        };
        base * units
    }

    fn is_ready(&self, base: Duration, now: DateTime<Utc>) -> bool {
        match self.last_attempt {
            Some(last) => {
                let elapsed = now.signed_duration_since(last);
                elapsed.to_std().unwrap_or(Duration::ZERO) >= self.backoff_duration(base)
            }
            None => true,
        }
    }

    fn to_remote_write(&self) -> RemoteWrite {
        RemoteWrite {
            local_id: self.local_id.clone(),
            message: self.message.clone(),
        }
    }
}

/// Outcome of recording a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Re-queued; will be issued again after its backoff.
    Retrying,
    /// Out of retries; parked until `retry_failed`.
    Parked,
}

/// Writes queued for retry, writes parked after failing, writes held back
/// while offline, and reactions waiting for their target to be confirmed.
pub struct DeliveryQueue {
    pending: Vec<PendingWrite>,
    in_flight: Vec<PendingWrite>,
    failed: Vec<PendingWrite>,
    offline: Vec<PendingWrite>,
    reactions: Vec<ReactionWrite>,
    base_delay: Duration,
}

impl DeliveryQueue {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            pending: Vec::new(),
            in_flight: Vec::new(),
            failed: Vec::new(),
            offline: Vec::new(),
            reactions: Vec::new(),
            base_delay,
        }
    }

    /// Track a write that is being issued right now.
    pub fn begin(&mut self, write: PendingWrite) {
        log::debug!("Issuing write for {}", write.local_id);
        self.in_flight.push(write);
    }

    /// Hold a write made while offline until connectivity returns.
    pub fn hold_offline(&mut self, write: PendingWrite) {
        log::info!("Holding offline message {} for replay", write.local_id);
        self.offline.push(write);
    }

    /// Forget an in-flight write that the backend accepted.
    pub fn complete(&mut self, local_id: &str) {
        self.in_flight.retain(|w| w.local_id != local_id);
    }

    /// Record a failed attempt for an in-flight write.
    pub fn fail(&mut self, local_id: &str) -> Option<FailureOutcome> {
        let pos = self.in_flight.iter().position(|w| w.local_id == local_id)?;
        let mut write = self.in_flight.remove(pos);
        write.retry_count += 1;
        write.last_attempt = Some(Utc::now());
        if write.retry_count > write.max_retries {
            log::warn!(
                "Write for {} failed after {} attempts, parking",
                write.local_id,
                write.retry_count
            );
            self.failed.push(write);
            Some(FailureOutcome::Parked)
        } else {
            log::warn!(
                "Write for {} failed (retry {}/{})",
                write.local_id,
                write.retry_count,
                write.max_retries
            );
            self.pending.push(write);
            Some(FailureOutcome::Retrying)
        }
    }

    /// Move every write whose backoff has elapsed to in-flight and return it.
    pub fn take_due(&mut self) -> Vec<RemoteWrite> {
        let now = Utc::now();
        let base = self.base_delay;
        let (due, waiting): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|w| w.is_ready(base, now));
        self.pending = waiting;
        let writes = due.iter().map(PendingWrite::to_remote_write).collect();
        self.in_flight.extend(due);
        writes
    }

    /// Release every write held while offline.
    pub fn take_offline(&mut self) -> Vec<RemoteWrite> {
        let held: Vec<PendingWrite> = self.offline.drain(..).collect();
        let writes = held.iter().map(PendingWrite::to_remote_write).collect();
        self.in_flight.extend(held);
        writes
    }

    /// Re-issue parked writes with a fresh retry budget.
    pub fn retry_failed(&mut self) -> Vec<RemoteWrite> {
        let mut parked: Vec<PendingWrite> = self.failed.drain(..).collect();
        for write in &mut parked {
            write.retry_count = 0;
            write.last_attempt = None;
        }
        let writes = parked.iter().map(PendingWrite::to_remote_write).collect();
        self.in_flight.extend(parked);
        writes
    }

    /// Keep a reaction until its target can receive it.
    pub fn hold_reaction(&mut self, write: ReactionWrite) {
        log::debug!("Holding reaction on {} for later", write.message_id);
        self.reactions.push(write);
    }

    /// Point held reactions at the id their target was confirmed under.
    pub fn rekey_reactions(&mut self, from: &str, to: &str) {
        for write in self.reactions.iter_mut().filter(|w| w.message_id == from) {
            write.message_id = to.to_string();
        }
    }

    /// Release held reactions whose target is `ready`, in the order added.
    pub fn take_reactions<F: Fn(&str) -> bool>(&mut self, ready: F) -> Vec<ReactionWrite> {
        let (due, waiting): (Vec<_>, Vec<_>) = self
            .reactions
            .drain(..)
            .partition(|w| ready(&w.message_id));
        self.reactions = waiting;
        due
    }

    /// Drop held reactions whose target is gone.
    pub fn retain_reactions<F: Fn(&str) -> bool>(&mut self, keep: F) {
        self.reactions.retain(|w| keep(&w.message_id));
    }

    pub fn held_reaction_count(&self) -> usize {
        self.reactions.len()
    }

    /// Drop any trace of `local_id` (confirmed by the feed or evicted).
    pub fn forget(&mut self, local_id: &str) {
        self.pending.retain(|w| w.local_id != local_id);
        self.in_flight.retain(|w| w.local_id != local_id);
        self.failed.retain(|w| w.local_id != local_id);
        self.offline.retain(|w| w.local_id != local_id);
    }

    pub fn is_in_flight(&self, local_id: &str) -> bool {
        self.in_flight.iter().any(|w| w.local_id == local_id)
    }

    pub fn holds(&self, local_id: &str) -> bool {
        [&self.pending, &self.in_flight, &self.failed, &self.offline]
            .iter()
            .any(|queue| queue.iter().any(|w| w.local_id == local_id))
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn retry_count(&self) -> usize {
        self.pending.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn offline_count(&self) -> usize {
        self.offline.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight.clear();
        self.failed.clear();
        self.offline.clear();
        self.reactions.clear();
    }
}
