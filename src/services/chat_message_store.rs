//! Ordered message cache and feed reconciliation.
//!
//! Entries are kept newest first. Every entry carries an insertion sequence
//! number which breaks ties between equal timestamps and survives
//! confirmation, so a confirmed echo keeps its place relative to its peers.

use chrono::Duration;
use std::collections::{HashMap, HashSet};

use super::chat_types::{Message, MessageOrigin, Reaction};

#[derive(Debug, Clone)]
struct Entry {
    message: Message,
    seq: u64,
}

/// A locally added reaction the feed has not reflected yet. `baseline` is how
/// many identical reactions the message showed when it was added.
#[derive(Debug, Clone, PartialEq)]
struct UnsyncedReaction {
    reaction: Reaction,
    baseline: usize,
}

/// Extra keys for matching unconfirmed entries exactly.
#[derive(Debug, Clone)]
pub struct ReconcileHints<'a> {
    /// local id → server id, from acknowledged remote writes.
    pub acked: &'a HashMap<String, String>,
    /// Heuristic matching window.
    pub window: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmbiguousMatch {
    pub server_id: String,
    pub chosen_local_id: String,
    pub candidates: Vec<String>,
}

/// What a reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub updated: usize,
    pub inserted: usize,
    /// (local id, server id) pairs confirmed in this pass.
    pub confirmed: Vec<(String, String)>,
    /// (local id, server id) pairs dropped because the server copy was
    /// already cached.
    pub collapsed: Vec<(String, String)>,
    pub ambiguous: Vec<AmbiguousMatch>,
    pub evicted: usize,
}

/// Newest-first message cache.
pub struct MessageStore {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    next_seq: u64,
    unsynced_reactions: HashMap<String, Vec<UnsyncedReaction>>,
    /// Max entries kept; 0 disables eviction.
    capacity: usize,
}

impl MessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            next_seq: 0,
            unsynced_reactions: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.index.get(id).map(|&pos| &self.entries[pos].message)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.entries.iter().map(|e| &e.message)
    }

    /// Clone of the current newest-first ordering.
    pub fn messages(&self) -> Vec<Message> {
        self.iter().cloned().collect()
    }

    /// Replace the contents with `messages`. Given order is kept for equal
    /// timestamps; repeated ids keep their first occurrence. Reactions on
    /// unconfirmed entries can only be local, so they go back into the
    /// overlay.
    pub fn seed(&mut self, messages: Vec<Message>) {
        self.clear();
        for message in messages {
            if self.index.contains_key(message.id()) {
                log::warn!("Dropping duplicate cached message {}", message.id());
                continue;
            }
            if !message.is_confirmed() && !message.reactions.is_empty() {
                let mut overlay: Vec<UnsyncedReaction> = Vec::new();
                for reaction in &message.reactions {
                    let baseline = overlay.iter().filter(|u| u.reaction == *reaction).count();
                    overlay.push(UnsyncedReaction {
                        reaction: reaction.clone(),
                        baseline,
                    });
                }
                self.unsynced_reactions
                    .insert(message.id().to_string(), overlay);
            }
            self.push(message);
        }
        self.sort_and_index();
        self.evict();
    }

    /// Add a locally authored message.
    pub fn insert_local(&mut self, message: Message) {
        self.push(message);
        self.sort_and_index();
        self.evict();
    }

    /// Keep only entries matching `keep`.
    pub fn retain<F: FnMut(&Message) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|e| keep(&e.message));
        let ids: HashSet<&str> = self.entries.iter().map(|e| e.message.id()).collect();
        self.unsynced_reactions
            .retain(|id, _| ids.contains(id.as_str()));
        self.sort_and_index();
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
        self.unsynced_reactions.clear();
    }

    /// Append a reaction. Returns false when the message is not cached.
    pub fn add_reaction(&mut self, id: &str, reaction: Reaction) -> bool {
        let Some(&pos) = self.index.get(id) else {
            return false;
        };
        let message = &mut self.entries[pos].message;
        let baseline = message.reaction_count(&reaction);
        message.reactions.push(reaction.clone());
        self.unsynced_reactions
            .entry(id.to_string())
            .or_default()
            .push(UnsyncedReaction { reaction, baseline });
        true
    }

    /// Drop the unconfirmed entry `local_id` in favour of the cached
    /// `server_id` entry. Returns false if either side is missing.
    pub fn collapse_into(&mut self, local_id: &str, server_id: &str) -> bool {
        let (Some(&local_pos), Some(&server_pos)) =
            (self.index.get(local_id), self.index.get(server_id))
        else {
            return false;
        };
        if self.entries[local_pos].message.is_confirmed() {
            return false;
        }
        let carried = self.rekey_reactions(local_id, server_id);
        self.entries[server_pos]
            .message
            .reactions
            .extend(carried.into_iter().map(|u| u.reaction));
        self.entries.remove(local_pos);
        self.sort_and_index();
        true
    }

    /// Merge a full feed snapshot into the cache.
    ///
    /// 1. server ids already cached are updated in place;
    /// 2. unconfirmed entries are matched to remaining server messages, by
    ///    acknowledged server id, then echoed client token, then author +
    ///    payload + timestamp window (earliest-sent local wins);
    /// 3. whatever is left of the snapshot is inserted;
    /// 4. the cache is re-sorted newest first and trimmed to capacity.
    pub fn reconcile(&mut self, server: Vec<Message>, hints: &ReconcileHints<'_>) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let mut seen = HashSet::new();
        let server: Vec<Message> = server
            .into_iter()
            .filter(|m| seen.insert(m.id().to_string()))
            .collect();
        let server_index: HashMap<&str, usize> = server
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id(), i))
            .collect();
        let mut matched = vec![false; server.len()];

        // 1. in-place updates
        for (i, incoming) in server.iter().enumerate() {
            let Some(&pos) = self.index.get(incoming.id()) else {
                continue;
            };
            if !self.entries[pos].message.is_confirmed() {
                continue;
            }
            self.apply_server_state(pos, incoming);
            matched[i] = true;
            report.updated += 1;
        }

        // 2. unconfirmed entries, earliest sent first
        let mut locals: Vec<usize> = (0..self.entries.len())
            .filter(|&p| !self.entries[p].message.is_confirmed())
            .collect();
        locals.sort_by_key(|&p| (self.entries[p].message.created_at, self.entries[p].seq));

        let mut taken: HashSet<usize> = HashSet::new();
        let mut confirmations: Vec<(usize, usize)> = Vec::new();
        let mut collapses: Vec<(usize, String)> = Vec::new();

        // 2a. acknowledged writes
        for &pos in &locals {
            let local_id = self.entries[pos].message.id();
            let Some(server_id) = hints.acked.get(local_id) else {
                continue;
            };
            if self.is_confirmed_id(server_id) {
                collapses.push((pos, server_id.clone()));
                taken.insert(pos);
            } else if let Some(&i) = server_index.get(server_id.as_str()) {
                if !matched[i] {
                    matched[i] = true;
                    confirmations.push((pos, i));
                    taken.insert(pos);
                }
            }
        }

        // 2b. echoed client tokens
        for (i, incoming) in server.iter().enumerate() {
            let Some(token) = incoming.client_token.as_deref() else {
                continue;
            };
            let found = locals.iter().copied().find(|p| {
                !taken.contains(p) && self.entries[*p].message.client_token.as_deref() == Some(token)
            });
            let Some(pos) = found else {
                continue;
            };
            taken.insert(pos);
            if matched[i] {
                collapses.push((pos, incoming.id().to_string()));
            } else {
                matched[i] = true;
                confirmations.push((pos, i));
            }
        }

        // 2c. author + payload + window
        let mut remaining: Vec<usize> = (0..server.len()).filter(|&i| !matched[i]).collect();
        remaining.sort_by_key(|&i| (server[i].created_at, i));
        for i in remaining {
            let incoming = &server[i];
            let candidates: Vec<usize> = locals
                .iter()
                .copied()
                .filter(|p| !taken.contains(p))
                // Acknowledged under a different server id.
                .filter(|&p| !hints.acked.contains_key(self.entries[p].message.id()))
                .filter(|&p| is_heuristic_match(&self.entries[p].message, incoming, hints.window))
                .collect();
            let Some(&chosen) = candidates.first() else {
                continue;
            };
            if candidates.len() > 1 {
                report.ambiguous.push(AmbiguousMatch {
                    server_id: incoming.id().to_string(),
                    chosen_local_id: self.entries[chosen].message.id().to_string(),
                    candidates: candidates
                        .iter()
                        .map(|&p| self.entries[p].message.id().to_string())
                        .collect(),
                });
            }
            taken.insert(chosen);
            matched[i] = true;
            confirmations.push((chosen, i));
        }

        for (pos, i) in confirmations {
            let incoming = &server[i];
            let local_id = self.entries[pos].message.id().to_string();
            let server_id = incoming.id().to_string();
            self.rekey_reactions(&local_id, &server_id);
            let reactions = self.merge_reactions(&server_id, &incoming.reactions);

            let message = &mut self.entries[pos].message;
            message.origin = MessageOrigin::Confirmed {
                server_id: server_id.clone(),
            };
            message.created_at = incoming.created_at;
            message.status = incoming.status;
            message.reactions = reactions;
            if incoming.client_token.is_some() {
                message.client_token = incoming.client_token.clone();
            }
            log::debug!("Confirmed {} as {}", local_id, server_id);
            report.confirmed.push((local_id, server_id));
        }

        let mut dropped: HashSet<usize> = HashSet::new();
        for (pos, server_id) in collapses {
            let local_id = self.entries[pos].message.id().to_string();
            let carried = self.rekey_reactions(&local_id, &server_id);
            if let Some(&target) = self.index.get(&server_id) {
                self.entries[target]
                    .message
                    .reactions
                    .extend(carried.into_iter().map(|u| u.reaction));
            }
            log::debug!("Collapsed {} into cached {}", local_id, server_id);
            dropped.insert(pos);
            report.collapsed.push((local_id, server_id));
        }

        // 3. new server messages
        for (i, incoming) in server.into_iter().enumerate() {
            if matched[i] {
                continue;
            }
            self.push(incoming);
            report.inserted += 1;
        }

        if !dropped.is_empty() {
            let mut pos = 0;
            self.entries.retain(|_| {
                let keep = !dropped.contains(&pos);
                pos += 1;
                keep
            });
        }

        // 4. order and bound
        self.sort_and_index();
        report.evicted = self.evict();
        report
    }

    // ── internals ──────────────────────────────────────────────

    fn push(&mut self, message: Message) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(message.id().to_string(), self.entries.len());
        self.entries.push(Entry { message, seq });
    }

    fn sort_and_index(&mut self) {
        self.entries.sort_by(|a, b| {
            b.message
                .created_at
                .cmp(&a.message.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(pos, e)| (e.message.id().to_string(), pos))
            .collect();
    }

    /// Drop the oldest confirmed entries beyond capacity. Unconfirmed entries
    /// are never evicted.
    fn evict(&mut self) -> usize {
        if self.capacity == 0 || self.entries.len() <= self.capacity {
            return 0;
        }
        let mut excess = self.entries.len() - self.capacity;
        let mut doomed: HashSet<usize> = HashSet::new();
        for pos in (0..self.entries.len()).rev() {
            if excess == 0 {
                break;
            }
            if self.entries[pos].message.is_confirmed() {
                doomed.insert(pos);
                excess -= 1;
            }
        }
        let mut pos = 0;
        let unsynced = &mut self.unsynced_reactions;
        self.entries.retain(|e| {
            let keep = !doomed.contains(&pos);
            if !keep {
                unsynced.remove(e.message.id());
            }
            pos += 1;
            keep
        });
        self.sort_and_index();
        log::debug!("Evicted {} cached messages over capacity", doomed.len());
        doomed.len()
    }

    fn is_confirmed_id(&self, id: &str) -> bool {
        self.get(id).is_some_and(Message::is_confirmed)
    }

    fn apply_server_state(&mut self, pos: usize, incoming: &Message) {
        let id = incoming.id().to_string();
        let reactions = self.merge_reactions(&id, &incoming.reactions);
        let message = &mut self.entries[pos].message;
        message.status = message.status.advance(incoming.status);
        message.body = incoming.body.clone();
        message.author = incoming.author.clone();
        message.reactions = reactions;
        if incoming.client_token.is_some() {
            message.client_token = incoming.client_token.clone();
        }
    }

    /// Server reactions plus the local ones the server has not caught up with.
    fn merge_reactions(&mut self, id: &str, server_reactions: &[Reaction]) -> Vec<Reaction> {
        let mut merged = server_reactions.to_vec();
        if let Some(pending) = self.unsynced_reactions.get_mut(id) {
            pending.retain(|u| {
                server_reactions.iter().filter(|r| **r == u.reaction).count() <= u.baseline
            });
            merged.extend(pending.iter().map(|u| u.reaction.clone()));
            if pending.is_empty() {
                self.unsynced_reactions.remove(id);
            }
        }
        merged
    }

    fn rekey_reactions(&mut self, from: &str, to: &str) -> Vec<UnsyncedReaction> {
        let moved = self.unsynced_reactions.remove(from).unwrap_or_default();
        if !moved.is_empty() {
            self.unsynced_reactions
                .entry(to.to_string())
                .or_default()
                .extend(moved.iter().cloned());
        }
        moved
    }
}

fn is_heuristic_match(local: &Message, server: &Message, window: Duration) -> bool {
    if let (Some(a), Some(b)) = (&local.client_token, &server.client_token) {
        if a != b {
            return false;
        }
    }
    local.author.id == server.author.id
        && local.body == server.body
        && (server.created_at - local.created_at).abs() < window
}
