use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{ChatlineError, Result};

// ── Message model ──────────────────────────────────────────────

/// Latitude/longitude pair shared as a location message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Message payload. A message carries exactly one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    /// Reference (URL) into the blob store.
    Image(String),
    Location(GeoPoint),
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Text(_) => "text",
            MessageBody::Image(_) => "image",
            MessageBody::Location(_) => "location",
        }
    }

    /// One-line rendering for logs and terminal output.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Image(url) => format!("[image] {}", url),
            MessageBody::Location(p) => format!("[location] {:.5},{:.5}", p.latitude, p.longitude),
        }
    }

    fn into_parts(self) -> (Option<String>, Option<String>, Option<GeoPoint>) {
        match self {
            MessageBody::Text(text) => (Some(text), None, None),
            MessageBody::Image(url) => (None, Some(url), None),
            MessageBody::Location(p) => (None, None, Some(p)),
        }
    }

    fn from_parts(
        text: Option<String>,
        image: Option<String>,
        location: Option<GeoPoint>,
    ) -> Result<Self> {
        match (text, image, location) {
            (Some(text), None, None) => Ok(MessageBody::Text(text)),
            (None, Some(url), None) => Ok(MessageBody::Image(url)),
            (None, None, Some(p)) => Ok(MessageBody::Location(p)),
            (None, None, None) => Err(ChatlineError::InvalidMessage(
                "message has no payload".to_string(),
            )),
            _ => Err(ChatlineError::InvalidMessage(
                "message has more than one payload".to_string(),
            )),
        }
    }
}

/// Delivery status. Ordered by lifecycle position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
}

impl DeliveryStatus {
    /// Move to `next` unless that would go backwards.
    pub fn advance(self, next: DeliveryStatus) -> DeliveryStatus {
        self.max(next)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub emoji: String,
    pub user_id: String,
}

impl Reaction {
    pub fn new(emoji: &str, user_id: &str) -> Self {
        Self {
            emoji: emoji.to_string(),
            user_id: user_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Author {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            avatar: None,
        }
    }
}

/// Where a message's identity comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Authored here, not yet seen on the feed.
    Pending { local_id: String },
    /// Delivered by the feed under a backend-assigned id.
    Confirmed { server_id: String },
}

/// A cached message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub origin: MessageOrigin,
    pub author: Author,
    pub created_at: DateTime<Utc>,
    pub body: MessageBody,
    pub status: DeliveryStatus,
    pub reactions: Vec<Reaction>,
    /// Idempotency token sent with the remote write and echoed by backends
    /// that support it.
    pub client_token: Option<String>,
}

impl Message {
    pub fn id(&self) -> &str {
        match &self.origin {
            MessageOrigin::Pending { local_id } => local_id,
            MessageOrigin::Confirmed { server_id } => server_id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self.origin, MessageOrigin::Confirmed { .. })
    }

    pub fn reaction_count(&self, reaction: &Reaction) -> usize {
        self.reactions.iter().filter(|r| *r == reaction).count()
    }

    /// Build a feed-delivered message. Feed entries are always confirmed and
    /// never below `Sent`.
    pub fn from_feed(wire: WireMessage) -> Result<Self> {
        let mut msg = Message::try_from(wire)?;
        let id = msg.id().to_string();
        msg.origin = MessageOrigin::Confirmed { server_id: id };
        msg.status = msg.status.advance(DeliveryStatus::Sent);
        Ok(msg)
    }

    pub fn to_wire(&self) -> WireMessage {
        let (text, image, location) = self.body.clone().into_parts();
        WireMessage {
            id: self.id().to_string(),
            text,
            image,
            location,
            created_at: self.created_at,
            user: self.author.clone(),
            status: self.status,
            reactions: self.reactions.clone(),
            client_token: self.client_token.clone(),
            local: !self.is_confirmed(),
        }
    }
}

// ── Wire / storage shape ───────────────────────────────────────

fn default_wire_status() -> DeliveryStatus {
    DeliveryStatus::Sent
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Message record as exchanged with the backend and written to local storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub created_at: DateTime<Utc>,
    pub user: Author,
    #[serde(default = "default_wire_status")]
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    /// Set on persisted entries that were never confirmed by the feed.
    #[serde(default, skip_serializing_if = "is_false")]
    pub local: bool,
}

impl TryFrom<WireMessage> for Message {
    type Error = ChatlineError;

    fn try_from(wire: WireMessage) -> Result<Self> {
        if wire.id.is_empty() {
            return Err(ChatlineError::InvalidMessage(
                "message has an empty id".to_string(),
            ));
        }
        let body = MessageBody::from_parts(wire.text, wire.image, wire.location)?;
        let origin = if wire.local || wire.status == DeliveryStatus::Pending {
            MessageOrigin::Pending { local_id: wire.id }
        } else {
            MessageOrigin::Confirmed { server_id: wire.id }
        };
        Ok(Message {
            origin,
            author: wire.user,
            created_at: wire.created_at,
            body,
            status: wire.status,
            reactions: wire.reactions,
            client_token: wire.client_token,
        })
    }
}

// ── Requests ───────────────────────────────────────────────────

/// What the presentation layer hands to `send`.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub body: MessageBody,
    pub author: Author,
}

impl Draft {
    pub fn text(author_id: &str, author_name: &str, text: &str) -> Self {
        Self {
            body: MessageBody::Text(text.to_string()),
            author: Author::new(author_id, author_name),
        }
    }
}

/// Canonical fields of a remote write. The temporary local id is not part of
/// it; the backend only sees the client token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub client_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    pub created_at: DateTime<Utc>,
    pub user: Author,
}

impl OutgoingMessage {
    /// `None` for confirmed messages and for entries without a token.
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.is_confirmed() {
            return None;
        }
        let client_token = message.client_token.clone()?;
        let (text, image, location) = message.body.clone().into_parts();
        Some(Self {
            client_token,
            text,
            image,
            location,
            created_at: message.created_at,
            user: message.author.clone(),
        })
    }

    pub fn body(&self) -> Result<MessageBody> {
        MessageBody::from_parts(self.text.clone(), self.image.clone(), self.location)
    }
}

/// A remote write the session must issue after a `send`.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteWrite {
    pub local_id: String,
    pub message: OutgoingMessage,
}

/// A reaction to forward to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ReactionWrite {
    pub message_id: String,
    pub reaction: Reaction,
}

// ── Presentation-facing events ─────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    pub fn from_online(online: bool) -> Self {
        if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        }
    }

    pub fn is_online(self) -> bool {
        self == Connectivity::Online
    }
}

/// Immutable, newest-first view handed to renderers.
pub type Snapshot = Arc<[Message]>;

/// Out-of-band conditions the presentation layer may surface.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncSignal {
    RemoteWriteFailed {
        local_id: String,
        reason: String,
        will_retry: bool,
    },
    PersistenceFailed {
        reason: String,
    },
    ReconciliationAmbiguous {
        server_id: String,
        chosen_local_id: String,
        candidates: Vec<String>,
    },
    SubscriptionLost {
        reason: String,
    },
    ConnectivityChanged(Connectivity),
}

#[derive(Debug, Clone)]
pub enum CacheEvent {
    Snapshot(Snapshot),
    Signal(SyncSignal),
}
