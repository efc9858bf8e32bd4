//! Messages pushed to sessions, and the mailbox hub the HTTP layer drains.

use crate::core::types::MixId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default mailbox depth per session.
pub const MAILBOX_CAPACITY: usize = 64;

/// Byte payloads are hex-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// Invitation to confirm, carrying the round's RSA public key (DER).
    ConfirmInput { mix_id: MixId, public_key: String },
    ConfirmedInput { mix_id: MixId, signed_bordereau: String },
    RegisterOutput { mix_id: MixId, inputs_hash: String },
    /// Unsigned joint transaction, consensus-serialized.
    Signing { mix_id: MixId, tx: String },
    RevealOutput { mix_id: MixId },
    Success { mix_id: MixId },
    Fail { mix_id: MixId },
    Error { code: u16, message: String },
}

impl ServerMessage {
    pub fn mix_id(&self) -> Option<&str> {
        match self {
            ServerMessage::ConfirmInput { mix_id, .. }
            | ServerMessage::ConfirmedInput { mix_id, .. }
            | ServerMessage::RegisterOutput { mix_id, .. }
            | ServerMessage::Signing { mix_id, .. }
            | ServerMessage::RevealOutput { mix_id }
            | ServerMessage::Success { mix_id }
            | ServerMessage::Fail { mix_id } => Some(mix_id),
            ServerMessage::Error { .. } => None,
        }
    }
}

pub trait Notifier: Send + Sync {
    fn send_private(&self, username: &str, message: ServerMessage);
}

/// Mailboxes untouched for this long belong to sessions that went away
/// without disconnecting.
pub const MAILBOX_IDLE_TTL: Duration = Duration::from_secs(30 * 60);

struct Mailbox {
    messages: VecDeque<ServerMessage>,
    touched: Instant,
}

impl Mailbox {
    fn new(now: Instant) -> Self {
        Self { messages: VecDeque::new(), touched: now }
    }
}

/// One bounded queue per session. When full, the oldest message is dropped.
pub struct SessionHub {
    capacity: usize,
    mailboxes: Mutex<HashMap<String, Mailbox>>,
}

impl SessionHub {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, mailboxes: Mutex::new(HashMap::new()) }
    }

    pub fn drain(&self, username: &str) -> Vec<ServerMessage> {
        self.mailboxes
            .lock()
            .get_mut(username)
            .map(|mailbox| {
                mailbox.touched = Instant::now();
                mailbox.messages.drain(..).collect()
            })
            .unwrap_or_default()
    }

    /// Forget a session and whatever it did not read.
    pub fn remove(&self, username: &str) {
        self.mailboxes.lock().remove(username);
    }

    pub fn pending(&self, username: &str) -> usize {
        self.mailboxes.lock().get(username).map_or(0, |m| m.messages.len())
    }

    pub fn len(&self) -> usize {
        self.mailboxes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop mailboxes neither written nor drained for `ttl`. Returns how many.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.evict_idle_at(Instant::now(), ttl)
    }

    pub fn evict_idle_at(&self, now: Instant, ttl: Duration) -> usize {
        let mut mailboxes = self.mailboxes.lock();
        let before = mailboxes.len();
        mailboxes.retain(|_, mailbox| now.saturating_duration_since(mailbox.touched) < ttl);
        let evicted = before - mailboxes.len();
        if evicted > 0 {
            tracing::debug!("evicted {} idle mailboxes", evicted);
        }
        evicted
    }

    fn push(&self, username: &str, message: ServerMessage, now: Instant) {
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.entry(username.to_string()).or_insert_with(|| Mailbox::new(now));
        if mailbox.messages.len() >= self.capacity {
            tracing::warn!("mailbox full for {}, dropping oldest message", username);
            mailbox.messages.pop_front();
        }
        mailbox.messages.push_back(message);
        mailbox.touched = now;
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new(MAILBOX_CAPACITY)
    }
}

impl Notifier for SessionHub {
    fn send_private(&self, username: &str, message: ServerMessage) {
        self.push(username, message, Instant::now());
    }
}
