//! Conversational session memory.
//!
//! Sliding-TTL text per session key: every append resets the full
//! window, reads of missing or expired keys yield None. The shipped
//! backend is in-process; a cache-server backend would sit behind the
//! same trait.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default expiry window, 15 minutes.
pub const DEFAULT_TTL: Duration = Duration::from_secs(900);

/// How one conversational turn is stored.
pub fn format_turn(query: &str, answer: &str) -> String {
    format!("User: {}\nAssistant: {}\n", query, answer)
}

/// Session-keyed conversation text.
pub trait SessionMemory: Send + Sync {
    /// Concatenate to any live value and reset the full TTL. `false`
    /// means the backend lost the write.
    fn append(&self, session_id: &str, text: &str) -> bool;

    /// `None` when missing, expired, or the backend failed.
    fn read(&self, session_id: &str) -> Option<String>;

    /// Whether a live value was removed.
    fn delete(&self, session_id: &str) -> bool;
}

struct Entry {
    text: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-process sliding-window store.
pub struct InMemorySessionMemory {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemorySessionMemory {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Tests use short windows here; production keeps the default.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMemory for InMemorySessionMemory {
    fn append(&self, session_id: &str, text: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let combined = match entries.get(session_id) {
            Some(entry) if entry.is_live(now) => format!("{}{}", entry.text, text),
            _ => text.to_string(),
        };
        entries.insert(
            session_id.to_string(),
            Entry {
                text: combined,
                expires_at: now + self.ttl,
            },
        );
        true
    }

    fn read(&self, session_id: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(session_id) {
            Some(entry) if entry.is_live(now) => Some(entry.text.clone()),
            Some(_) => {
                // Lazy eviction on read.
                entries.remove(session_id);
                None
            }
            None => None,
        }
    }

    fn delete(&self, session_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.remove(session_id) {
            Some(entry) => entry.is_live(now),
            None => false,
        }
    }
}
