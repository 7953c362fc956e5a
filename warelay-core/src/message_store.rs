// ABOUTME: Bounded in-memory record of recent messages keyed by chat and message ID
// ABOUTME: Answers the transport's retry lookups; misses are an explicit None

use crate::traits::MessageKey;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type StoreKey = (String, String);

/// Recent message texts, evicting the oldest once `capacity` is reached
#[derive(Debug)]
pub struct MessageStore {
    capacity: usize,
    inner: Mutex<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    texts: HashMap<StoreKey, String>,
    order: VecDeque<StoreKey>,
}

impl MessageStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Remember a message. Empty IDs are skipped since they cannot be looked up.
    pub fn record(&self, chat_id: &str, message_id: &str, text: &str) {
        if message_id.is_empty() {
            return;
        }
        let key = (chat_id.to_string(), message_id.to_string());
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.texts.insert(key.clone(), text.to_string()).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.texts.remove(&oldest);
            }
        }
    }

    /// Look up a message for resend; None when it was never seen or already evicted
    pub fn lookup(&self, key: &MessageKey) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .texts
            .get(&(key.remote_jid.clone(), key.id.clone()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .order
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
