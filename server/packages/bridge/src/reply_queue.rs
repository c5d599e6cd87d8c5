//! Buffer of human replies waiting for the originating tool to drain them.
//!
//! Replies are keyed by `(source, external thread id)` in a single map behind
//! one mutex. `enqueue` appends under the lock and only publishes the
//! `ReplyQueued` notification after releasing it; `drain` removes the whole key
//! under the lock. A reply is therefore observed by exactly one drain, and the
//! order inside a key is enqueue order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::{Map, Value};

use crate::event_router::EventRouter;
use crate::types::{BridgeReply, ToolSource};

type ReplyKey = (ToolSource, String);

/// Pending counts per source and thread.
pub type QueueSnapshot = BTreeMap<ToolSource, BTreeMap<String, usize>>;

#[derive(Debug)]
pub struct ReplyQueue {
    store: Mutex<HashMap<ReplyKey, Vec<BridgeReply>>>,
    router: Arc<EventRouter>,
}

impl ReplyQueue {
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            router,
        }
    }

    pub fn enqueue(
        &self,
        source: ToolSource,
        thread_id: &str,
        body: &str,
        metadata: Option<Map<String, Value>>,
    ) -> BridgeReply {
        let reply = BridgeReply {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            thread_id: thread_id.to_string(),
            body: body.to_string(),
            posted_at: Utc::now(),
            metadata,
        };

        let pending = {
            let mut store = self.lock();
            let bucket = store.entry((source, thread_id.to_string())).or_default();
            bucket.push(reply.clone());
            bucket.len()
        };

        tracing::debug!(
            source = %source,
            thread_id = %thread_id,
            reply_id = %reply.id,
            pending,
            "reply queued"
        );
        self.router.publish_reply(reply.clone());
        reply
    }

    pub fn drain(&self, source: ToolSource, thread_id: &str) -> Vec<BridgeReply> {
        let replies = self
            .lock()
            .remove(&(source, thread_id.to_string()))
            .unwrap_or_default();
        if !replies.is_empty() {
            tracing::debug!(
                source = %source,
                thread_id = %thread_id,
                count = replies.len(),
                "replies drained"
            );
        }
        replies
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let store = self.lock();
        let mut snapshot = QueueSnapshot::new();
        for ((source, thread_id), replies) in store.iter() {
            snapshot
                .entry(*source)
                .or_default()
                .insert(thread_id.clone(), replies.len());
        }
        snapshot
    }

    pub fn pending(&self, source: ToolSource, thread_id: &str) -> usize {
        self.lock()
            .get(&(source, thread_id.to_string()))
            .map_or(0, Vec::len)
    }

    /// Total replies waiting across all threads.
    pub fn len(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ReplyKey, Vec<BridgeReply>>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
