//! In-process publish point between the HTTP ingress, the reply queue and the
//! chat session.
//!
//! One router is built by the process assembly and shared by `Arc`. Each kind
//! of event travels on its own broadcast channel; every subscriber owns its
//! receiver, so a slow or failed subscriber never affects the others. Delivery
//! is at-most-once: nothing is replayed, and a subscriber that falls behind by
//! more than the channel capacity skips what it missed.

use tokio::sync::broadcast;

use crate::types::{BridgeEvent, BridgeReply};

const ROUTER_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct EventRouter {
    events: broadcast::Sender<BridgeEvent>,
    replies: broadcast::Sender<BridgeReply>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRouter {
    pub fn new() -> Self {
        Self::with_capacity(ROUTER_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (replies, _) = broadcast::channel(capacity);
        Self { events, replies }
    }

    /// Publishes an accepted event; returns how many subscribers received it.
    pub fn publish_event(&self, event: BridgeEvent) -> usize {
        let event_id = event.id.clone();
        match self.events.send(event) {
            Ok(count) => count,
            Err(_) => {
                tracing::debug!(event_id = %event_id, "no event subscribers");
                0
            }
        }
    }

    /// Publishes a reply that was just appended to the reply queue.
    pub fn publish_reply(&self, reply: BridgeReply) -> usize {
        let reply_id = reply.id.clone();
        match self.replies.send(reply) {
            Ok(count) => count,
            Err(_) => {
                tracing::debug!(reply_id = %reply_id, "no reply subscribers");
                0
            }
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_replies(&self) -> broadcast::Receiver<BridgeReply> {
        self.replies.subscribe()
    }
}

/// Receives the next item, skipping over anything lost to lag.
///
/// Returns `None` once the router is gone.
pub async fn recv_next<T: Clone>(receiver: &mut broadcast::Receiver<T>) -> Option<T> {
    loop {
        match receiver.recv().await {
            Ok(item) => return Some(item),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "router subscriber lagged; skipped items");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::types::ToolSource;

    fn reply(id: &str) -> BridgeReply {
        BridgeReply {
            id: id.to_string(),
            source: ToolSource::Opencode,
            thread_id: "session-1".to_string(),
            body: "ok".to_string(),
            posted_at: Utc::now(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_publish() {
        let router = EventRouter::new();
        let mut first = router.subscribe_replies();
        let mut second = router.subscribe_replies();

        assert_eq!(router.publish_reply(reply("r-1")), 2);
        drop(second.recv().await.expect("second receives"));
        drop(second);

        assert_eq!(router.publish_reply(reply("r-2")), 1);
        assert_eq!(first.recv().await.expect("first").id, "r-1");
        assert_eq!(first.recv().await.expect("first").id, "r-2");
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_not_an_error() {
        let router = EventRouter::new();
        assert_eq!(router.publish_reply(reply("r-1")), 0);
        let mut late = router.subscribe_replies();
        assert_eq!(router.publish_reply(reply("r-2")), 1);
        assert_eq!(late.recv().await.expect("late").id, "r-2");
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_retained_items() {
        let router = EventRouter::with_capacity(2);
        let mut receiver = router.subscribe_replies();
        for index in 0..5 {
            router.publish_reply(reply(&format!("r-{index}")));
        }
        let next = recv_next(&mut receiver).await.expect("retained item");
        assert_eq!(next.id, "r-3");
        drop(router);
        assert_eq!(recv_next(&mut receiver).await.map(|r| r.id), Some("r-4".to_string()));
        assert!(recv_next(&mut receiver).await.is_none());
    }
}
