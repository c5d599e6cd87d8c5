//! Periodically drains replies for tracked threads and hands them to the tool.
//!
//! Draining is destructive on the bridge side, so a reply whose forward fails
//! is logged and lost.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use codex_opencode_bridge::types::{BridgeReply, ToolSource};
use tokio::sync::watch;

use crate::client::ClientError;

#[async_trait]
pub trait ReplyDrain: Send + Sync {
    async fn drain(&self, source: ToolSource, thread_id: &str) -> Result<Vec<BridgeReply>, ClientError>;
}

#[async_trait]
pub trait ReplyForwarder: Send + Sync {
    async fn forward(&self, thread_id: &str, reply: &BridgeReply) -> Result<(), ClientError>;
}

#[async_trait]
impl<T: ReplyDrain + ?Sized> ReplyDrain for Arc<T> {
    async fn drain(&self, source: ToolSource, thread_id: &str) -> Result<Vec<BridgeReply>, ClientError> {
        (**self).drain(source, thread_id).await
    }
}

#[async_trait]
impl<T: ReplyForwarder + ?Sized> ReplyForwarder for Arc<T> {
    async fn forward(&self, thread_id: &str, reply: &BridgeReply) -> Result<(), ClientError> {
        (**self).forward(thread_id, reply).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadFailure {
    pub thread_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub threads: usize,
    pub drained: usize,
    pub forwarded: usize,
    pub failures: Vec<ThreadFailure>,
}

pub struct ReplyPoller<D, F> {
    source: ToolSource,
    drain: D,
    forwarder: F,
    tracked: Mutex<BTreeSet<String>>,
}

impl<D, F> ReplyPoller<D, F>
where
    D: ReplyDrain,
    F: ReplyForwarder,
{
    pub fn new(source: ToolSource, drain: D, forwarder: F) -> Self {
        Self {
            source,
            drain,
            forwarder,
            tracked: Mutex::new(BTreeSet::new()),
        }
    }

    /// Starts polling a thread; returns false if it was already tracked.
    pub fn track(&self, thread_id: &str) -> bool {
        self.lock().insert(thread_id.to_string())
    }

    pub fn untrack(&self, thread_id: &str) -> bool {
        self.lock().remove(thread_id)
    }

    pub fn tracked(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Drains every tracked thread once. One thread failing does not stop the
    /// others.
    pub async fn tick(&self) -> TickReport {
        let threads = self.tracked();
        let mut report = TickReport {
            threads: threads.len(),
            ..TickReport::default()
        };
        for thread_id in threads {
            let replies = match self.drain.drain(self.source, &thread_id).await {
                Ok(replies) => replies,
                Err(err) => {
                    tracing::warn!(thread_id = %thread_id, error = %err, "failed to drain replies");
                    report.failures.push(ThreadFailure {
                        thread_id,
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            report.drained += replies.len();
            for reply in &replies {
                match self.forwarder.forward(&thread_id, reply).await {
                    Ok(()) => report.forwarded += 1,
                    Err(err) => {
                        tracing::warn!(
                            thread_id = %thread_id,
                            reply_id = %reply.id,
                            error = %err,
                            "failed to forward reply"
                        );
                        report.failures.push(ThreadFailure {
                            thread_id: thread_id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }
        report
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.tracked
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<D, F> ReplyPoller<D, F>
where
    D: ReplyDrain + 'static,
    F: ReplyForwarder + 'static,
{
    /// Ticks immediately, then every `interval`, until shutdown.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            let report = self.tick().await;
            if report.drained > 0 || !report.failures.is_empty() {
                tracing::debug!(
                    threads = report.threads,
                    drained = report.drained,
                    forwarded = report.forwarded,
                    failures = report.failures.len(),
                    "reply poll finished"
                );
            }
        }
        tracing::debug!("reply poller stopped");
    }
}
