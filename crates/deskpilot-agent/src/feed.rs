//! Ticket-creation feed: producers publish raw change notifications, a single
//! dispatcher decodes them and runs one pipeline task per ticket.

use std::net::SocketAddr;
use std::sync::Arc;

use deskpilot_contracts::TicketState;
use deskpilot_kernel::decode_ticket_event;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

use crate::pipeline::{Disposition, Pipeline};
use crate::retry::{retry_with_backoff, Backoff};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("event feed is closed")]
    Closed,
}

#[derive(Clone)]
pub struct EventFeed {
    tx: mpsc::Sender<Value>,
}

impl EventFeed {
    pub async fn publish(&self, payload: Value) -> Result<(), FeedError> {
        self.tx.send(payload).await.map_err(|_| FeedError::Closed)
    }
}

pub fn channel(capacity: usize) -> (EventFeed, mpsc::Receiver<Value>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventFeed { tx }, rx)
}

fn payload_keys(payload: &Value) -> Vec<String> {
    payload
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default()
}

fn dispatch(tasks: &mut JoinSet<Disposition>, pipeline: &Arc<Pipeline>, payload: Value) {
    tracing::debug!(keys = ?payload_keys(&payload), "ticket event received");
    let Some(event) = decode_ticket_event(&payload) else {
        tracing::warn!(keys = ?payload_keys(&payload), "undecodable ticket event dropped");
        return;
    };
    let state = event.record.state.as_deref().and_then(TicketState::parse);
    if state.is_some_and(|s| s != TicketState::Pending) {
        tracing::debug!(ticket_id = event.record.id, "non-pending ticket event dropped");
        return;
    }
    tracing::debug!(ticket_id = event.record.id, strategy = event.strategy, "ticket event decoded");

    let pipeline = Arc::clone(pipeline);
    tasks.spawn(async move {
        let ticket_id = event.record.id;
        // inner task so a panic surfaces as a JoinError instead of tearing down the set
        let worker = tokio::spawn({
            let pipeline = Arc::clone(&pipeline);
            async move { pipeline.process(event.record).await }
        });
        match worker.await {
            Ok(disposition) => disposition,
            Err(e) => {
                let detail = if e.is_panic() {
                    "ticket task panicked"
                } else {
                    "ticket task cancelled"
                };
                tracing::error!(ticket_id, error = %e, "{detail}");
                if let Some(id) = ticket_id.filter(|id| *id > 0) {
                    pipeline.resolve_unexpected(id, detail).await;
                }
                Disposition::Failed
            }
        }
    });
}

fn log_joined(joined: Result<Disposition, JoinError>) {
    match joined {
        Ok(disposition) => tracing::debug!(?disposition, "ticket task finished"),
        Err(e) => tracing::error!(error = %e, "ticket supervisor failed"),
    }
}

/// Runs until every `EventFeed` handle is dropped, then drains in-flight
/// tickets. Partially applied downstream actions are not rolled back.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<Value>, pipeline: Arc<Pipeline>) {
    let mut tasks = JoinSet::new();
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(payload) => dispatch(&mut tasks, &pipeline, payload),
                None => break,
            },
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_joined(joined),
        }
    }
    if !tasks.is_empty() {
        tracing::info!(in_flight = tasks.len(), "draining ticket tasks");
    }
    while let Some(joined) = tasks.join_next().await {
        log_joined(joined);
    }
    tracing::info!("dispatcher stopped");
}

/// Binds the ingestion listener, retrying with doubling delays.
pub async fn bind_with_retry(addr: SocketAddr, backoff: Backoff) -> Result<TcpListener, String> {
    retry_with_backoff(
        backoff,
        |_: &std::io::Error| true,
        |attempt| async move {
            TcpListener::bind(addr).await.inspect_err(|e| {
                tracing::warn!(%addr, attempt, error = %e, "listener bind failed");
            })
        },
    )
    .await
    .map_err(|e| format!("bind {addr} failed after {} attempts: {e}", backoff.max_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_fails_once_receiver_is_gone() {
        let (feed, rx) = channel(4);
        feed.publish(json!({"new": {"id": 1}})).await.unwrap();
        drop(rx);
        assert!(matches!(feed.publish(json!({})).await, Err(FeedError::Closed)));
    }

    #[tokio::test]
    async fn bind_gives_up_on_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let err = bind_with_retry(addr, Backoff::new(2, Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(err.contains("after 2 attempts"));
    }
}
