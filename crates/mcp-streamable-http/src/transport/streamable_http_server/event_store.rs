//! Event storage for resumable SSE streams.
//!
//! When a store is configured every SSE message is stored before it is
//! written, and goes out with the returned id on its `id:` line. A client that
//! lost its connection reconnects with a GET carrying `Last-Event-ID`, and the
//! transport replays what was stored after that event onto a stream with the
//! original stream id.

use std::{collections::VecDeque, sync::Arc};

use tokio::sync::Mutex;

use super::registry::StreamId;
use crate::{
    error::BoxError, model::JsonRpcMessage,
    transport::common::server_side_http::ServerSseMessage,
};

pub type EventId = String;

/// Events stored after a given id, all from the stream that id belongs to.
#[derive(Debug, Clone)]
pub struct ReplayedEvents {
    pub stream_id: StreamId,
    pub events: Vec<ServerSseMessage>,
}

#[async_trait::async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Store `message` as the next event of `stream_id` and return its id.
    async fn store_event(
        &self,
        stream_id: &StreamId,
        message: &JsonRpcMessage,
    ) -> Result<EventId, BoxError>;

    /// `None` when `last_event_id` is unknown (never issued or already evicted).
    async fn replay_events_after(
        &self,
        last_event_id: &str,
    ) -> Result<Option<ReplayedEvents>, BoxError>;
}

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug)]
struct StoredEvent {
    id: EventId,
    stream_id: StreamId,
    message: Arc<JsonRpcMessage>,
}

#[derive(Debug, Default)]
struct EventLog {
    events: VecDeque<StoredEvent>,
    next_index: u64,
}

/// Keeps the most recent events of every stream in one bounded ring; the
/// oldest event is evicted first.
#[derive(Debug)]
pub struct InMemoryEventStore {
    capacity: usize,
    log: Mutex<EventLog>,
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            log: Mutex::new(EventLog::default()),
        }
    }

    pub async fn len(&self) -> usize {
        self.log.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait::async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(
        &self,
        stream_id: &StreamId,
        message: &JsonRpcMessage,
    ) -> Result<EventId, BoxError> {
        let mut log = self.log.lock().await;
        let id = format!("{stream_id}/{}", log.next_index);
        log.next_index += 1;
        if log.events.len() == self.capacity {
            log.events.pop_front();
        }
        log.events.push_back(StoredEvent {
            id: id.clone(),
            stream_id: stream_id.clone(),
            message: Arc::new(message.clone()),
        });
        Ok(id)
    }

    async fn replay_events_after(
        &self,
        last_event_id: &str,
    ) -> Result<Option<ReplayedEvents>, BoxError> {
        let log = self.log.lock().await;
        let Some(position) = log.events.iter().position(|event| event.id == last_event_id) else {
            return Ok(None);
        };
        let stream_id = log.events[position].stream_id.clone();
        let events = log
            .events
            .iter()
            .skip(position + 1)
            .filter(|event| event.stream_id == stream_id)
            .map(|event| ServerSseMessage {
                event_id: Some(event.id.clone()),
                message: event.message.clone(),
            })
            .collect();
        Ok(Some(ReplayedEvents { stream_id, events }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(n: i64) -> JsonRpcMessage {
        JsonRpcMessage::notification("notifications/message", Some(serde_json::json!({ "n": n })))
    }

    #[tokio::test]
    async fn test_replay_only_same_stream_after_id() {
        let store = InMemoryEventStore::new();
        let a: StreamId = "a".into();
        let b: StreamId = "b".into();
        let first = store.store_event(&a, &note(1)).await.unwrap();
        store.store_event(&b, &note(2)).await.unwrap();
        let third = store.store_event(&a, &note(3)).await.unwrap();

        let replay = store.replay_events_after(&first).await.unwrap().unwrap();
        assert_eq!(replay.stream_id, a);
        assert_eq!(replay.events.len(), 1);
        assert_eq!(replay.events[0].event_id.as_deref(), Some(third.as_str()));
        assert_eq!(*replay.events[0].message, note(3));
    }

    #[tokio::test]
    async fn test_unknown_event_id() {
        let store = InMemoryEventStore::new();
        assert!(store.replay_events_after("nope/0").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = InMemoryEventStore::with_capacity(2);
        let s: StreamId = "s".into();
        let evicted = store.store_event(&s, &note(1)).await.unwrap();
        store.store_event(&s, &note(2)).await.unwrap();
        store.store_event(&s, &note(3)).await.unwrap();
        assert_eq!(store.len().await, 2);
        assert!(store.replay_events_after(&evicted).await.unwrap().is_none());
    }
}
