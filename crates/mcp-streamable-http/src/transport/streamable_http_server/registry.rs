//! Streams and the pending-request ledger.
//!
//! A *stream* is somewhere outbound messages can go: the body of an SSE
//! response, or a deferred JSON response that is resolved once every reply
//! has been collected. The ledger maps each in-flight request id to the stream
//! that must carry its reply.
//!
//! The registry does no locking of its own; the transport owns it behind a
//! single mutex so every mutation is serialized.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
};

use tokio::sync::{mpsc::UnboundedSender, oneshot};

use crate::{
    model::{JsonRpcMessage, RequestId},
    transport::common::server_side_http::{ServerSseMessage, session_id},
};

/// Id of the single GET stream. Response streams use random UUIDs.
pub const STANDALONE_STREAM_ID: &str = "_GET_stream";

pub type StreamId = Arc<str>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Only one SSE stream is allowed per session")]
    Conflict,
    #[error("Request id {0} is already in flight")]
    DuplicatedRequestId(RequestId),
}

#[derive(Debug)]
pub enum StreamSink {
    /// Writes each message as an SSE event as soon as it is produced.
    Sse(UnboundedSender<ServerSseMessage>),
    /// Resolves a waiting POST with every reply, in registration order.
    Json(oneshot::Sender<Vec<JsonRpcMessage>>),
}

/// Identifies one registration of a stream. Stream ids can be reused (the
/// standalone id always is), so a stale handle must not release a newer
/// stream under the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub id: StreamId,
    pub generation: u64,
}

#[derive(Debug)]
struct StreamEntry {
    generation: u64,
    sink: StreamSink,
    pending: Vec<RequestId>,
    received: HashMap<RequestId, JsonRpcMessage>,
}

impl StreamEntry {
    fn is_complete(&self) -> bool {
        !self.pending.is_empty() && self.pending.iter().all(|id| self.received.contains_key(id))
    }
}

/// Where a reply keyed by a request id should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseRoute {
    Stream(StreamId),
    /// The client of the owning stream went away before the reply arrived.
    /// A resumable stream can still be picked up again with `Last-Event-ID`.
    Detached { stream_id: StreamId, resumable: bool },
    /// The id was never registered, or was already answered.
    Unknown,
}

/// Unanswered ids of a response stream whose client disconnected.
#[derive(Debug)]
struct DetachedStream {
    resumable: bool,
    pending: Vec<RequestId>,
    received: HashMap<RequestId, JsonRpcMessage>,
}

impl DetachedStream {
    fn is_complete(&self) -> bool {
        self.pending.iter().all(|id| self.received.contains_key(id))
    }
}

/// Most detached streams kept at once; the oldest is forgotten first.
pub const MAX_DETACHED_STREAMS: usize = 256;

/// What [`StreamRegistry::resume_stream`] found under a stream id.
#[derive(Debug)]
pub enum Resumed {
    /// The stream is live again and will carry the replies still owed on it.
    Attached(StreamHandle),
    /// Nothing is owed on that stream any more; replayed events are all there is.
    Finished,
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<StreamId, StreamEntry>,
    ledger: HashMap<RequestId, StreamId>,
    detached: HashMap<StreamId, DetachedStream>,
    detached_order: VecDeque<StreamId>,
    next_generation: u64,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        id: StreamId,
        sink: StreamSink,
        pending: Vec<RequestId>,
        received: HashMap<RequestId, JsonRpcMessage>,
    ) -> StreamHandle {
        self.next_generation += 1;
        let generation = self.next_generation;
        for request_id in &pending {
            self.ledger.insert(request_id.clone(), id.clone());
        }
        self.streams.insert(
            id.clone(),
            StreamEntry {
                generation,
                sink,
                pending,
                received,
            },
        );
        StreamHandle { id, generation }
    }

    /// Register an SSE stream under a fixed id, failing if one is live.
    pub fn open_stream(
        &mut self,
        id: StreamId,
        tx: UnboundedSender<ServerSseMessage>,
    ) -> Result<StreamHandle, RegistryError> {
        if self.streams.contains_key(&id) {
            return Err(RegistryError::Conflict);
        }
        Ok(self.insert(id, StreamSink::Sse(tx), Vec::new(), HashMap::new()))
    }

    pub fn open_standalone_stream(
        &mut self,
        tx: UnboundedSender<ServerSseMessage>,
    ) -> Result<StreamHandle, RegistryError> {
        self.open_stream(STANDALONE_STREAM_ID.into(), tx)
    }

    /// Allocate a fresh stream answering `request_ids`.
    pub fn open_response_stream(
        &mut self,
        request_ids: Vec<RequestId>,
        sink: StreamSink,
    ) -> Result<StreamHandle, RegistryError> {
        let mut seen = HashSet::with_capacity(request_ids.len());
        for id in &request_ids {
            if self.ledger.contains_key(id) || !seen.insert(id) {
                return Err(RegistryError::DuplicatedRequestId(id.clone()));
            }
        }
        Ok(self.insert(session_id(), sink, request_ids, HashMap::new()))
    }

    /// Re-register a stream a client reconnected to with `Last-Event-ID`.
    ///
    /// A detached response stream gets its unanswered ids back, so it
    /// completes like the original would have.
    pub fn resume_stream(
        &mut self,
        id: StreamId,
        tx: UnboundedSender<ServerSseMessage>,
    ) -> Result<Resumed, RegistryError> {
        if self.streams.contains_key(&id) {
            return Err(RegistryError::Conflict);
        }
        if &*id == STANDALONE_STREAM_ID {
            return self.open_stream(id, tx).map(Resumed::Attached);
        }
        match self.detached.remove(&id) {
            Some(detached) if detached.resumable => {
                self.detached_order.retain(|detached_id| *detached_id != id);
                let handle = self.insert(
                    id,
                    StreamSink::Sse(tx),
                    detached.pending,
                    detached.received,
                );
                Ok(Resumed::Attached(handle))
            }
            Some(detached) => {
                self.detached.insert(id, detached);
                Ok(Resumed::Finished)
            }
            None => Ok(Resumed::Finished),
        }
    }

    pub fn has_standalone_stream(&self) -> bool {
        self.streams.contains_key(STANDALONE_STREAM_ID)
    }

    pub fn contains_stream(&self, id: &str) -> bool {
        self.streams.contains_key(id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn detached_stream_count(&self) -> usize {
        self.detached.len()
    }

    /// Ids still owed a reply, on live and detached streams alike.
    pub fn pending_request_count(&self) -> usize {
        self.ledger.len()
    }

    pub fn resolve_response(&self, request_id: &RequestId) -> ResponseRoute {
        let Some(stream_id) = self.ledger.get(request_id) else {
            return ResponseRoute::Unknown;
        };
        if self.streams.contains_key(stream_id) {
            return ResponseRoute::Stream(stream_id.clone());
        }
        match self.detached.get(stream_id) {
            Some(detached) => ResponseRoute::Detached {
                stream_id: stream_id.clone(),
                resumable: detached.resumable,
            },
            None => ResponseRoute::Unknown,
        }
    }

    /// The stream waiting on `request_id`, if any.
    pub fn stream_for_request(&self, request_id: &RequestId) -> Option<&StreamId> {
        self.ledger.get(request_id)
    }

    pub fn is_sse(&self, stream_id: &str) -> bool {
        matches!(
            self.streams.get(stream_id),
            Some(StreamEntry {
                sink: StreamSink::Sse(_),
                ..
            })
        )
    }

    /// Whether `stream_id` is detached and can still be resumed.
    pub fn is_resumable_detached(&self, stream_id: &str) -> bool {
        self.detached
            .get(stream_id)
            .is_some_and(|detached| detached.resumable)
    }

    /// Push a message onto an SSE stream. Returns `false` when the stream is
    /// gone, collects JSON, or its receiver has been dropped.
    pub fn write(&self, stream_id: &str, message: ServerSseMessage) -> bool {
        match self.streams.get(stream_id) {
            Some(StreamEntry {
                sink: StreamSink::Sse(tx),
                ..
            }) => tx.send(message).is_ok(),
            _ => false,
        }
    }

    /// Store a reply against its stream. Returns `true` once every pending id
    /// of a live stream has a reply.
    ///
    /// A detached stream that has collected every reply is forgotten here.
    pub fn record_response(&mut self, request_id: &RequestId, message: JsonRpcMessage) -> bool {
        let Some(stream_id) = self.ledger.get(request_id).cloned() else {
            return false;
        };
        if let Some(entry) = self.streams.get_mut(&stream_id) {
            entry.received.insert(request_id.clone(), message);
            return entry.is_complete();
        }
        let Some(detached) = self.detached.get_mut(&stream_id) else {
            return false;
        };
        detached.received.insert(request_id.clone(), message);
        if detached.is_complete() {
            self.forget_detached(&stream_id);
        }
        false
    }

    /// Remove a finished stream and deliver its final output.
    pub fn complete_stream(&mut self, stream_id: &str) {
        let Some(mut entry) = self.streams.remove(stream_id) else {
            return;
        };
        for request_id in &entry.pending {
            self.ledger.remove(request_id);
        }
        match entry.sink {
            StreamSink::Json(tx) => {
                let responses = entry
                    .pending
                    .iter()
                    .filter_map(|id| entry.received.remove(id))
                    .collect();
                if tx.send(responses).is_err() {
                    tracing::debug!(%stream_id, "json response receiver already gone");
                }
            }
            // dropping the last sender ends the SSE body
            StreamSink::Sse(tx) => drop(tx),
        }
    }

    /// Tear down a stream whose client went away.
    ///
    /// Ids still owed a reply stay in the ledger under a detached stream, so
    /// late replies are recognised. With `resumable`, an SSE response stream
    /// can be attached again by [`resume_stream`](Self::resume_stream).
    pub fn release(&mut self, handle: &StreamHandle, resumable: bool) -> bool {
        match self.streams.get(&handle.id) {
            Some(entry) if entry.generation == handle.generation => {}
            _ => return false,
        }
        let Some(entry) = self.streams.remove(&handle.id) else {
            return false;
        };
        let detached = DetachedStream {
            resumable: resumable && matches!(entry.sink, StreamSink::Sse(_)),
            pending: entry.pending,
            received: entry.received,
        };
        if detached.is_complete() {
            for request_id in &detached.pending {
                self.ledger.remove(request_id);
            }
            return true;
        }
        self.detached.insert(handle.id.clone(), detached);
        self.detached_order.push_back(handle.id.clone());
        while self.detached_order.len() > MAX_DETACHED_STREAMS {
            if let Some(oldest) = self.detached_order.front().cloned() {
                tracing::debug!(stream_id = %oldest, "detached stream limit reached, oldest forgotten");
                self.forget_detached(&oldest);
            }
        }
        true
    }

    fn forget_detached(&mut self, stream_id: &StreamId) {
        if let Some(detached) = self.detached.remove(stream_id) {
            for request_id in &detached.pending {
                self.ledger.remove(request_id);
            }
        }
        self.detached_order.retain(|id| id != stream_id);
    }

    /// Drop every stream without waiting for outstanding replies.
    pub fn close_all(&mut self) {
        let streams = std::mem::take(&mut self.streams);
        self.ledger.clear();
        self.detached.clear();
        self.detached_order.clear();
        tracing::debug!(count = streams.len(), "closing all streams");
        drop(streams);
    }
}
