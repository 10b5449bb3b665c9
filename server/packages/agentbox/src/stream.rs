//! Ordered, replayable event streams keyed by name.
//!
//! [`EventStream`] is the capability the task runner depends on. The bundled
//! [`MemoryEventStream`] keeps every stream in process; durable backends plug
//! in behind the same trait.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};

/// Stream-assigned entry id, rendered as `sequence-offset` (e.g. `1-0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub sequence: u64,
    pub offset: u64,
}

impl StreamId {
    pub const fn new(sequence: u64, offset: u64) -> Self {
        Self { sequence, offset }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.sequence, self.offset)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid stream id `{0}`")]
pub struct ParseStreamIdError(String);

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (sequence, offset) = value
            .split_once('-')
            .ok_or_else(|| ParseStreamIdError(value.to_string()))?;
        let sequence = sequence
            .parse()
            .map_err(|_| ParseStreamIdError(value.to_string()))?;
        let offset = offset
            .parse()
            .map_err(|_| ParseStreamIdError(value.to_string()))?;
        Ok(Self { sequence, offset })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream `{0}` is closed")]
    Closed(String),
    #[error("stream unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Appends a payload and returns its assigned id.
    async fn put(&self, stream: &str, payload: Vec<u8>) -> Result<StreamId, StreamError>;

    /// Waits for the first entry strictly after `after` and returns it.
    ///
    /// Does not advance any cursor; callers own their position, so an entry
    /// popped twice with the same `after` is delivered twice.
    async fn pop(&self, stream: &str, after: Option<StreamId>) -> Result<StreamEntry, StreamError>;

    /// Returns up to `limit` entries strictly after `after` without waiting.
    async fn read(
        &self,
        stream: &str,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Drops the stream; pending and future pops fail with [`StreamError::Closed`].
    async fn delete(&self, stream: &str) -> Result<(), StreamError>;

    /// Releases a stream nobody will touch again, including whatever
    /// [`delete`](Self::delete) left behind. Pending pops still fail as closed.
    async fn purge(&self, stream: &str) -> Result<(), StreamError> {
        self.delete(stream).await
    }
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: VecDeque<StreamEntry>,
    last_id: Option<StreamId>,
    closed: bool,
}

#[derive(Debug)]
struct StreamSlot {
    log: Mutex<StreamLog>,
    notify: Notify,
}

impl StreamSlot {
    fn new() -> Self {
        Self {
            log: Mutex::new(StreamLog::default()),
            notify: Notify::new(),
        }
    }

    async fn close(&self) {
        {
            let mut log = self.log.lock().await;
            log.closed = true;
            log.entries.clear();
        }
        self.notify.notify_waiters();
    }
}

#[derive(Debug)]
pub struct MemoryEventStream {
    streams: Mutex<HashMap<String, Arc<StreamSlot>>>,
    max_len: usize,
}

const DEFAULT_MAX_LEN: usize = 10_000;

impl MemoryEventStream {
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_LEN)
    }

    /// Keeps at most `max_len` entries per stream, dropping the oldest.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            max_len: max_len.max(1),
        }
    }

    /// Number of registered streams, closed ones included.
    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }

    async fn slot(&self, stream: &str) -> Arc<StreamSlot> {
        let mut streams = self.streams.lock().await;
        streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(StreamSlot::new()))
            .clone()
    }
}

impl Default for MemoryEventStream {
    fn default() -> Self {
        Self::new()
    }
}

fn next_id(last: Option<StreamId>) -> StreamId {
    let now_ms = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).max(0) as u64;
    match last {
        Some(last) if now_ms <= last.sequence => StreamId::new(last.sequence, last.offset + 1),
        _ => StreamId::new(now_ms, 0),
    }
}

fn first_after(log: &StreamLog, after: Option<StreamId>) -> Option<StreamEntry> {
    log.entries
        .iter()
        .find(|entry| after.map_or(true, |after| entry.id > after))
        .cloned()
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn put(&self, stream: &str, payload: Vec<u8>) -> Result<StreamId, StreamError> {
        let slot = self.slot(stream).await;
        let id = {
            let mut log = slot.log.lock().await;
            if log.closed {
                return Err(StreamError::Closed(stream.to_string()));
            }
            let id = next_id(log.last_id);
            log.last_id = Some(id);
            log.entries.push_back(StreamEntry { id, payload });
            while log.entries.len() > self.max_len {
                log.entries.pop_front();
            }
            id
        };
        slot.notify.notify_waiters();
        tracing::trace!(stream = %stream, id = %id, "stream: entry appended");
        Ok(id)
    }

    async fn pop(&self, stream: &str, after: Option<StreamId>) -> Result<StreamEntry, StreamError> {
        let slot = self.slot(stream).await;
        loop {
            // Register interest before checking so a put between the check and
            // the await is not missed.
            let notified = slot.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let log = slot.log.lock().await;
                if let Some(entry) = first_after(&log, after) {
                    return Ok(entry);
                }
                if log.closed {
                    return Err(StreamError::Closed(stream.to_string()));
                }
            }
            notified.await;
        }
    }

    async fn read(
        &self,
        stream: &str,
        after: Option<StreamId>,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let slot = self.slot(stream).await;
        let log = slot.log.lock().await;
        Ok(log
            .entries
            .iter()
            .filter(|entry| after.map_or(true, |after| entry.id > after))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, stream: &str) -> Result<(), StreamError> {
        // The slot stays registered as closed so later puts and pops fail
        // instead of silently starting a fresh stream under the same name.
        self.slot(stream).await.close().await;
        Ok(())
    }

    async fn purge(&self, stream: &str) -> Result<(), StreamError> {
        let Some(slot) = self.streams.lock().await.remove(stream) else {
            return Ok(());
        };
        slot.close().await;
        tracing::trace!(stream = %stream, "stream: purged");
        Ok(())
    }
}
