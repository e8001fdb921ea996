//! The narrow interface between the trading core and the shared event log.
//!
//! Streams are append-only with bounded retention; consumer groups give
//! at-least-once, acknowledgement-based delivery with per-stream ordering.
//! Keys cover the shared flag and heartbeat surface: set-with-expiry plus
//! atomic set-if-absent / delete for compare-and-set transitions.

pub mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no such stream: {0}")]
    NoSuchStream(String),
    #[error("no such group {group} on stream {stream}")]
    NoSuchGroup { stream: String, group: String },
}

pub type BusResult<T> = Result<T, BusError>;

/// One delivered log entry: monotonic id plus a flat field map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: HashMap<String, String>,
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Appends an entry, trimming the stream to roughly `maxlen` entries
    /// when set. Returns the assigned entry id.
    async fn publish(
        &self,
        stream: &str,
        fields: HashMap<String, String>,
        maxlen: Option<usize>,
    ) -> BusResult<String>;

    /// Creates a consumer group (and the stream, if absent). Idempotent.
    async fn create_group(&self, stream: &str, group: &str) -> BusResult<()>;

    /// Reads up to `count` undelivered entries for the group, blocking up
    /// to `block` when none are available. Delivered entries stay pending
    /// until acknowledged.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<StreamEntry>>;

    /// Acknowledges a delivered entry. Returns false if it was not pending.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> BusResult<bool>;

    /// Redelivers up to `count` pending (delivered, unacknowledged)
    /// entries in log order; the recovery path after a consumer crash.
    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BusResult<Vec<StreamEntry>>;

    async fn stream_len(&self, stream: &str) -> BusResult<usize>;

    /// Sets a key, optionally with an expiry.
    async fn set_key(&self, key: &str, value: &str, ttl: Option<Duration>) -> BusResult<()>;

    async fn get_key(&self, key: &str) -> BusResult<Option<String>>;

    /// Atomically sets the key only if absent (or expired). Returns true
    /// when this call performed the transition.
    async fn set_key_if_absent(&self, key: &str, value: &str) -> BusResult<bool>;

    /// Deletes a key. Returns true if it existed.
    async fn delete_key(&self, key: &str) -> BusResult<bool>;
}
