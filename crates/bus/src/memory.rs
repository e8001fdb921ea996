use crate::{BusError, BusResult, EventBus, StreamEntry};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// In-process [`EventBus`] used by tests, backtests, and paper trading.
///
/// A production deployment implements the same trait over a real log
/// broker; the trading loops are written against the trait only.
#[derive(Debug, Default)]
pub struct MemoryBus {
    inner: Mutex<Inner>,
    notify: Notify,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    keys: HashMap<String, KeyState>,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    entries: VecDeque<(u64, HashMap<String, String>)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: u64,
    // Pending entries hold clones so stream trimming cannot lose an
    // unacknowledged delivery.
    pending: BTreeMap<u64, HashMap<String, String>>,
}

#[derive(Debug)]
struct KeyState {
    value: String,
    expires_at: Option<Instant>,
}

impl KeyState {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_id(seq: u64) -> String {
        format!("{seq}-0")
    }

    fn parse_id(id: &str) -> Option<u64> {
        id.split('-').next()?.parse().ok()
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(
        &self,
        stream: &str,
        fields: HashMap<String, String>,
        maxlen: Option<usize>,
    ) -> BusResult<String> {
        let id = {
            let mut inner = self.inner.lock().expect("bus lock poisoned");
            let state = inner.streams.entry(stream.to_string()).or_default();
            state.next_seq += 1;
            let seq = state.next_seq;
            state.entries.push_back((seq, fields));
            if let Some(maxlen) = maxlen {
                while state.entries.len() > maxlen {
                    state.entries.pop_front();
                }
            }
            Self::entry_id(seq)
        };
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> BusResult<()> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let state = inner.streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> BusResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut inner = self.inner.lock().expect("bus lock poisoned");
                let state = inner
                    .streams
                    .get_mut(stream)
                    .ok_or_else(|| BusError::NoSuchStream(stream.to_string()))?;
                // Collect undelivered entries before taking the group
                // borrow; entries and groups live in the same struct.
                let fresh: Vec<(u64, HashMap<String, String>)> = {
                    let group_state =
                        state
                            .groups
                            .get(group)
                            .ok_or_else(|| BusError::NoSuchGroup {
                                stream: stream.to_string(),
                                group: group.to_string(),
                            })?;
                    state
                        .entries
                        .iter()
                        .filter(|(seq, _)| *seq > group_state.last_delivered)
                        .take(count)
                        .cloned()
                        .collect()
                };
                if !fresh.is_empty() {
                    let group_state = state
                        .groups
                        .get_mut(group)
                        .expect("group checked above");
                    let mut delivered = Vec::with_capacity(fresh.len());
                    for (seq, fields) in fresh {
                        group_state.last_delivered = seq;
                        group_state.pending.insert(seq, fields.clone());
                        delivered.push(StreamEntry {
                            id: Self::entry_id(seq),
                            fields,
                        });
                    }
                    return Ok(delivered);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // A publish between the check and this wait just costs one
            // timeout round; the loop re-checks either way.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> BusResult<bool> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| BusError::NoSuchStream(stream.to_string()))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BusError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        let Some(seq) = Self::parse_id(id) else {
            return Ok(false);
        };
        Ok(group_state.pending.remove(&seq).is_some())
    }

    async fn claim_pending(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
    ) -> BusResult<Vec<StreamEntry>> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| BusError::NoSuchStream(stream.to_string()))?;
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| BusError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(group_state
            .pending
            .iter()
            .take(count)
            .map(|(seq, fields)| StreamEntry {
                id: Self::entry_id(*seq),
                fields: fields.clone(),
            })
            .collect())
    }

    async fn stream_len(&self, stream: &str) -> BusResult<usize> {
        let inner = self.inner.lock().expect("bus lock poisoned");
        Ok(inner.streams.get(stream).map_or(0, |s| s.entries.len()))
    }

    async fn set_key(&self, key: &str, value: &str, ttl: Option<Duration>) -> BusResult<()> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.keys.insert(
            key.to_string(),
            KeyState {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get_key(&self, key: &str) -> BusResult<Option<String>> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.keys.get(key).is_some_and(KeyState::is_expired) {
            inner.keys.remove(key);
        }
        Ok(inner.keys.get(key).map(|k| k.value.clone()))
    }

    async fn set_key_if_absent(&self, key: &str, value: &str) -> BusResult<bool> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.keys.get(key).is_some_and(KeyState::is_expired) {
            inner.keys.remove(key);
        }
        if inner.keys.contains_key(key) {
            return Ok(false);
        }
        inner.keys.insert(
            key.to_string(),
            KeyState {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(true)
    }

    async fn delete_key(&self, key: &str) -> BusResult<bool> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        Ok(inner.keys.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(value: &str) -> HashMap<String, String> {
        HashMap::from([("data".to_string(), value.to_string())])
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = MemoryBus::new();
        bus.create_group("s", "g").await.unwrap();
        bus.publish("s", fields("a"), None).await.unwrap();
        bus.publish("s", fields("b"), None).await.unwrap();

        let entries = bus
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        let values: Vec<_> = entries.iter().map(|e| e.fields["data"].clone()).collect();
        assert_eq!(values, ["a", "b"]);
    }

    #[tokio::test]
    async fn unacked_entries_stay_pending_for_claim() {
        let bus = MemoryBus::new();
        bus.create_group("s", "g").await.unwrap();
        bus.publish("s", fields("a"), None).await.unwrap();
        bus.publish("s", fields("b"), None).await.unwrap();

        let entries = bus
            .read_group("s", "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        bus.ack("s", "g", &entries[0].id).await.unwrap();

        // A fresh read sees nothing new; the crashed delivery is claimable.
        let fresh = bus
            .read_group("s", "g", "c2", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(fresh.is_empty());
        let claimed = bus.claim_pending("s", "g", "c2", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].fields["data"], "b");
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let bus = MemoryBus::new();
        bus.create_group("s", "g").await.unwrap();
        bus.publish("s", fields("a"), None).await.unwrap();
        let entries = bus
            .read_group("s", "g", "c", 1, Duration::ZERO)
            .await
            .unwrap();
        assert!(bus.ack("s", "g", &entries[0].id).await.unwrap());
        assert!(!bus.ack("s", "g", &entries[0].id).await.unwrap());
    }

    #[tokio::test]
    async fn maxlen_trims_oldest_but_keeps_pending() {
        let bus = MemoryBus::new();
        bus.create_group("s", "g").await.unwrap();
        bus.publish("s", fields("a"), Some(2)).await.unwrap();
        let delivered = bus
            .read_group("s", "g", "c", 1, Duration::ZERO)
            .await
            .unwrap();
        bus.publish("s", fields("b"), Some(2)).await.unwrap();
        bus.publish("s", fields("c"), Some(2)).await.unwrap();
        bus.publish("s", fields("d"), Some(2)).await.unwrap();

        assert_eq!(bus.stream_len("s").await.unwrap(), 2);
        // "a" was trimmed from the stream but its delivery is still pending.
        let claimed = bus.claim_pending("s", "g", "c", 10).await.unwrap();
        assert_eq!(claimed[0].id, delivered[0].id);
    }

    #[tokio::test]
    async fn read_group_blocks_until_timeout() {
        let bus = MemoryBus::new();
        bus.create_group("s", "g").await.unwrap();
        let started = std::time::Instant::now();
        let entries = bus
            .read_group("s", "g", "c", 1, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(entries.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn read_group_requires_group() {
        let bus = MemoryBus::new();
        bus.publish("s", fields("a"), None).await.unwrap();
        let err = bus
            .read_group("s", "missing", "c", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::NoSuchGroup { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_expire() {
        let bus = MemoryBus::new();
        bus.set_key("hb", "1", Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(bus.get_key("hb").await.unwrap().as_deref(), Some("1"));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(bus.get_key("hb").await.unwrap(), None);
        // An expired key no longer blocks set-if-absent.
        assert!(bus.set_key_if_absent("hb", "2").await.unwrap());
    }

    #[tokio::test]
    async fn set_if_absent_is_a_single_transition() {
        let bus = MemoryBus::new();
        assert!(bus.set_key_if_absent("halted", "1").await.unwrap());
        assert!(!bus.set_key_if_absent("halted", "1").await.unwrap());
        assert!(bus.delete_key("halted").await.unwrap());
        assert!(!bus.delete_key("halted").await.unwrap());
        assert!(bus.set_key_if_absent("halted", "1").await.unwrap());
    }
}
