//! In-memory store and bus backends.
//!
//! Both keep their state behind a `parking_lot` mutex that is never held
//! across an await. They support fault injection (failed or stalled reads,
//! refused connections, dropped links) so the engine's failure handling can
//! be exercised without external services.

use crate::bus::{Delivery, NotificationBus};
use crate::error::{SyncError, SyncResult};
use crate::event::ChangeEvent;
use crate::store::ConfigStore;
use crate::types::{ObjectId, ObjectKey, ObjectType, PropertyBag};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Callback run at the start of every `list` call with the listed type.
pub type ListHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct StoreInner {
    objects: BTreeMap<ObjectType, BTreeMap<ObjectId, PropertyBag>>,
    derived: HashMap<ObjectKey, PropertyBag>,
    read_faults: HashMap<ObjectKey, u32>,
    read_stalls: HashMap<ObjectKey, Duration>,
    write_stalls: HashMap<ObjectKey, Duration>,
    list_faults: HashMap<ObjectType, u32>,
    write_faults: u32,
    disconnected: bool,
    reads: u64,
    writes: u64,
}

/// Config store held in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    list_hook: Mutex<Option<ListHook>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an object.
    pub fn put(&self, obj_type: &str, id: &str, raw: PropertyBag) {
        self.inner
            .lock()
            .objects
            .entry(obj_type.to_string())
            .or_default()
            .insert(id.to_string(), raw);
    }

    /// Removes an object. Returns true if it existed.
    pub fn remove(&self, obj_type: &str, id: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.derived.remove(&ObjectKey::new(obj_type, id));
        inner
            .objects
            .get_mut(obj_type)
            .is_some_and(|objects| objects.remove(id).is_some())
    }

    /// Returns a stored object body.
    pub fn get(&self, obj_type: &str, id: &str) -> Option<PropertyBag> {
        self.inner.lock().objects.get(obj_type)?.get(id).cloned()
    }

    /// Returns the derived state last written for an object.
    pub fn derived(&self, obj_type: &str, id: &str) -> Option<PropertyBag> {
        self.inner
            .lock()
            .derived
            .get(&ObjectKey::new(obj_type, id))
            .cloned()
    }

    /// Returns the stored ids of a type in id order.
    pub fn ids(&self, obj_type: &str) -> Vec<ObjectId> {
        self.inner
            .lock()
            .objects
            .get(obj_type)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of stored objects of a type.
    pub fn count(&self, obj_type: &str) -> usize {
        self.inner
            .lock()
            .objects
            .get(obj_type)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }

    /// Fails the next `times` reads of one object with a store error.
    pub fn fail_reads(&self, obj_type: &str, id: &str, times: u32) {
        self.inner
            .lock()
            .read_faults
            .insert(ObjectKey::new(obj_type, id), times);
    }

    /// Delays every read of one object by `delay`.
    pub fn stall_reads(&self, obj_type: &str, id: &str, delay: Duration) {
        self.inner
            .lock()
            .read_stalls
            .insert(ObjectKey::new(obj_type, id), delay);
    }

    /// Delays every derived-state write of one object by `delay`.
    pub fn stall_writes(&self, obj_type: &str, id: &str, delay: Duration) {
        self.inner
            .lock()
            .write_stalls
            .insert(ObjectKey::new(obj_type, id), delay);
    }

    /// Stops delaying reads and writes of one object.
    pub fn clear_stall(&self, obj_type: &str, id: &str) {
        let key = ObjectKey::new(obj_type, id);
        let mut inner = self.inner.lock();
        inner.read_stalls.remove(&key);
        inner.write_stalls.remove(&key);
    }

    /// Fails the next `times` listings of a type.
    pub fn fail_lists(&self, obj_type: &str, times: u32) {
        self.inner
            .lock()
            .list_faults
            .insert(obj_type.to_string(), times);
    }

    /// Fails the next `times` derived-state writes.
    pub fn fail_writes(&self, times: u32) {
        self.inner.lock().write_faults = times;
    }

    /// Simulates a lost (or restored) connection.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.inner.lock().disconnected = disconnected;
    }

    /// Installs a callback run at the start of every listing.
    pub fn on_list(&self, hook: ListHook) {
        *self.list_hook.lock() = Some(hook);
    }

    /// Returns the number of reads served or attempted.
    pub fn read_count(&self) -> u64 {
        self.inner.lock().reads
    }

    /// Returns the number of derived-state writes attempted.
    pub fn write_count(&self) -> u64 {
        self.inner.lock().writes
    }
}

fn take_fault<K: std::hash::Hash + Eq>(faults: &mut HashMap<K, u32>, key: &K) -> bool {
    match faults.get_mut(key) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn connect(&self) -> SyncResult<()> {
        if self.inner.lock().disconnected {
            return Err(SyncError::store_disconnected("connect", "store unreachable"));
        }
        Ok(())
    }

    async fn list(&self, obj_type: &str) -> SyncResult<Vec<(ObjectId, PropertyBag)>> {
        let hook = self.list_hook.lock().clone();
        if let Some(hook) = hook {
            hook(obj_type);
        }

        let mut inner = self.inner.lock();
        if inner.disconnected {
            return Err(SyncError::store_disconnected("list", "store unreachable"));
        }
        if take_fault(&mut inner.list_faults, &obj_type.to_string()) {
            return Err(SyncError::store("list", format!("injected fault listing {obj_type}")));
        }
        Ok(inner
            .objects
            .get(obj_type)
            .map(|objects| {
                objects
                    .iter()
                    .map(|(id, raw)| (id.clone(), raw.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_derived(&self, obj_type: &str) -> SyncResult<Vec<(ObjectId, PropertyBag)>> {
        let inner = self.inner.lock();
        if inner.disconnected {
            return Err(SyncError::store_disconnected("list_derived", "store unreachable"));
        }
        let mut derived: Vec<(ObjectId, PropertyBag)> = inner
            .derived
            .iter()
            .filter(|(key, _)| key.obj_type == obj_type)
            .map(|(key, bag)| (key.id.clone(), bag.clone()))
            .collect();
        derived.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(derived)
    }

    async fn read(&self, obj_type: &str, id: &str) -> SyncResult<PropertyBag> {
        let key = ObjectKey::new(obj_type, id);
        let stall = {
            let mut inner = self.inner.lock();
            inner.reads += 1;
            if inner.disconnected {
                return Err(SyncError::store_disconnected("read", "store unreachable"));
            }
            if take_fault(&mut inner.read_faults, &key) {
                return Err(SyncError::store("read", format!("injected fault reading {key}")));
            }
            inner.read_stalls.get(&key).copied()
        };

        if let Some(delay) = stall {
            debug!(obj_type, id, ?delay, "Stalling read");
            tokio::time::sleep(delay).await;
        }

        self.inner
            .lock()
            .objects
            .get(obj_type)
            .and_then(|objects| objects.get(id))
            .cloned()
            .ok_or_else(|| SyncError::not_found(obj_type, id))
    }

    async fn write(&self, obj_type: &str, id: &str, derived: &PropertyBag) -> SyncResult<()> {
        let key = ObjectKey::new(obj_type, id);
        let stall = {
            let mut inner = self.inner.lock();
            inner.writes += 1;
            if inner.disconnected {
                return Err(SyncError::store_disconnected("write", "store unreachable"));
            }
            if inner.write_faults > 0 {
                inner.write_faults -= 1;
                return Err(SyncError::store("write", "injected write fault"));
            }
            inner.write_stalls.get(&key).copied()
        };

        if let Some(delay) = stall {
            debug!(obj_type, id, ?delay, "Stalling write");
            tokio::time::sleep(delay).await;
        }

        self.inner.lock().derived.insert(key, derived.clone());
        Ok(())
    }
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<String>,
    inflight: BTreeMap<u64, String>,
}

#[derive(Default)]
struct BusInner {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    connect_faults: u32,
    link_down: bool,
    published: u64,
    dropped: u64,
    acked: u64,
    requeued: u64,
}

/// Notification bus held in memory.
///
/// Clones share the same queues, so a test can keep one handle to publish
/// while the consumer owns another. Messages published to a queue nobody
/// subscribed to yet are dropped, as with an undeclared AMQP queue.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusInner>>,
    notify: Arc<Notify>,
    queue: Option<String>,
}

impl MemoryBus {
    /// Creates a bus with no queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a payload. Returns false if the queue is not declared.
    pub fn publish(&self, queue: &str, payload: impl Into<String>) -> bool {
        let mut inner = self.inner.lock();
        let Some(state) = inner.queues.get_mut(queue) else {
            inner.dropped += 1;
            return false;
        };
        state.ready.push_back(payload.into());
        inner.published += 1;
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Publishes an encoded change event.
    pub fn publish_event(&self, queue: &str, event: &ChangeEvent) -> SyncResult<bool> {
        Ok(self.publish(queue, event.encode()?))
    }

    /// Refuses the next `times` connection attempts.
    pub fn fail_connects(&self, times: u32) {
        self.inner.lock().connect_faults = times;
    }

    /// Drops the link: every call fails until the next successful connect.
    pub fn disconnect(&self) {
        self.inner.lock().link_down = true;
        self.notify.notify_waiters();
    }

    /// Returns the number of messages waiting in a queue.
    pub fn ready_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Returns the number of delivered but unsettled messages in a queue.
    pub fn inflight_len(&self, queue: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(queue)
            .map(|q| q.inflight.len())
            .unwrap_or(0)
    }

    /// Returns the number of acknowledged deliveries.
    pub fn acked(&self) -> u64 {
        self.inner.lock().acked
    }

    /// Returns the number of requeued deliveries.
    pub fn requeued(&self) -> u64 {
        self.inner.lock().requeued
    }

    /// Returns the number of messages dropped for lack of a queue.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    fn subscribed_queue(&self, operation: &str) -> SyncResult<&str> {
        self.queue
            .as_deref()
            .ok_or_else(|| SyncError::bus(operation, "not subscribed"))
    }
}

#[async_trait]
impl NotificationBus for MemoryBus {
    async fn connect(&mut self) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.connect_faults > 0 {
            inner.connect_faults -= 1;
            return Err(SyncError::bus_disconnected("connect", "connection refused"));
        }
        inner.link_down = false;
        Ok(())
    }

    async fn subscribe(&mut self, queue: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.link_down {
            return Err(SyncError::bus_disconnected("subscribe", "link down"));
        }
        let state = inner.queues.entry(queue.to_string()).or_default();
        // Unsettled deliveries of a previous session go back to the head.
        let inflight = std::mem::take(&mut state.inflight);
        for (_, payload) in inflight.into_iter().rev() {
            state.ready.push_front(payload);
        }
        drop(inner);
        self.queue = Some(queue.to_string());
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> SyncResult<Option<Delivery>> {
        let queue = self.subscribed_queue("recv")?.to_string();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.link_down {
                    return Err(SyncError::bus_disconnected("recv", "link down"));
                }
                let tag = inner.next_tag + 1;
                let state = inner.queues.entry(queue.clone()).or_default();
                if let Some(payload) = state.ready.pop_front() {
                    state.inflight.insert(tag, payload.clone());
                    inner.next_tag = tag;
                    return Ok(Some(Delivery::new(tag, payload)));
                }
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, tag: u64) -> SyncResult<()> {
        let queue = self.subscribed_queue("ack")?.to_string();
        let mut inner = self.inner.lock();
        if inner.link_down {
            return Err(SyncError::bus_disconnected("ack", "link down"));
        }
        let removed = inner
            .queues
            .get_mut(&queue)
            .and_then(|q| q.inflight.remove(&tag));
        if removed.is_none() {
            return Err(SyncError::bus("ack", format!("unknown delivery tag {tag}")));
        }
        inner.acked += 1;
        Ok(())
    }

    async fn requeue(&mut self, tag: u64) -> SyncResult<()> {
        let queue = self.subscribed_queue("requeue")?.to_string();
        let mut inner = self.inner.lock();
        if inner.link_down {
            return Err(SyncError::bus_disconnected("requeue", "link down"));
        }
        let Some(state) = inner.queues.get_mut(&queue) else {
            return Err(SyncError::bus("requeue", format!("unknown queue {queue}")));
        };
        let Some(payload) = state.inflight.remove(&tag) else {
            return Err(SyncError::bus("requeue", format!("unknown delivery tag {tag}")));
        };
        state.ready.push_front(payload);
        inner.requeued += 1;
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.queue = None;
        Ok(())
    }
}
