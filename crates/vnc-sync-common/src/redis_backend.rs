//! Redis store and queue backends.
//!
//! Layout in the config database:
//!
//! - `<type>|<id>`: one hash per config object, each property value JSON
//!   encoded.
//! - `<type>_DERIVED|<id>`: derived state written back by the engine.
//! - `<queue>`: list of encoded change events, produced with `RPUSH`.
//! - `<queue>:inflight`: deliveries taken but not settled yet.
//!
//! Deliveries are moved atomically from the queue into the in-flight list
//! with `BLMOVE`, so a crash between receive and ack leaves the message in
//! Redis. `subscribe` moves leftover in-flight messages back to the head.

use crate::bus::{Delivery, NotificationBus};
use crate::error::{SyncError, SyncResult};
use crate::store::ConfigStore;
use crate::types::{ObjectId, PropertyBag};
use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Direction, RedisError};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Suffix of the type name under which derived state is stored.
pub const DERIVED_SUFFIX: &str = "_DERIVED";

/// Redis database selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RedisDb {
    /// Config objects and queues.
    ConfigDb,
    /// An explicit database number.
    Number(u32),
}

impl RedisDb {
    fn number(&self) -> u32 {
        match self {
            RedisDb::ConfigDb => 4,
            RedisDb::Number(n) => *n,
        }
    }
}

/// Configuration for a Redis connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisConfig {
    /// Redis server hostname or IP
    pub host: String,
    /// Redis server port
    pub port: u16,
    /// Database selector
    pub db: RedisDb,
    /// Time allowed to establish the connection
    pub connect_timeout: Duration,
}

impl RedisConfig {
    /// Creates a new Redis configuration.
    pub fn new(host: impl Into<String>, port: u16, db: RedisDb) -> Self {
        Self {
            host: host.into(),
            port,
            db,
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Creates a config database connection config.
    pub fn config_db(host: impl Into<String>, port: u16) -> Self {
        Self::new(host, port, RedisDb::ConfigDb)
    }

    /// Builds a config from the `[database]` section.
    pub fn from_config(config: &crate::config::DatabaseConfig) -> Self {
        Self {
            host: config.redis_host.clone(),
            port: config.redis_port,
            db: RedisDb::Number(config.config_db_number),
            connect_timeout: Duration::from_secs(config.connection_timeout_secs),
        }
    }

    /// Returns the Redis connection URI.
    pub fn uri(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db.number())
    }

    async fn open(
        &self,
        operation: &str,
        to_error: fn(&str, RedisError) -> SyncError,
    ) -> SyncResult<ConnectionManager> {
        let uri = self.uri();
        let client = redis::Client::open(uri.clone())
            .map_err(|e| SyncError::invalid_config("database", format!("{uri}: {e}")))?;

        let connection = tokio::time::timeout(self.connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                SyncError::timeout(
                    operation,
                    u64::try_from(self.connect_timeout.as_millis()).unwrap_or(u64::MAX),
                )
            })?
            .map_err(|e| to_error(operation, e))?;

        info!(host = %self.host, port = self.port, db = self.db.number(), "Connected to Redis");
        Ok(connection)
    }
}

fn is_link_failure(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal()
}

fn store_error(operation: &str, e: RedisError) -> SyncError {
    if e.is_timeout() {
        SyncError::timeout(operation, 0)
    } else if is_link_failure(&e) {
        SyncError::store_disconnected(operation, e.to_string())
    } else {
        SyncError::store(operation, e.to_string())
    }
}

fn bus_error(operation: &str, e: RedisError) -> SyncError {
    if e.is_timeout() {
        SyncError::timeout(operation, 0)
    } else if is_link_failure(&e) {
        SyncError::bus_disconnected(operation, e.to_string())
    } else {
        SyncError::bus(operation, e.to_string())
    }
}

fn object_key(obj_type: &str, id: &str) -> String {
    format!("{obj_type}|{id}")
}

fn derived_key(obj_type: &str, id: &str) -> String {
    format!("{obj_type}{DERIVED_SUFFIX}|{id}")
}

fn inflight_key(queue: &str) -> String {
    format!("{queue}:inflight")
}

/// Encodes a property bag as hash fields with JSON values.
fn encode_fields(bag: &PropertyBag) -> Vec<(String, String)> {
    bag.iter()
        .map(|(field, value)| (field.clone(), value.to_string()))
        .collect()
}

/// Decodes hash fields into a property bag. Values that are not valid JSON
/// are kept as plain strings.
fn decode_fields(fields: HashMap<String, String>) -> PropertyBag {
    fields
        .into_iter()
        .map(|(field, value)| {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            (field, value)
        })
        .collect()
}

/// Config store backed by Redis hashes.
pub struct RedisStore {
    config: RedisConfig,
    connection: Mutex<Option<ConnectionManager>>,
}

impl RedisStore {
    /// Creates a store; the connection is opened by `connect`.
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            connection: Mutex::new(None),
        }
    }

    /// Returns the connection configuration.
    pub fn config(&self) -> &RedisConfig {
        &self.config
    }

    fn connection(&self, operation: &str) -> SyncResult<ConnectionManager> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| SyncError::store_disconnected(operation, "not connected"))
    }

    /// Reads every `<prefix>|<id>` hash.
    async fn list_hashes(
        &self,
        operation: &str,
        prefix: &str,
    ) -> SyncResult<Vec<(ObjectId, PropertyBag)>> {
        let mut conn = self.connection(operation)?;
        let pattern = format!("{prefix}|*");
        let keys: Vec<String> = conn
            .keys(&pattern)
            .await
            .map_err(|e| store_error(operation, e))?;

        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let Some((_, id)) = key.split_once('|') else {
                continue;
            };
            let fields: HashMap<String, String> = conn
                .hgetall(&key)
                .await
                .map_err(|e| store_error(operation, e))?;
            // Deleted between KEYS and HGETALL.
            if fields.is_empty() {
                continue;
            }
            objects.push((id.to_string(), decode_fields(fields)));
        }
        Ok(objects)
    }

    /// Writes an object body (used by tooling and tests).
    pub async fn put(&self, obj_type: &str, id: &str, raw: &PropertyBag) -> SyncResult<()> {
        let mut conn = self.connection("put")?;
        let key = object_key(obj_type, id);
        let fields = encode_fields(raw);
        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(&key, &fields).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| store_error("put", e))
    }
}

#[async_trait]
impl ConfigStore for RedisStore {
    async fn connect(&self) -> SyncResult<()> {
        if self.connection.lock().is_some() {
            return Ok(());
        }
        let connection = self.config.open("connect", store_error).await?;
        *self.connection.lock() = Some(connection);
        Ok(())
    }

    async fn list(&self, obj_type: &str) -> SyncResult<Vec<(ObjectId, PropertyBag)>> {
        let objects = self.list_hashes("list", obj_type).await?;
        debug!(obj_type, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn list_derived(&self, obj_type: &str) -> SyncResult<Vec<(ObjectId, PropertyBag)>> {
        let derived_type = format!("{obj_type}{DERIVED_SUFFIX}");
        let derived = self.list_hashes("list_derived", &derived_type).await?;
        debug!(obj_type, count = derived.len(), "Listed derived state");
        Ok(derived)
    }

    async fn read(&self, obj_type: &str, id: &str) -> SyncResult<PropertyBag> {
        let mut conn = self.connection("read")?;
        let fields: HashMap<String, String> = conn
            .hgetall(object_key(obj_type, id))
            .await
            .map_err(|e| store_error("read", e))?;
        if fields.is_empty() {
            return Err(SyncError::not_found(obj_type, id));
        }
        Ok(decode_fields(fields))
    }

    async fn write(&self, obj_type: &str, id: &str, derived: &PropertyBag) -> SyncResult<()> {
        let mut conn = self.connection("write")?;
        let key = derived_key(obj_type, id);
        let fields = encode_fields(derived);

        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        if !fields.is_empty() {
            pipe.hset_multiple(&key, &fields).ignore();
        }
        pipe.query_async::<()>(&mut conn)
            .await
            .map_err(|e| store_error("write", e))
    }
}

/// Reliable change queue backed by Redis lists.
pub struct RedisBus {
    config: RedisConfig,
    connection: Option<ConnectionManager>,
    queue: Option<String>,
    inflight: HashMap<u64, String>,
    next_tag: u64,
}

impl RedisBus {
    /// Creates a bus; the connection is opened by `connect`.
    pub fn new(config: RedisConfig) -> Self {
        Self {
            config,
            connection: None,
            queue: None,
            inflight: HashMap::new(),
            next_tag: 0,
        }
    }

    fn connection(&self, operation: &str) -> SyncResult<ConnectionManager> {
        self.connection
            .clone()
            .ok_or_else(|| SyncError::bus_disconnected(operation, "not connected"))
    }

    fn queue(&self, operation: &str) -> SyncResult<String> {
        self.queue
            .clone()
            .ok_or_else(|| SyncError::bus(operation, "not subscribed"))
    }

    /// Appends an encoded event to a queue.
    pub async fn publish(&mut self, queue: &str, payload: &str) -> SyncResult<()> {
        let mut conn = self.connection("publish")?;
        conn.rpush::<_, _, ()>(queue, payload)
            .await
            .map_err(|e| bus_error("publish", e))
    }

    fn settle(&mut self, operation: &str, tag: u64) -> SyncResult<String> {
        self.inflight
            .remove(&tag)
            .ok_or_else(|| SyncError::bus(operation, format!("unknown delivery tag {tag}")))
    }
}

#[async_trait]
impl NotificationBus for RedisBus {
    async fn connect(&mut self) -> SyncResult<()> {
        let connection = self.config.open("connect", bus_error).await?;
        self.connection = Some(connection);
        Ok(())
    }

    async fn subscribe(&mut self, queue: &str) -> SyncResult<()> {
        let mut conn = self.connection("subscribe")?;
        let inflight = inflight_key(queue);

        let mut restored = 0usize;
        loop {
            let moved: Option<String> = conn
                .lmove(&inflight, queue, Direction::Right, Direction::Left)
                .await
                .map_err(|e| bus_error("subscribe", e))?;
            if moved.is_none() {
                break;
            }
            restored += 1;
        }
        if restored > 0 {
            info!(queue, restored, "Restored unsettled deliveries");
        }

        self.inflight.clear();
        self.queue = Some(queue.to_string());
        Ok(())
    }

    async fn recv(&mut self, timeout: Duration) -> SyncResult<Option<Delivery>> {
        let queue = self.queue("recv")?;
        let mut conn = self.connection("recv")?;
        // BLMOVE treats 0 as "block forever".
        let secs = timeout.as_secs_f64().max(0.001);

        let payload: Option<String> = conn
            .blmove(&queue, inflight_key(&queue), Direction::Left, Direction::Right, secs)
            .await
            .map_err(|e| bus_error("recv", e))?;

        Ok(payload.map(|payload| {
            self.next_tag += 1;
            self.inflight.insert(self.next_tag, payload.clone());
            Delivery::new(self.next_tag, payload)
        }))
    }

    async fn ack(&mut self, tag: u64) -> SyncResult<()> {
        let queue = self.queue("ack")?;
        let mut conn = self.connection("ack")?;
        let payload = self.settle("ack", tag)?;
        conn.lrem::<_, _, ()>(inflight_key(&queue), 1, &payload)
            .await
            .map_err(|e| bus_error("ack", e))
    }

    async fn requeue(&mut self, tag: u64) -> SyncResult<()> {
        let queue = self.queue("requeue")?;
        let mut conn = self.connection("requeue")?;
        let payload = self.settle("requeue", tag)?;
        redis::pipe()
            .atomic()
            .lrem(inflight_key(&queue), 1, &payload)
            .ignore()
            .lpush(&queue, &payload)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| bus_error("requeue", e))
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.queue = None;
        self.connection = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_uri() {
        let config = RedisConfig::config_db("127.0.0.1", 6379);
        assert_eq!(config.uri(), "redis://127.0.0.1:6379/4");

        let config = RedisConfig::new("db", 6380, RedisDb::Number(7));
        assert_eq!(config.uri(), "redis://db:6380/7");
    }

    #[test]
    fn test_key_layout() {
        assert_eq!(object_key("routing_instance", "ri-1"), "routing_instance|ri-1");
        assert_eq!(
            derived_key("routing_instance", "ri-1"),
            "routing_instance_DERIVED|ri-1"
        );
        assert_eq!(inflight_key("vnc_config.object-update"), "vnc_config.object-update:inflight");
    }

    #[test]
    fn test_field_encoding() {
        let bag: PropertyBag = match json!({
            "route_target_refs": [{"uuid": "rt-1"}],
            "display_name": "ri",
            "vxlan_id": 5
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };

        let fields: HashMap<String, String> = encode_fields(&bag).into_iter().collect();
        assert_eq!(fields["display_name"], "\"ri\"");
        assert_eq!(decode_fields(fields), bag);

        // Plain values written by other tools stay strings.
        let plain = HashMap::from([("name".to_string(), "target:64512:1".to_string())]);
        assert_eq!(decode_fields(plain)["name"], json!("target:64512:1"));
    }
}
