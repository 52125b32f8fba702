//! Redis Streams-backed event bus (durable, at-least-once delivery).
//!
//! ## Layout
//!
//! - **Stream per topic**: `{prefix}:{topic}`, e.g. `storefront:order-placed`
//! - **Consumer group per service**: `order-service`, `product-service`
//! - **Consumer per worker**: `{group}-{uuid}`
//! - **Dead-letter stream**: `{prefix}:dead-letters`
//!
//! ## Delivery
//!
//! `fetch` serves, in this order: entries already delivered to this consumer
//! but not acknowledged, entries idle longer than `pending_timeout` in another
//! consumer of the group (claimed via XCLAIM), then new entries (XREADGROUP
//! `>`). `commit` is XACK. An entry that is never acknowledged is therefore
//! handed out again, which is what the subscription worker relies on.
//!
//! Entries that cannot be turned into an envelope are copied to the
//! dead-letter stream, with their raw fields, before they are acknowledged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::Value;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use storefront_events::{
    Consumer, DeadLetter, DeadLetterSink, Delivery, DeliveryTag, EventBus, EventEnvelope, Producer,
    Topic,
};

/// Default stream key prefix
const DEFAULT_STREAM_PREFIX: &str = "storefront";

/// Default pending entry timeout (entries idle longer are claimed by another consumer)
const DEFAULT_PENDING_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Command(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("delivery tag {0:?} was not issued by Redis Streams")]
    ForeignTag(DeliveryTag),
}

#[derive(Debug, Clone)]
pub struct RedisStreamsEventBus {
    client: Arc<redis::Client>,
    stream_prefix: String,
    dlq_key: String,
    pending_timeout_ms: u64,
}

impl RedisStreamsEventBus {
    /// Create a new Redis Streams event bus.
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `stream_prefix` - key prefix shared by all topic streams (default: "storefront")
    pub fn new(
        redis_url: impl AsRef<str>,
        stream_prefix: Option<String>,
    ) -> Result<Self, RedisStreamsError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))?;
        let stream_prefix = stream_prefix.unwrap_or_else(|| DEFAULT_STREAM_PREFIX.to_string());

        Ok(Self {
            client: Arc::new(client),
            dlq_key: format!("{stream_prefix}:dead-letters"),
            stream_prefix,
            pending_timeout_ms: DEFAULT_PENDING_TIMEOUT_MS,
        })
    }

    pub fn with_pending_timeout(mut self, timeout: Duration) -> Self {
        self.pending_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn stream_key(&self, topic: Topic) -> String {
        format!("{}:{}", self.stream_prefix, topic)
    }

    pub fn dlq_key(&self) -> &str {
        &self.dlq_key
    }

    fn connection(&self) -> Result<redis::Connection, RedisStreamsError> {
        self.client
            .get_connection()
            .map_err(|e| RedisStreamsError::Connection(e.to_string()))
    }

    /// Ensure a consumer group exists on a topic stream (idempotent).
    pub fn ensure_consumer_group(&self, group: &str, topic: Topic) -> Result<(), RedisStreamsError> {
        let mut conn = self.connection()?;

        // MKSTREAM creates the stream; "0" lets a new group see existing history.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(self.stream_key(topic))
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query(&mut conn);

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(RedisStreamsError::Command(format!("XGROUP CREATE failed: {}", e))),
        }
    }
}

impl Producer for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    /// XADD returns once Redis has appended the entry.
    #[instrument(
        skip(self, envelope),
        fields(topic = %envelope.topic(), event_id = %envelope.event_id()),
        err
    )]
    fn emit(&self, envelope: EventEnvelope) -> Result<(), Self::Error> {
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(envelope.topic()))
            .arg("*")
            .arg("event_id")
            .arg(envelope.event_id().to_string())
            .arg("event_name")
            .arg(envelope.event_name())
            .arg("occurred_at")
            .arg(envelope.occurred_at().to_rfc3339())
            .arg("payload")
            .arg(envelope.payload())
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("XADD failed: {}", e)))?;

        Ok(())
    }
}

impl EventBus for RedisStreamsEventBus {
    type Consumer = RedisStreamsConsumer;

    fn subscribe(&self, group: &str, topic: Topic) -> Result<Self::Consumer, Self::Error> {
        self.ensure_consumer_group(group, topic)?;

        Ok(RedisStreamsConsumer {
            stream_key: self.stream_key(topic),
            bus: self.clone(),
            group: group.to_string(),
            consumer: format!("{}-{}", group, Uuid::now_v7()),
            topic,
            conn: None,
            seen: HashMap::new(),
        })
    }
}

impl DeadLetterSink for RedisStreamsEventBus {
    type Error = RedisStreamsError;

    fn divert(&self, letter: DeadLetter) -> Result<(), Self::Error> {
        let mut conn = self.connection()?;

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq_key)
            .arg("*")
            .arg("group")
            .arg(&letter.group)
            .arg("topic")
            .arg(letter.envelope.topic().as_str())
            .arg("event_id")
            .arg(letter.envelope.event_id().to_string())
            .arg("event_name")
            .arg(letter.envelope.event_name())
            .arg("reason")
            .arg(letter.reason.kind())
            .arg("detail")
            .arg(letter.reason.detail())
            .arg("attempts")
            .arg(letter.attempts.to_string())
            .arg("failed_at")
            .arg(letter.failed_at.to_rfc3339())
            .arg("payload")
            .arg(letter.envelope.payload())
            .query(&mut conn)
            .map_err(|e| RedisStreamsError::Command(format!("DLQ XADD failed: {}", e)))?;

        warn!(
            group = %letter.group,
            event_id = %letter.envelope.event_id(),
            reason = letter.reason.kind(),
            attempts = letter.attempts,
            "Message sent to dead-letter stream"
        );
        Ok(())
    }
}

/// One consumer within a group, reading a single topic stream.
pub struct RedisStreamsConsumer {
    bus: RedisStreamsEventBus,
    stream_key: String,
    group: String,
    consumer: String,
    topic: Topic,
    conn: Option<redis::Connection>,
    /// Local delivery counts for entries not yet acknowledged.
    seen: HashMap<String, u32>,
}

impl std::fmt::Debug for RedisStreamsConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsConsumer")
            .field("stream_key", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

/// Entry as read from a stream, before it is turned into a `Delivery`.
#[derive(Debug, Clone, PartialEq)]
struct StreamEntry {
    id: String,
    /// `None` when the entry was trimmed from the stream while still pending.
    fields: Option<HashMap<String, Vec<u8>>>,
}

impl RedisStreamsConsumer {
    fn with_conn<T>(
        &mut self,
        f: impl FnOnce(&mut redis::Connection, &Self) -> redis::RedisResult<T>,
        what: &str,
    ) -> Result<T, RedisStreamsError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.bus.connection()?,
        };

        match f(&mut conn, self) {
            Ok(value) => {
                self.conn = Some(conn);
                Ok(value)
            }
            Err(e) => {
                // Drop the connection on IO trouble; the next call reconnects.
                if !e.is_io_error() {
                    self.conn = Some(conn);
                }
                Err(RedisStreamsError::Command(format!("{} failed: {}", what, e)))
            }
        }
    }

    /// Entries delivered to this consumer earlier but never acknowledged.
    fn read_own_pending(&mut self) -> Result<Option<StreamEntry>, RedisStreamsError> {
        let reply: Value = self.with_conn(
            |conn, me| {
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(&me.group)
                    .arg(&me.consumer)
                    .arg("COUNT")
                    .arg(1)
                    .arg("STREAMS")
                    .arg(&me.stream_key)
                    .arg("0")
                    .query(conn)
            },
            "XREADGROUP (pending)",
        )?;
        Ok(parse_read_reply(reply)?.into_iter().next())
    }

    /// Claim one entry that another consumer left idle too long.
    fn claim_stale(&mut self) -> Result<Option<StreamEntry>, RedisStreamsError> {
        let min_idle = self.bus.pending_timeout_ms;
        let pending: Value = self.with_conn(
            |conn, me| {
                redis::cmd("XPENDING")
                    .arg(&me.stream_key)
                    .arg(&me.group)
                    .arg("IDLE")
                    .arg(min_idle)
                    .arg("-")
                    .arg("+")
                    .arg(1)
                    .query(conn)
            },
            "XPENDING",
        )?;

        let Some((id, _)) = parse_pending_reply(pending)?.into_iter().next() else {
            return Ok(None);
        };

        let claimed: Value = self.with_conn(
            |conn, me| {
                redis::cmd("XCLAIM")
                    .arg(&me.stream_key)
                    .arg(&me.group)
                    .arg(&me.consumer)
                    .arg(min_idle)
                    .arg(&id)
                    .query(conn)
            },
            "XCLAIM",
        )?;
        Ok(parse_entries(claimed)?.into_iter().next())
    }

    fn read_new(&mut self, block: Duration) -> Result<Option<StreamEntry>, RedisStreamsError> {
        // BLOCK 0 would wait forever.
        let block_ms = (block.as_millis() as u64).max(1);
        let reply: Value = self.with_conn(
            |conn, me| {
                redis::cmd("XREADGROUP")
                    .arg("GROUP")
                    .arg(&me.group)
                    .arg(&me.consumer)
                    .arg("COUNT")
                    .arg(1)
                    .arg("BLOCK")
                    .arg(block_ms)
                    .arg("STREAMS")
                    .arg(&me.stream_key)
                    .arg(">")
                    .query(conn)
            },
            "XREADGROUP",
        )?;
        Ok(parse_read_reply(reply)?.into_iter().next())
    }

    /// Delivery count Redis keeps for one pending entry.
    fn delivery_count(&mut self, id: &str) -> Result<u32, RedisStreamsError> {
        let reply: Value = self.with_conn(
            |conn, me| {
                redis::cmd("XPENDING")
                    .arg(&me.stream_key)
                    .arg(&me.group)
                    .arg(id)
                    .arg(id)
                    .arg(1)
                    .query(conn)
            },
            "XPENDING",
        )?;
        Ok(parse_pending_reply(reply)?
            .into_iter()
            .next()
            .map(|(_, count)| count)
            .unwrap_or(1))
    }

    fn ack(&mut self, id: &str) -> Result<(), RedisStreamsError> {
        let _: i64 = self.with_conn(
            |conn, me| {
                redis::cmd("XACK")
                    .arg(&me.stream_key)
                    .arg(&me.group)
                    .arg(id)
                    .query(conn)
            },
            "XACK",
        )?;
        self.seen.remove(id);
        Ok(())
    }

    /// Write an entry that cannot become a delivery to the dead-letter stream.
    fn park_unreadable(&mut self, fields: Vec<(String, Vec<u8>)>) -> Result<(), RedisStreamsError> {
        let _: String = self.with_conn(
            |conn, me| {
                let mut cmd = redis::cmd("XADD");
                cmd.arg(&me.bus.dlq_key).arg("*");
                for (key, value) in &fields {
                    cmd.arg(key).arg(value.as_slice());
                }
                cmd.query(conn)
            },
            "DLQ XADD",
        )?;
        Ok(())
    }

    fn deliver(&mut self, entry: StreamEntry) -> Result<Option<Delivery>, RedisStreamsError> {
        let Some(fields) = entry.fields else {
            warn!(stream = %self.stream_key, entry_id = %entry.id, "pending entry no longer in stream, dead-lettering");
            let letter = unreadable_entry_fields(
                &self.group,
                self.topic,
                &entry.id,
                None,
                "entry trimmed from stream while pending",
                Utc::now(),
            );
            // Not acknowledged unless parked; the entry comes back on the next fetch.
            self.park_unreadable(letter)?;
            self.ack(&entry.id)?;
            return Ok(None);
        };

        let envelope = match envelope_from_fields(self.topic, &fields) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(stream = %self.stream_key, entry_id = %entry.id, error = %e, "unreadable stream entry, dead-lettering");
                let letter = unreadable_entry_fields(
                    &self.group,
                    self.topic,
                    &entry.id,
                    Some(&fields),
                    &e.to_string(),
                    Utc::now(),
                );
                self.park_unreadable(letter)?;
                self.ack(&entry.id)?;
                return Ok(None);
            }
        };

        let local = self.seen.entry(entry.id.clone()).or_insert(0);
        *local += 1;
        let local = *local;
        let attempt = self.delivery_count(&entry.id)?.max(local);

        Ok(Some(Delivery {
            envelope,
            tag: DeliveryTag::Entry(entry.id),
            attempt,
        }))
    }
}

impl Consumer for RedisStreamsConsumer {
    type Error = RedisStreamsError;

    fn fetch(&mut self, timeout: Duration) -> Result<Option<Delivery>, Self::Error> {
        if let Some(entry) = self.read_own_pending()? {
            return self.deliver(entry);
        }
        if let Some(entry) = self.claim_stale()? {
            return self.deliver(entry);
        }
        match self.read_new(timeout)? {
            Some(entry) => self.deliver(entry),
            None => Ok(None),
        }
    }

    fn commit(&mut self, delivery: &Delivery) -> Result<(), Self::Error> {
        match &delivery.tag {
            DeliveryTag::Entry(id) => self.ack(id),
            other => Err(RedisStreamsError::ForeignTag(other.clone())),
        }
    }

    fn topic(&self) -> Topic {
        self.topic
    }
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).to_string()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// `[[stream_key, [entry, ...]], ...]`, or nil when BLOCK timed out.
fn parse_read_reply(reply: Value) -> Result<Vec<StreamEntry>, RedisStreamsError> {
    let streams = match reply {
        Value::Nil => return Ok(vec![]),
        Value::Bulk(streams) => streams,
        _ => return Err(RedisStreamsError::Deserialization("Invalid XREADGROUP reply".to_string())),
    };

    let mut entries = Vec::new();
    for stream in streams {
        let Value::Bulk(mut parts) = stream else {
            return Err(RedisStreamsError::Deserialization("Invalid stream section".to_string()));
        };
        if parts.len() != 2 {
            return Err(RedisStreamsError::Deserialization("Stream section too short".to_string()));
        }
        entries.extend(parse_entries(parts.remove(1))?);
    }
    Ok(entries)
}

/// `[[id, [field, value, ...] | nil], ...]`
fn parse_entries(reply: Value) -> Result<Vec<StreamEntry>, RedisStreamsError> {
    let raw = match reply {
        Value::Nil => return Ok(vec![]),
        Value::Bulk(raw) => raw,
        _ => return Err(RedisStreamsError::Deserialization("Invalid entry list".to_string())),
    };

    raw.into_iter()
        .filter(|entry| !matches!(entry, Value::Nil))
        .map(|entry| {
            let Value::Bulk(parts) = entry else {
                return Err(RedisStreamsError::Deserialization("Invalid entry format".to_string()));
            };
            let id = parts
                .first()
                .and_then(as_string)
                .ok_or_else(|| RedisStreamsError::Deserialization("Invalid message ID format".to_string()))?;

            let fields = match parts.get(1) {
                Some(Value::Bulk(kv)) => {
                    let mut fields = HashMap::new();
                    for chunk in kv.chunks(2) {
                        if let [key, Value::Data(value)] = chunk {
                            if let Some(key) = as_string(key) {
                                fields.insert(key, value.clone());
                            }
                        }
                    }
                    Some(fields)
                }
                None | Some(Value::Nil) => None,
                Some(_) => {
                    return Err(RedisStreamsError::Deserialization("Invalid fields format".to_string()));
                }
            };

            Ok(StreamEntry { id, fields })
        })
        .collect()
}

/// Extended XPENDING reply: `[[id, consumer, idle_ms, delivery_count], ...]`.
fn parse_pending_reply(reply: Value) -> Result<Vec<(String, u32)>, RedisStreamsError> {
    let rows = match reply {
        Value::Nil => return Ok(vec![]),
        Value::Bulk(rows) => rows,
        _ => return Err(RedisStreamsError::Deserialization("Invalid XPENDING reply".to_string())),
    };

    rows.into_iter()
        .map(|row| match row {
            Value::Bulk(cols) if cols.len() == 4 => {
                let id = as_string(&cols[0])
                    .ok_or_else(|| RedisStreamsError::Deserialization("Invalid pending id".to_string()))?;
                let count = match &cols[3] {
                    Value::Int(n) => u32::try_from(*n).unwrap_or(u32::MAX),
                    _ => return Err(RedisStreamsError::Deserialization("Invalid delivery count".to_string())),
                };
                Ok((id, count))
            }
            _ => Err(RedisStreamsError::Deserialization("Invalid pending row".to_string())),
        })
        .collect()
}

fn envelope_from_fields(
    topic: Topic,
    fields: &HashMap<String, Vec<u8>>,
) -> Result<EventEnvelope, RedisStreamsError> {
    let text = |key: &str| -> Result<String, RedisStreamsError> {
        let raw = fields
            .get(key)
            .ok_or_else(|| RedisStreamsError::Deserialization(format!("Missing {} field", key)))?;
        String::from_utf8(raw.clone())
            .map_err(|_| RedisStreamsError::Deserialization(format!("{} is not UTF-8", key)))
    };

    let event_id = Uuid::parse_str(&text("event_id")?)
        .map_err(|e| RedisStreamsError::Deserialization(format!("Invalid event_id: {}", e)))?;
    let occurred_at = DateTime::parse_from_rfc3339(&text("occurred_at")?)
        .map_err(|e| RedisStreamsError::Deserialization(format!("Invalid occurred_at: {}", e)))?
        .with_timezone(&Utc);
    let payload = fields
        .get("payload")
        .cloned()
        .ok_or_else(|| RedisStreamsError::Deserialization("Missing payload field".to_string()))?;

    Ok(EventEnvelope::new(event_id, topic, text("event_name")?, payload, occurred_at))
}

/// Dead-letter stream fields for an entry that never became an envelope.
///
/// The entry's own fields are kept verbatim under `raw.{name}`, sorted by name.
fn unreadable_entry_fields(
    group: &str,
    topic: Topic,
    entry_id: &str,
    fields: Option<&HashMap<String, Vec<u8>>>,
    detail: &str,
    failed_at: DateTime<Utc>,
) -> Vec<(String, Vec<u8>)> {
    let mut out: Vec<(String, Vec<u8>)> = vec![
        ("group".to_string(), group.as_bytes().to_vec()),
        ("topic".to_string(), topic.as_str().as_bytes().to_vec()),
        ("entry_id".to_string(), entry_id.as_bytes().to_vec()),
        ("reason".to_string(), b"decode".to_vec()),
        ("detail".to_string(), detail.as_bytes().to_vec()),
        ("attempts".to_string(), b"1".to_vec()),
        ("failed_at".to_string(), failed_at.to_rfc3339().into_bytes()),
    ];

    if let Some(fields) = fields {
        let mut raw: Vec<_> = fields.iter().collect();
        raw.sort_by(|a, b| a.0.cmp(b.0));
        out.extend(raw.into_iter().map(|(k, v)| (format!("raw.{k}"), v.clone())));
    }
    out
}
