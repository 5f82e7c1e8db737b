//! Queue bridge: document-id messages, publishers and subscribers
//!
//! Messages are `{"document_id": "<uuid>"}`. Delivery is at-least-once: a
//! leased message that is neither finished nor requeued becomes visible again
//! once its visibility timeout expires (or nsqd's message timeout, when
//! consuming from nsqd).

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_nsq::{
    NSQChannel, NSQConsumer, NSQConsumerConfig, NSQConsumerConfigSources, NSQConsumerLookupConfig,
    NSQMessage, NSQRequeueDelay, NSQTopic,
};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{Error, Result};

/// Body of a processing request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub document_id: Uuid,
}

impl QueueMessage {
    pub fn new(document_id: Uuid) -> Self {
        Self { document_id }
    }

    /// JSON payload
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a payload; anything without a valid `document_id` is malformed
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            Error::malformed(format!("{} (payload: {})", e, String::from_utf8_lossy(payload)))
        })
    }
}

/// A leased message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub payload: Vec<u8>,
    /// 1 on first delivery
    pub attempts: u32,
}

/// Publishes raw payloads to a topic
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    fn name(&self) -> &str;
}

/// Leases messages for one consumer channel
#[async_trait]
pub trait QueueSubscriber: Send + Sync {
    /// Lease the next visible message, if any
    async fn receive(&self) -> Result<Option<Delivery>>;

    /// Acknowledge and remove a message
    async fn finish(&self, delivery: &Delivery) -> Result<()>;

    /// Release a message for redelivery after `delay`
    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()>;
}

/// Durable queue stored alongside the documents.
///
/// Each topic has a single consumer group; `channel` only labels logs.
/// Messages delivered `max_attempts` times without being finished are parked
/// as dead instead of being delivered again.
#[derive(Clone)]
pub struct SqliteQueue {
    conn: Arc<Mutex<Connection>>,
    topic: String,
    channel: String,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl SqliteQueue {
    /// Create the queue on an existing connection
    pub fn new(conn: Arc<Mutex<Connection>>, config: &QueueConfig) -> Result<Self> {
        conn.lock()
            .execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS queue_messages (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    topic TEXT NOT NULL,
                    payload BLOB NOT NULL,
                    state TEXT NOT NULL DEFAULT 'ready',
                    attempts INTEGER NOT NULL DEFAULT 0,
                    visible_at INTEGER NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_queue_messages_visible
                    ON queue_messages(topic, state, visible_at);
            "#,
            )
            .map_err(|e| Error::Internal(format!("Failed to create queue table: {}", e)))?;

        Ok(Self {
            conn,
            topic: config.topic.clone(),
            channel: config.channel.clone(),
            visibility_timeout: Duration::from_secs(config.visibility_timeout_secs),
            max_attempts: config.max_attempts.max(1),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Messages waiting or leased on this topic
    pub async fn pending(&self) -> Result<usize> {
        self.count_state("state IN ('ready', 'leased')").await
    }

    /// Messages parked after too many deliveries
    pub async fn dead(&self) -> Result<usize> {
        self.count_state("state = 'dead'").await
    }

    async fn count_state(&self, predicate: &'static str) -> Result<usize> {
        let topic = self.topic.clone();
        self.with_conn(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM queue_messages WHERE topic = ?1 AND {}", predicate);
            let count: i64 = conn.query_row(&sql, params![topic], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| Error::Internal(format!("Task join error: {}", e)))?
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl QueuePublisher for SqliteQueue {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let topic = topic.to_string();
        let payload = payload.to_vec();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO queue_messages (topic, payload, visible_at, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![topic, payload, now_millis(), Utc::now()],
            )?;
            Ok(())
        })
        .await
        .map_err(|e| Error::QueuePublish(e.to_string()))
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl QueueSubscriber for SqliteQueue {
    async fn receive(&self) -> Result<Option<Delivery>> {
        let topic = self.topic.clone();
        let channel = self.channel.clone();
        let lease = millis(self.visibility_timeout);
        let max_attempts = self.max_attempts;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let delivery = loop {
                let now = now_millis();
                let next = tx
                    .query_row(
                        "SELECT id, payload, attempts FROM queue_messages
                         WHERE topic = ?1 AND state IN ('ready', 'leased') AND visible_at <= ?2
                         ORDER BY visible_at, id LIMIT 1",
                        params![topic, now],
                        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?, row.get::<_, u32>(2)?)),
                    )
                    .optional()?;

                let Some((id, payload, attempts)) = next else {
                    break None;
                };

                // An expired lease counts as a failed delivery
                if attempts >= max_attempts {
                    tx.execute("UPDATE queue_messages SET state = 'dead' WHERE id = ?1", params![id])?;
                    tracing::error!(
                        "[{}/{}] Message {} exceeded {} deliveries, parking as dead: {}",
                        topic,
                        channel,
                        id,
                        max_attempts,
                        String::from_utf8_lossy(&payload)
                    );
                    continue;
                }

                tx.execute(
                    "UPDATE queue_messages SET state = 'leased', attempts = attempts + 1, visible_at = ?2
                     WHERE id = ?1",
                    params![id, now.saturating_add(lease)],
                )?;
                break Some(Delivery {
                    id,
                    payload,
                    attempts: attempts + 1,
                });
            };
            tx.commit()?;
            Ok(delivery)
        })
        .await
    }

    async fn finish(&self, delivery: &Delivery) -> Result<()> {
        let id = delivery.id;
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM queue_messages WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let id = delivery.id;
        let visible_at = now_millis().saturating_add(millis(delay));
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE queue_messages SET state = 'ready', visible_at = ?2 WHERE id = ?1",
                params![id, visible_at],
            )?;
            Ok(())
        })
        .await
    }
}

/// Publishes to an `nsqd` instance over its HTTP API
pub struct NsqdPublisher {
    http: reqwest::Client,
    address: String,
}

impl NsqdPublisher {
    /// `address` is the nsqd HTTP address, e.g. `http://127.0.0.1:4151`
    pub fn new(address: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            address: with_http_scheme(address),
        })
    }
}

fn with_http_scheme(address: &str) -> String {
    let address = address.trim().trim_end_matches('/');
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[async_trait]
impl QueuePublisher for NsqdPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/pub", self.address))
            .query(&[("topic", topic)])
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| Error::QueuePublish(format!("nsqd request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::QueuePublish(format!("nsqd returned {}: {}", status, body)));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "nsqd"
    }
}

/// Where an nsqd consumer finds the producers of its topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NsqSource {
    /// nsqlookupd HTTP address, polled for nsqd instances carrying the topic
    Lookup(String),
    /// nsqd TCP address, connected to directly
    Daemon(String),
}

impl NsqSource {
    /// nsqlookupd wins when both are configured
    pub fn from_config(config: &QueueConfig) -> Option<Self> {
        if let Some(address) = &config.nsqlookupd_address {
            return Some(Self::Lookup(with_http_scheme(address)));
        }
        config
            .nsqd_tcp_address
            .as_ref()
            .map(|address| Self::Daemon(address.trim().to_string()))
    }
}

/// Consumes a topic/channel from nsqd.
///
/// Deliveries stay in flight on the nsqd side until finished or requeued.
/// nsqd counts attempts itself; a message seen more than `max_attempts` times
/// is finished and dropped with an error log instead of being handed out.
pub struct NsqdSubscriber {
    consumer: tokio::sync::Mutex<NSQConsumer>,
    in_flight: Mutex<HashMap<i64, NSQMessage>>,
    next_id: AtomicI64,
    topic: String,
    channel: String,
    wait: Duration,
    max_attempts: u32,
}

impl NsqdSubscriber {
    /// Start consuming `config.topic` on `config.channel`
    pub fn connect(config: &QueueConfig) -> Result<Self> {
        let source = NsqSource::from_config(config).ok_or_else(|| {
            Error::Config(
                "queue.nsqlookupd_address or queue.nsqd_tcp_address is required to consume from nsqd".into(),
            )
        })?;
        let topic = NSQTopic::new(config.topic.clone())
            .ok_or_else(|| Error::Config(format!("Invalid NSQ topic name '{}'", config.topic)))?;
        let channel = NSQChannel::new(config.channel.clone())
            .ok_or_else(|| Error::Config(format!("Invalid NSQ channel name '{}'", config.channel)))?;

        let sources = match &source {
            NsqSource::Lookup(address) => NSQConsumerConfigSources::Lookup(
                NSQConsumerLookupConfig::new().set_addresses(HashSet::from([address.clone()])),
            ),
            NsqSource::Daemon(address) => NSQConsumerConfigSources::Daemons(vec![address.clone()]),
        };
        let consumer = NSQConsumerConfig::new(topic, channel)
            .set_max_in_flight(config.max_in_flight.max(1))
            .set_sources(sources)
            .build();

        tracing::info!(
            "[{}/{}] Consuming from nsqd via {:?} (max in flight {})",
            config.topic,
            config.channel,
            source,
            config.max_in_flight
        );

        Ok(Self {
            consumer: tokio::sync::Mutex::new(consumer),
            in_flight: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            topic: config.topic.clone(),
            channel: config.channel.clone(),
            wait: Duration::from_millis(config.poll_interval_ms.max(1)),
            max_attempts: config.max_attempts.max(1),
        })
    }

    fn take(&self, delivery: &Delivery) -> Result<NSQMessage> {
        self.in_flight.lock().remove(&delivery.id).ok_or_else(|| {
            Error::Internal(format!(
                "[{}/{}] Delivery {} is not in flight",
                self.topic, self.channel, delivery.id
            ))
        })
    }
}

#[async_trait]
impl QueueSubscriber for NsqdSubscriber {
    async fn receive(&self) -> Result<Option<Delivery>> {
        let mut consumer = self.consumer.lock().await;
        loop {
            let message = match tokio::time::timeout(self.wait, consumer.consume_filtered()).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    return Err(Error::Internal(format!(
                        "[{}/{}] nsqd consumer closed",
                        self.topic, self.channel
                    )))
                }
                Err(_) => return Ok(None),
            };

            let attempts = u32::from(message.attempt);
            if attempts > self.max_attempts {
                tracing::error!(
                    "[{}/{}] Message exceeded {} deliveries, dropping: {}",
                    self.topic,
                    self.channel,
                    self.max_attempts,
                    String::from_utf8_lossy(&message.body)
                );
                message.finish().await;
                continue;
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let payload = message.body.clone();
            self.in_flight.lock().insert(id, message);
            return Ok(Some(Delivery { id, payload, attempts }));
        }
    }

    async fn finish(&self, delivery: &Delivery) -> Result<()> {
        let message = self.take(delivery)?;
        message.finish().await;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let message = self.take(delivery)?;
        message.requeue(NSQRequeueDelay::CustomDelay(delay)).await;
        Ok(())
    }
}

/// Enqueues documents for background processing
#[derive(Clone)]
pub struct DocumentPublisher {
    publisher: Arc<dyn QueuePublisher>,
    topic: String,
}

impl DocumentPublisher {
    pub fn new(publisher: Arc<dyn QueuePublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    /// Publish a processing request. Every failure is a `QueuePublish` error.
    pub async fn enqueue(&self, document_id: Uuid) -> Result<()> {
        let payload = QueueMessage::new(document_id)
            .encode()
            .map_err(|e| Error::QueuePublish(e.to_string()))?;

        match self.publisher.publish(&self.topic, &payload).await {
            Ok(()) => {
                tracing::info!(
                    "[{}] Enqueued on '{}' via {}",
                    document_id,
                    self.topic,
                    self.publisher.name()
                );
                Ok(())
            }
            Err(Error::QueuePublish(message)) => Err(Error::QueuePublish(message)),
            Err(e) => Err(Error::QueuePublish(e.to_string())),
        }
    }
}
