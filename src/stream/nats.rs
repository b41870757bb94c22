//! NATS JetStream stream gateway
//!
//! Production backend: the `EVENTS` and `DLQ` streams live on JetStream,
//! which provides the monotonic sequences, ack-wait redelivery, and durable
//! consumer bookkeeping the hub relies on.

use super::{
    ConsumerSpec, MessageAck, PendingMessage, StoredEntry, StreamConsumer, StreamGateway,
    StreamKind, StreamStats,
};
use crate::config::{NatsConfig, StreamConfig};
use crate::error::{HubError, Result};
use crate::types::StartFrom;
use async_nats::jetstream;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::Mutex;

/// JetStream-backed gateway
pub struct NatsGateway {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    events: Mutex<jetstream::stream::Stream>,
    dlq: Mutex<jetstream::stream::Stream>,
    request_timeout: Duration,
}

impl NatsGateway {
    /// Connect to NATS and ensure both streams exist
    pub async fn connect(nats: &NatsConfig, stream: &StreamConfig) -> Result<Self> {
        let mut opts = async_nats::ConnectOptions::new()
            .connection_timeout(Duration::from_secs(nats.connect_timeout_secs))
            .request_timeout(Some(Duration::from_secs(nats.request_timeout_secs)));
        if let Some(ref token) = nats.token {
            opts = opts.token(token.clone());
        }

        let client = opts
            .connect(&nats.url)
            .await
            .map_err(|e| HubError::Connection(format!("{}: {}", nats.url, e)))?;

        tracing::info!(url = %nats.url, "Connected to NATS");

        let js = jetstream::new(client.clone());
        let events = ensure_stream(
            &js,
            &stream.events_name,
            vec!["events.>".to_string()],
            stream.events_max_age_secs,
            stream.events_max_bytes,
        )
        .await?;
        let dlq = ensure_stream(
            &js,
            &stream.dlq_name,
            vec!["dlq.>".to_string()],
            stream.dlq_max_age_secs,
            -1,
        )
        .await?;

        Ok(Self {
            client,
            jetstream: js,
            events: Mutex::new(events),
            dlq: Mutex::new(dlq),
            request_timeout: Duration::from_secs(nats.request_timeout_secs),
        })
    }

    fn stream_handle(&self, kind: StreamKind) -> &Mutex<jetstream::stream::Stream> {
        match kind {
            StreamKind::Events => &self.events,
            StreamKind::Dlq => &self.dlq,
        }
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }
}

#[async_trait]
impl StreamGateway for NatsGateway {
    async fn append(&self, _stream: StreamKind, subject: &str, payload: Bytes) -> Result<u64> {
        // Subjects route to the owning stream
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| HubError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?
            .await
            .map_err(|e| HubError::Publish {
                subject: subject.to_string(),
                reason: format!("ack failed: {e}"),
            })?;

        tracing::debug!(subject = subject, sequence = ack.sequence, "Message appended");
        Ok(ack.sequence)
    }

    async fn durable(
        &self,
        stream: StreamKind,
        name: &str,
        spec: ConsumerSpec,
    ) -> Result<Box<dyn StreamConsumer>> {
        let config = consumer_config(Some(name), &spec);
        let consumer = self
            .stream_handle(stream)
            .lock()
            .await
            .get_or_create_consumer(name, config)
            .await
            .map_err(|e| {
                HubError::Consumer(format!("Failed to create durable consumer '{name}': {e}"))
            })?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| HubError::Consumer(format!("Failed to open message stream: {e}")))?;

        tracing::info!(
            consumer = name,
            filters = ?spec.filter_subjects,
            max_deliver = spec.max_deliver,
            "Durable consumer attached"
        );

        Ok(Box::new(NatsConsumer { messages }))
    }

    async fn ephemeral(
        &self,
        stream: StreamKind,
        spec: ConsumerSpec,
    ) -> Result<Box<dyn StreamConsumer>> {
        let config = consumer_config(None, &spec);
        let consumer = self
            .stream_handle(stream)
            .lock()
            .await
            .create_consumer(config)
            .await
            .map_err(|e| HubError::Consumer(format!("Failed to create ephemeral consumer: {e}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| HubError::Consumer(format!("Failed to open message stream: {e}")))?;

        Ok(Box::new(NatsConsumer { messages }))
    }

    async fn delete_consumer(&self, stream: StreamKind, name: &str) -> Result<()> {
        self.stream_handle(stream)
            .lock()
            .await
            .delete_consumer(name)
            .await
            .map_err(|e| HubError::Consumer(format!("Failed to delete consumer '{name}': {e}")))?;

        tracing::info!(consumer = name, "Consumer deleted");
        Ok(())
    }

    async fn get(&self, stream: StreamKind, sequence: u64) -> Result<Option<StoredEntry>> {
        let raw = self
            .stream_handle(stream)
            .lock()
            .await
            .get_raw_message(sequence)
            .await;
        match raw {
            Ok(msg) => Ok(Some(StoredEntry {
                sequence: msg.sequence,
                subject: msg.subject.to_string(),
                payload: Bytes::from(msg.payload),
                timestamp: offset_to_chrono(msg.time),
            })),
            Err(e) if e.to_string().contains("no message found") => Ok(None),
            Err(e) => Err(HubError::StreamUnavailable(format!(
                "Failed to fetch message {sequence}: {e}"
            ))),
        }
    }

    async fn delete(&self, stream: StreamKind, sequence: u64) -> Result<bool> {
        match self
            .stream_handle(stream)
            .lock()
            .await
            .delete_message(sequence)
            .await
        {
            Ok(deleted) => Ok(deleted),
            Err(e) if e.to_string().contains("no message found") => Ok(false),
            Err(e) => Err(HubError::StreamUnavailable(format!(
                "Failed to delete message {sequence}: {e}"
            ))),
        }
    }

    async fn scan(
        &self,
        stream: StreamKind,
        filter_subject: &str,
        limit: usize,
    ) -> Result<Vec<StoredEntry>> {
        let config = jetstream::consumer::pull::Config {
            deliver_policy: jetstream::consumer::DeliverPolicy::All,
            ack_policy: jetstream::consumer::AckPolicy::None,
            filter_subject: filter_subject.to_string(),
            ..Default::default()
        };

        let consumer = self
            .stream_handle(stream)
            .lock()
            .await
            .create_consumer(config)
            .await
            .map_err(|e| HubError::Consumer(format!("Failed to create scan consumer: {e}")))?;

        let batch = consumer
            .fetch()
            .max_messages(limit)
            .expires(self.request_timeout)
            .messages()
            .await
            .map_err(|e| HubError::StreamUnavailable(format!("Failed to fetch batch: {e}")))?;

        let mut entries = Vec::with_capacity(limit);
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(msg) => {
                    if let Ok(info) = msg.info() {
                        entries.push(StoredEntry {
                            sequence: info.stream_sequence,
                            subject: msg.subject.to_string(),
                            payload: msg.payload.clone(),
                            timestamp: offset_to_chrono(info.published),
                        });
                    }
                    if entries.len() >= limit {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Error fetching scan message");
                    break;
                }
            }
        }

        Ok(entries)
    }

    async fn info(&self, stream: StreamKind) -> Result<StreamStats> {
        let mut handle = self.stream_handle(stream).lock().await;
        let info = handle
            .info()
            .await
            .map_err(|e| HubError::StreamUnavailable(format!("Failed to get stream info: {e}")))?;

        Ok(StreamStats {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumers: info.state.consumer_count,
        })
    }

    fn name(&self) -> &str {
        "nats"
    }
}

struct NatsConsumer {
    messages: jetstream::consumer::pull::Stream,
}

#[async_trait]
impl StreamConsumer for NatsConsumer {
    async fn next(&mut self) -> Result<Option<PendingMessage>> {
        loop {
            match self.messages.next().await {
                Some(Ok(msg)) => {
                    let info = match msg.info() {
                        Ok(info) => (info.stream_sequence, info.delivered.max(1) as u64),
                        Err(e) => {
                            tracing::warn!(error = %e, "Message without delivery info, skipping");
                            continue;
                        }
                    };
                    let subject = msg.subject.to_string();
                    let payload = msg.payload.clone();
                    let acker = Box::new(NatsAck { msg });
                    return Ok(Some(PendingMessage::new(
                        subject, payload, info.0, info.1, acker,
                    )));
                }
                Some(Err(e)) => {
                    return Err(HubError::StreamUnavailable(format!(
                        "Consumer pull failed: {e}"
                    )))
                }
                None => return Ok(None),
            }
        }
    }
}

struct NatsAck {
    msg: jetstream::Message,
}

#[async_trait]
impl MessageAck for NatsAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.msg
            .ack()
            .await
            .map_err(|e| HubError::Ack(e.to_string()))
    }

    async fn nack(self: Box<Self>, delay: Option<Duration>) -> Result<()> {
        self.msg
            .ack_with(jetstream::AckKind::Nak(delay))
            .await
            .map_err(|e| HubError::Ack(e.to_string()))
    }
}

/// Build a JetStream pull consumer config from a `ConsumerSpec`
fn consumer_config(
    durable_name: Option<&str>,
    spec: &ConsumerSpec,
) -> jetstream::consumer::pull::Config {
    let deliver_policy = match &spec.deliver_from {
        StartFrom::Latest => jetstream::consumer::DeliverPolicy::New,
        StartFrom::Beginning => jetstream::consumer::DeliverPolicy::All,
        StartFrom::Time(t) => {
            let secs = t.timestamp();
            let nanos = t.timestamp_subsec_nanos();
            let time = time::OffsetDateTime::from_unix_timestamp(secs)
                .unwrap_or(time::OffsetDateTime::UNIX_EPOCH)
                + time::Duration::nanoseconds(nanos as i64);
            jetstream::consumer::DeliverPolicy::ByStartTime { start_time: time }
        }
    };

    jetstream::consumer::pull::Config {
        durable_name: durable_name.map(|s| s.to_string()),
        filter_subjects: spec.filter_subjects.clone(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy,
        max_deliver: spec.max_deliver,
        max_ack_pending: spec.max_ack_pending,
        ack_wait: spec.ack_wait,
        ..Default::default()
    }
}

/// Ensure a stream exists with the hub's retention settings
async fn ensure_stream(
    js: &jetstream::Context,
    name: &str,
    subjects: Vec<String>,
    max_age_secs: u64,
    max_bytes: i64,
) -> Result<jetstream::stream::Stream> {
    let max_age = if max_age_secs > 0 {
        Duration::from_secs(max_age_secs)
    } else {
        Duration::ZERO
    };

    let config = jetstream::stream::Config {
        name: name.to_string(),
        subjects: subjects.clone(),
        storage: jetstream::stream::StorageType::File,
        max_age,
        max_bytes,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    let stream = js.get_or_create_stream(config).await.map_err(|e| {
        HubError::StreamUnavailable(format!("Failed to create/get stream '{name}': {e}"))
    })?;

    tracing::info!(stream = name, subjects = ?subjects, "JetStream stream ready");
    Ok(stream)
}

fn offset_to_chrono(t: time::OffsetDateTime) -> DateTime<Utc> {
    Utc.timestamp_opt(t.unix_timestamp(), t.nanosecond())
        .single()
        .unwrap_or_else(Utc::now)
}
