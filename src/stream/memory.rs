//! In-process stream gateway
//!
//! Implements the full consumer contract - ack wait, redelivery with delay,
//! max deliver, deliver policies, shared durables - against an in-memory
//! ordered log. Used by the test suites and for single-process deployments.

use super::{
    ConsumerSpec, MessageAck, PendingMessage, StoredEntry, StreamConsumer, StreamGateway,
    StreamKind, StreamStats,
};
use crate::error::{HubError, Result};
use crate::subject::Pattern;
use crate::types::StartFrom;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// In-memory stream gateway
pub struct MemoryGateway {
    events: Arc<StreamState>,
    dlq: Arc<StreamState>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self {
            events: Arc::new(StreamState::new()),
            dlq: Arc::new(StreamState::new()),
        }
    }

    fn stream(&self, kind: StreamKind) -> &Arc<StreamState> {
        match kind {
            StreamKind::Events => &self.events,
            StreamKind::Dlq => &self.dlq,
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

struct StreamState {
    inner: Mutex<StreamInner>,
    /// Signalled on append so idle consumers re-scan
    appended: Notify,
}

struct StreamInner {
    messages: BTreeMap<u64, StoredMessage>,
    last_seq: u64,
    consumers: HashMap<String, Arc<ConsumerShared>>,
}

struct StoredMessage {
    subject: String,
    payload: Bytes,
    timestamp: DateTime<Utc>,
}

struct ConsumerShared {
    spec: ConsumerSpec,
    filters: Vec<Pattern>,
    state: Mutex<ConsumerInner>,
    /// Signalled on ack/nack so pullers blocked on the pending window or
    /// waiting for redeliveries wake up
    changed: Notify,
}

struct ConsumerInner {
    /// Next stream sequence not yet examined for first delivery
    cursor: u64,
    /// Delivery counts per sequence
    delivered: HashMap<u64, u64>,
    /// In-flight deliveries and their ack deadlines
    in_flight: HashMap<u64, Instant>,
    /// Sequences scheduled for redelivery (due time, seq)
    ready: BinaryHeap<Reverse<(Instant, u64)>>,
    /// Acked or max-deliver-exhausted sequences
    done: HashSet<u64>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(StreamInner {
                messages: BTreeMap::new(),
                last_seq: 0,
                consumers: HashMap::new(),
            }),
            appended: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StreamInner> {
        // Lock poisoning cannot occur: no panics while held
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ConsumerShared {
    fn new(spec: ConsumerSpec, start_cursor: u64) -> Result<Self> {
        let filters = spec
            .filter_subjects
            .iter()
            .map(|f| Pattern::parse(f))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            spec,
            filters,
            state: Mutex::new(ConsumerInner {
                cursor: start_cursor,
                delivered: HashMap::new(),
                in_flight: HashMap::new(),
                ready: BinaryHeap::new(),
                done: HashSet::new(),
            }),
            changed: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConsumerInner> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn matches(&self, subject: &str) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|p| p.matches(subject))
    }
}

/// Resolve the starting cursor for a deliver policy
fn start_cursor(inner: &StreamInner, from: &StartFrom) -> u64 {
    match from {
        StartFrom::Latest => inner.last_seq + 1,
        StartFrom::Beginning => inner.messages.keys().next().copied().unwrap_or(1),
        StartFrom::Time(t) => inner
            .messages
            .iter()
            .find(|(_, m)| m.timestamp >= *t)
            .map(|(seq, _)| *seq)
            .unwrap_or(inner.last_seq + 1),
    }
}

#[async_trait]
impl StreamGateway for MemoryGateway {
    async fn append(&self, stream: StreamKind, subject: &str, payload: Bytes) -> Result<u64> {
        let state = self.stream(stream);
        let seq = {
            let mut inner = state.lock();
            inner.last_seq += 1;
            let seq = inner.last_seq;
            inner.messages.insert(
                seq,
                StoredMessage {
                    subject: subject.to_string(),
                    payload,
                    timestamp: Utc::now(),
                },
            );
            seq
        };
        state.appended.notify_waiters();
        Ok(seq)
    }

    async fn durable(
        &self,
        stream: StreamKind,
        name: &str,
        spec: ConsumerSpec,
    ) -> Result<Box<dyn StreamConsumer>> {
        let state = self.stream(stream).clone();
        let consumer = {
            let mut inner = state.lock();
            match inner.consumers.get(name) {
                Some(existing) => existing.clone(),
                None => {
                    let cursor = start_cursor(&inner, &spec.deliver_from);
                    let shared = Arc::new(ConsumerShared::new(spec, cursor)?);
                    inner.consumers.insert(name.to_string(), shared.clone());
                    shared
                }
            }
        };
        Ok(Box::new(MemoryConsumer {
            stream: state,
            consumer,
            ephemeral_name: None,
        }))
    }

    async fn ephemeral(
        &self,
        stream: StreamKind,
        spec: ConsumerSpec,
    ) -> Result<Box<dyn StreamConsumer>> {
        let state = self.stream(stream).clone();
        let name = format!("eph-{}", uuid::Uuid::new_v4());
        let consumer = {
            let mut inner = state.lock();
            let cursor = start_cursor(&inner, &spec.deliver_from);
            let shared = Arc::new(ConsumerShared::new(spec, cursor)?);
            inner.consumers.insert(name.clone(), shared.clone());
            shared
        };
        Ok(Box::new(MemoryConsumer {
            stream: state,
            consumer,
            ephemeral_name: Some(name),
        }))
    }

    async fn delete_consumer(&self, stream: StreamKind, name: &str) -> Result<()> {
        let state = self.stream(stream);
        let removed = state.lock().consumers.remove(name);
        match removed {
            Some(_) => Ok(()),
            None => Err(HubError::Consumer(format!("consumer '{name}' not found"))),
        }
    }

    async fn get(&self, stream: StreamKind, sequence: u64) -> Result<Option<StoredEntry>> {
        let inner = self.stream(stream).lock();
        Ok(inner.messages.get(&sequence).map(|m| StoredEntry {
            sequence,
            subject: m.subject.clone(),
            payload: m.payload.clone(),
            timestamp: m.timestamp,
        }))
    }

    async fn delete(&self, stream: StreamKind, sequence: u64) -> Result<bool> {
        Ok(self.stream(stream).lock().messages.remove(&sequence).is_some())
    }

    async fn scan(
        &self,
        stream: StreamKind,
        filter_subject: &str,
        limit: usize,
    ) -> Result<Vec<StoredEntry>> {
        let pattern = Pattern::parse(filter_subject)?;
        let inner = self.stream(stream).lock();
        Ok(inner
            .messages
            .iter()
            .filter(|(_, m)| pattern.matches(&m.subject))
            .take(limit)
            .map(|(seq, m)| StoredEntry {
                sequence: *seq,
                subject: m.subject.clone(),
                payload: m.payload.clone(),
                timestamp: m.timestamp,
            })
            .collect())
    }

    async fn info(&self, stream: StreamKind) -> Result<StreamStats> {
        let inner = self.stream(stream).lock();
        Ok(StreamStats {
            messages: inner.messages.len() as u64,
            bytes: inner.messages.values().map(|m| m.payload.len() as u64).sum(),
            first_sequence: inner.messages.keys().next().copied().unwrap_or(0),
            last_sequence: inner.last_seq,
            consumers: inner.consumers.len(),
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Pull handle onto a (possibly shared) consumer
struct MemoryConsumer {
    stream: Arc<StreamState>,
    consumer: Arc<ConsumerShared>,
    /// Set for ephemeral handles; the consumer is removed when the handle drops
    ephemeral_name: Option<String>,
}

impl MemoryConsumer {
    /// One delivery attempt under the locks. Returns a message, or the
    /// instant to sleep until, or `None` for "wait for a signal".
    fn try_deliver(&self) -> DeliverOutcome {
        let now = Instant::now();
        let stream = self.stream.lock();
        let mut cons = self.consumer.lock();
        let spec = &self.consumer.spec;

        // Expired in-flight deliveries become immediately redeliverable
        let expired: Vec<u64> = cons
            .in_flight
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in expired {
            cons.in_flight.remove(&seq);
            cons.ready.push(Reverse((now, seq)));
        }

        // Pending window backpressure
        if spec.max_ack_pending > 0 && cons.in_flight.len() >= spec.max_ack_pending as usize {
            let earliest = cons.in_flight.values().min().copied();
            return match earliest {
                Some(t) => DeliverOutcome::Sleep(t),
                None => DeliverOutcome::Wait,
            };
        }

        // Due redeliveries first
        while let Some(Reverse((due, seq))) = cons.ready.peek().copied() {
            if due > now {
                break;
            }
            cons.ready.pop();
            if cons.done.contains(&seq) {
                continue;
            }
            let Some(msg) = stream.messages.get(&seq) else {
                // Aged out of retention
                cons.done.insert(seq);
                continue;
            };
            let count = cons.delivered.get(&seq).copied().unwrap_or(0) + 1;
            if spec.max_deliver > 0 && count > spec.max_deliver as u64 {
                cons.done.insert(seq);
                continue;
            }
            cons.delivered.insert(seq, count);
            cons.in_flight.insert(seq, now + spec.ack_wait);
            return DeliverOutcome::Message {
                subject: msg.subject.clone(),
                payload: msg.payload.clone(),
                sequence: seq,
                delivered: count,
            };
        }

        // Then the next new matching message past the cursor
        let next = stream
            .messages
            .range(cons.cursor..)
            .find(|(_, m)| self.consumer.matches(&m.subject))
            .map(|(seq, m)| (*seq, m.subject.clone(), m.payload.clone()));
        if let Some((seq, subject, payload)) = next {
            cons.cursor = seq + 1;
            cons.delivered.insert(seq, 1);
            cons.in_flight.insert(seq, now + spec.ack_wait);
            return DeliverOutcome::Message {
                subject,
                payload,
                sequence: seq,
                delivered: 1,
            };
        }
        // Nothing matched; skip the scanned prefix next time
        cons.cursor = stream.last_seq + 1;

        // Idle: wake at the earliest deadline among redeliveries and ack waits
        let next_ready = cons.ready.peek().map(|Reverse((due, _))| *due);
        let next_expiry = cons.in_flight.values().min().copied();
        match (next_ready, next_expiry) {
            (Some(a), Some(b)) => DeliverOutcome::Sleep(a.min(b)),
            (Some(a), None) => DeliverOutcome::Sleep(a),
            (None, Some(b)) => DeliverOutcome::Sleep(b),
            (None, None) => DeliverOutcome::Wait,
        }
    }
}

enum DeliverOutcome {
    Message {
        subject: String,
        payload: Bytes,
        sequence: u64,
        delivered: u64,
    },
    /// Nothing deliverable before this instant
    Sleep(Instant),
    /// Nothing deliverable until an append or an ack/nack
    Wait,
}

#[async_trait]
impl StreamConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<PendingMessage>> {
        loop {
            let appended = self.stream.appended.notified();
            let changed = self.consumer.changed.notified();
            tokio::pin!(appended, changed);
            // Register interest before checking, so a concurrent append or
            // ack between the check and the select is not missed
            appended.as_mut().enable();
            changed.as_mut().enable();

            match self.try_deliver() {
                DeliverOutcome::Message {
                    subject,
                    payload,
                    sequence,
                    delivered,
                } => {
                    let acker = Box::new(MemoryAck {
                        consumer: self.consumer.clone(),
                        sequence,
                    });
                    return Ok(Some(PendingMessage::new(
                        subject, payload, sequence, delivered, acker,
                    )));
                }
                DeliverOutcome::Sleep(until) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(until.into()) => {}
                        _ = &mut appended => {}
                        _ = &mut changed => {}
                    }
                }
                DeliverOutcome::Wait => {
                    tokio::select! {
                        _ = &mut appended => {}
                        _ = &mut changed => {}
                    }
                }
            }
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        if let Some(name) = &self.ephemeral_name {
            self.stream.lock().consumers.remove(name);
        }
    }
}

struct MemoryAck {
    consumer: Arc<ConsumerShared>,
    sequence: u64,
}

#[async_trait]
impl MessageAck for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<()> {
        {
            let mut cons = self.consumer.lock();
            cons.in_flight.remove(&self.sequence);
            cons.done.insert(self.sequence);
        }
        self.consumer.changed.notify_waiters();
        Ok(())
    }

    async fn nack(self: Box<Self>, delay: Option<Duration>) -> Result<()> {
        {
            let mut cons = self.consumer.lock();
            cons.in_flight.remove(&self.sequence);
            let due = Instant::now() + delay.unwrap_or(Duration::ZERO);
            cons.ready.push(Reverse((due, self.sequence)));
        }
        self.consumer.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(filters: &[&str]) -> ConsumerSpec {
        ConsumerSpec {
            filter_subjects: filters.iter().map(|s| s.to_string()).collect(),
            ack_wait: Duration::from_secs(30),
            max_deliver: 0,
            deliver_from: StartFrom::Beginning,
            max_ack_pending: 64,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_monotonic_sequences() {
        let gw = MemoryGateway::new();
        let s1 = gw
            .append(StreamKind::Events, "events.a.b.t", Bytes::from("1"))
            .await
            .unwrap();
        let s2 = gw
            .append(StreamKind::Events, "events.a.b.t", Bytes::from("2"))
            .await
            .unwrap();
        assert_eq!(s1, 1);
        assert_eq!(s2, 2);
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("e"))
            .await
            .unwrap();
        let dlq_seq = gw
            .append(StreamKind::Dlq, "dlq.a.b.t", Bytes::from("d"))
            .await
            .unwrap();
        assert_eq!(dlq_seq, 1);
        assert_eq!(gw.info(StreamKind::Dlq).await.unwrap().messages, 1);
    }

    #[tokio::test]
    async fn test_consume_in_order_with_acks() {
        let gw = MemoryGateway::new();
        for i in 0..5 {
            gw.append(
                StreamKind::Events,
                "events.a.b.t",
                Bytes::from(i.to_string()),
            )
            .await
            .unwrap();
        }
        let mut c = gw
            .durable(StreamKind::Events, "c1", spec(&["events.a.b.>"]))
            .await
            .unwrap();
        for i in 0..5u64 {
            let msg = c.next().await.unwrap().unwrap();
            assert_eq!(msg.sequence, i + 1);
            assert_eq!(msg.delivered, 1);
            msg.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_filter_subjects() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Events, "events.a.b.orders.new", Bytes::from("o"))
            .await
            .unwrap();
        gw.append(StreamKind::Events, "events.a.b.billing.paid", Bytes::from("b"))
            .await
            .unwrap();
        let mut c = gw
            .durable(StreamKind::Events, "c1", spec(&["events.a.b.billing.*"]))
            .await
            .unwrap();
        let msg = c.next().await.unwrap().unwrap();
        assert_eq!(msg.subject, "events.a.b.billing.paid");
        msg.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_deliver_from_latest_skips_history() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("old"))
            .await
            .unwrap();
        let mut s = spec(&["events.a.b.>"]);
        s.deliver_from = StartFrom::Latest;
        let mut c = gw.durable(StreamKind::Events, "c1", s).await.unwrap();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("new"))
            .await
            .unwrap();
        let msg = c.next().await.unwrap().unwrap();
        assert_eq!(msg.payload, Bytes::from("new"));
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_incremented_count() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("x"))
            .await
            .unwrap();
        let mut c = gw
            .durable(StreamKind::Events, "c1", spec(&["events.a.b.>"]))
            .await
            .unwrap();
        let msg = c.next().await.unwrap().unwrap();
        assert_eq!(msg.delivered, 1);
        msg.nack(None).await.unwrap();

        let msg = c.next().await.unwrap().unwrap();
        assert_eq!(msg.delivered, 2);
        msg.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_nack_with_delay_defers_redelivery() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("x"))
            .await
            .unwrap();
        let mut c = gw
            .durable(StreamKind::Events, "c1", spec(&["events.a.b.>"]))
            .await
            .unwrap();
        let msg = c.next().await.unwrap().unwrap();
        msg.nack(Some(Duration::from_millis(150))).await.unwrap();

        let started = Instant::now();
        let msg = c.next().await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(140));
        msg.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_ack_wait_expiry_redelivers() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("x"))
            .await
            .unwrap();
        let mut s = spec(&["events.a.b.>"]);
        s.ack_wait = Duration::from_millis(100);
        let mut c = gw.durable(StreamKind::Events, "c1", s).await.unwrap();
        let msg = c.next().await.unwrap().unwrap();
        // Never acked; the ack wait elapses
        drop(msg.into_acker());
        let msg = c.next().await.unwrap().unwrap();
        assert_eq!(msg.delivered, 2);
        msg.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_max_deliver_stops_redelivery() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("x"))
            .await
            .unwrap();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("y"))
            .await
            .unwrap();
        let mut s = spec(&["events.a.b.>"]);
        s.max_deliver = 2;
        let mut c = gw.durable(StreamKind::Events, "c1", s).await.unwrap();

        // First message: exhaust both deliveries
        let msg = c.next().await.unwrap().unwrap();
        assert_eq!(msg.sequence, 1);
        msg.nack(None).await.unwrap();
        let msg = c.next().await.unwrap().unwrap();
        assert_eq!(msg.sequence, 1);
        assert_eq!(msg.delivered, 2);
        msg.nack(None).await.unwrap();

        // Exhausted; the consumer advances to the second message
        let msg = c.next().await.unwrap().unwrap();
        assert_eq!(msg.sequence, 2);
        msg.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_shared_durable_delivers_each_message_once() {
        let gw = MemoryGateway::new();
        for i in 0..10 {
            gw.append(
                StreamKind::Events,
                "events.a.b.t",
                Bytes::from(i.to_string()),
            )
            .await
            .unwrap();
        }
        let mut h1 = gw
            .durable(StreamKind::Events, "grp", spec(&["events.a.b.>"]))
            .await
            .unwrap();
        let mut h2 = gw
            .durable(StreamKind::Events, "grp", spec(&["events.a.b.>"]))
            .await
            .unwrap();

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let m = h1.next().await.unwrap().unwrap();
            assert!(seen.insert(m.sequence));
            m.ack().await.unwrap();
            let m = h2.next().await.unwrap().unwrap();
            assert!(seen.insert(m.sequence));
            m.ack().await.unwrap();
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn test_ephemeral_consumers_are_independent() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Events, "events.a.b.t", Bytes::from("x"))
            .await
            .unwrap();
        let mut c1 = gw
            .ephemeral(StreamKind::Events, spec(&["events.a.b.>"]))
            .await
            .unwrap();
        let mut c2 = gw
            .ephemeral(StreamKind::Events, spec(&["events.a.b.>"]))
            .await
            .unwrap();
        let m1 = c1.next().await.unwrap().unwrap();
        let m2 = c2.next().await.unwrap().unwrap();
        assert_eq!(m1.sequence, m2.sequence);
        m1.ack().await.unwrap();
        m2.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_cleanup_on_drop() {
        let gw = MemoryGateway::new();
        {
            let _c = gw
                .ephemeral(StreamKind::Events, spec(&["events.>"]))
                .await
                .unwrap();
            assert_eq!(gw.info(StreamKind::Events).await.unwrap().consumers, 1);
        }
        assert_eq!(gw.info(StreamKind::Events).await.unwrap().consumers, 0);
    }

    #[tokio::test]
    async fn test_get_delete_scan() {
        let gw = MemoryGateway::new();
        gw.append(StreamKind::Dlq, "dlq.a.b.orders.new", Bytes::from("1"))
            .await
            .unwrap();
        gw.append(StreamKind::Dlq, "dlq.a.b.billing.paid", Bytes::from("2"))
            .await
            .unwrap();

        let entry = gw.get(StreamKind::Dlq, 1).await.unwrap().unwrap();
        assert_eq!(entry.subject, "dlq.a.b.orders.new");

        let scanned = gw.scan(StreamKind::Dlq, "dlq.a.b.>", 10).await.unwrap();
        assert_eq!(scanned.len(), 2);

        assert!(gw.delete(StreamKind::Dlq, 1).await.unwrap());
        assert!(!gw.delete(StreamKind::Dlq, 1).await.unwrap());
        assert!(gw.get(StreamKind::Dlq, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_consumer() {
        let gw = MemoryGateway::new();
        let _c = gw
            .durable(StreamKind::Events, "grp", spec(&["events.>"]))
            .await
            .unwrap();
        gw.delete_consumer(StreamKind::Events, "grp").await.unwrap();
        assert!(gw
            .delete_consumer(StreamKind::Events, "grp")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_next_wakes_on_append() {
        let gw = Arc::new(MemoryGateway::new());
        let mut c = gw
            .durable(StreamKind::Events, "c1", spec(&["events.a.b.>"]))
            .await
            .unwrap();

        let gw2 = gw.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            gw2.append(StreamKind::Events, "events.a.b.t", Bytes::from("late"))
                .await
                .unwrap();
        });

        let msg = tokio::time::timeout(Duration::from_secs(2), c.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload, Bytes::from("late"));
        msg.ack().await.unwrap();
    }
}
