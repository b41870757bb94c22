//! WebSocket session - per-client delivery state machine
//!
//! `AWAIT_SUBSCRIBE → RUNNING → CLOSING → CLOSED`. A running session owns a
//! write loop pulling from its consumer, a read loop handling ack/nack
//! frames, and a janitor enforcing ack timeouts and the heartbeat. Pending
//! deliveries left unacked at disconnect are redelivered by the broker.

use crate::config::SessionConfig;
use crate::consumer::{ConsumerManager, ReleaseTicket};
use crate::dlq::DlqService;
use crate::stream::{MessageAck, StreamConsumer};
use crate::subject::Pattern;
use crate::tenant::Tenant;
use crate::types::{Event, SubscribeOptions};
use crate::ws::protocol::{parse_retry_in, ClientFrame, ErrorCode, ServerFrame};
use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Dependencies shared by every session
pub struct SessionDeps {
    pub consumers: Arc<ConsumerManager>,
    pub dlq: Arc<DlqService>,
    pub config: SessionConfig,
}

/// One delivery awaiting client acknowledgement
struct PendingDelivery {
    event: Event,
    attempt: u64,
    deadline: Instant,
    acker: Box<dyn MessageAck>,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingDelivery>>>;

/// Drive a socket through its full lifecycle
pub async fn run(
    socket: WebSocket,
    tenant: Tenant,
    deps: Arc<SessionDeps>,
    shutdown: CancellationToken,
) {
    let session_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(session = %session_id, tenant = %tenant, "WebSocket session opened");

    let (mut sink, mut stream) = socket.split();

    // AWAIT_SUBSCRIBE: the first frame must be a valid subscribe
    let (patterns, options) =
        match await_subscribe(&mut sink, &mut stream, &shutdown).await {
            Some(sub) => sub,
            None => {
                tracing::info!(session = %session_id, "Session closed before subscribing");
                return;
            }
        };

    let binding = match deps.consumers.bind(&tenant, &patterns, &options).await {
        Ok(binding) => binding,
        Err(e) => {
            tracing::error!(session = %session_id, error = %e, "Failed to bind consumer");
            let frame = ServerFrame::error(ErrorCode::Internal, "failed to bind subscription");
            send_frame(&mut sink, &frame).await;
            let _ = sink.close().await;
            return;
        }
    };
    let (consumer, ticket) = (binding.consumer, binding.ticket);

    if !send_frame(&mut sink, &ServerFrame::Subscribed).await {
        deps.consumers.release(ticket).await;
        return;
    }

    tracing::info!(
        session = %session_id,
        tenant = %tenant,
        topics = ?patterns.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        group = %options.group,
        "Session running"
    );

    // RUNNING: outbound writer, puller, reader, janitor
    let token = shutdown.child_token();
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (tx, rx) = mpsc::channel::<Message>(deps.config.outbound_queue);
    let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));

    let writer = tokio::spawn(write_loop(sink, rx, token.clone()));
    let puller = tokio::spawn(pull_loop(
        consumer,
        options.clone(),
        tenant.clone(),
        pending.clone(),
        tx.clone(),
        deps.clone(),
        token.clone(),
    ));
    let janitor = tokio::spawn(janitor_loop(
        options.clone(),
        pending.clone(),
        tx.clone(),
        last_pong.clone(),
        deps.clone(),
        token.clone(),
    ));

    read_loop(
        &mut stream,
        &options,
        &pending,
        &tx,
        &last_pong,
        &deps,
        &token,
    )
    .await;

    // CLOSING: stop the loops, then release the consumer
    token.cancel();
    drop(tx);
    let _ = puller.await;
    let _ = janitor.await;
    let _ = writer.await;
    deps.consumers.release(ticket).await;

    // CLOSED: pending entries drop unacked, so the broker redelivers them
    let unacked = pending.lock().await.len();
    tracing::info!(
        session = %session_id,
        unacked = unacked,
        "WebSocket session closed"
    );
}

/// Wait for the subscribe frame, rejecting anything else
async fn await_subscribe(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut (impl StreamExt<Item = std::result::Result<Message, axum::Error>> + Unpin),
    shutdown: &CancellationToken,
) -> Option<(Vec<Pattern>, SubscribeOptions)> {
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => return None,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(ClientFrame::Subscribe { topics, options }) => {
                    match compile_patterns(&topics) {
                        Ok(patterns) => return Some((patterns, options)),
                        Err(message) => {
                            let frame = ServerFrame::error(ErrorCode::InvalidPattern, message);
                            send_frame(sink, &frame).await;
                            let _ = sink.close().await;
                            return None;
                        }
                    }
                }
                Ok(_) => {
                    let frame = ServerFrame::error(
                        ErrorCode::ProtocolError,
                        "subscribe required before any other frame",
                    );
                    send_frame(sink, &frame).await;
                    let _ = sink.close().await;
                    return None;
                }
                Err(e) => {
                    let frame =
                        ServerFrame::error(ErrorCode::ProtocolError, format!("malformed frame: {e}"));
                    send_frame(sink, &frame).await;
                    let _ = sink.close().await;
                    return None;
                }
            },
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

fn compile_patterns(topics: &[String]) -> std::result::Result<Vec<Pattern>, String> {
    if topics.is_empty() {
        return Err("at least one topic pattern is required".to_string());
    }
    topics
        .iter()
        .map(|t| Pattern::parse(t).map_err(|e| e.to_string()))
        .collect()
}

/// Outbound writer: the single place that touches the sink, so writes stay FIFO
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    token: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = rx.recv() => msg,
        };
        match msg {
            Some(msg) => {
                if sink.send(msg).await.is_err() {
                    token.cancel();
                    break;
                }
            }
            None => break,
        }
    }
    let _ = sink.close().await;
}

/// Pull from the consumer and forward events
///
/// `tx.send().await` blocks when the outbound queue is full, which pauses
/// pulling; the consumer's own flow control then stops redelivery upstream.
async fn pull_loop(
    mut consumer: Box<dyn StreamConsumer>,
    options: SubscribeOptions,
    tenant: Tenant,
    pending: PendingMap,
    tx: mpsc::Sender<Message>,
    deps: Arc<SessionDeps>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = consumer.next() => next,
        };
        let msg = match next {
            Ok(Some(msg)) => msg,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Consumer pull failed");
                queue_or_close(
                    &tx,
                    &token,
                    ServerFrame::error(ErrorCode::Internal, "stream unavailable"),
                );
                token.cancel();
                break;
            }
        };

        let event: Event = match serde_json::from_slice(&msg.payload) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(sequence = msg.sequence, error = %e, "Undecodable event, acking past it");
                let _ = msg.ack().await;
                continue;
            }
        };
        // Subject filters already scope the consumer; this guards the envelope
        if event.org != tenant.org || event.project != tenant.project {
            tracing::error!(event_id = %event.id, "Envelope tenant mismatch, acking past it");
            let _ = msg.ack().await;
            continue;
        }

        let attempt = msg.delivered;
        let frame = ServerFrame::Event {
            id: event.id.clone(),
            topic: event.topic.clone(),
            data: event.data.clone(),
            timestamp: event.timestamp,
            attempt,
            max_attempts: options.max_attempts(),
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Failed to encode event frame");
                let _ = msg.ack().await;
                continue;
            }
        };

        if options.auto_ack {
            if tx.send(Message::Text(text)).await.is_err() {
                break;
            }
            if let Err(e) = msg.ack().await {
                tracing::warn!(event_id = %event.id, error = %e, "Auto-ack failed");
            }
        } else {
            let deadline = Instant::now() + options.ack_wait();
            let acker = msg.into_acker();
            pending.lock().await.insert(
                event.id.clone(),
                PendingDelivery {
                    event,
                    attempt,
                    deadline,
                    acker,
                },
            );
            if tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    }
}

/// Handle inbound ack/nack frames until the socket ends
async fn read_loop(
    stream: &mut (impl StreamExt<Item = std::result::Result<Message, axum::Error>> + Unpin),
    options: &SubscribeOptions,
    pending: &PendingMap,
    tx: &mpsc::Sender<Message>,
    last_pong: &Arc<std::sync::Mutex<Instant>>,
    deps: &Arc<SessionDeps>,
    token: &CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => break,
            msg = stream.next() => msg,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        queue_or_close(
                            tx,
                            token,
                            ServerFrame::error(
                                ErrorCode::ProtocolError,
                                format!("malformed frame: {e}"),
                            ),
                        );
                        break;
                    }
                };
                match frame {
                    ClientFrame::Ack { id } => {
                        let entry = pending.lock().await.remove(&id);
                        match entry {
                            Some(delivery) => {
                                if let Err(e) = delivery.acker.ack().await {
                                    tracing::warn!(event_id = %id, error = %e, "Ack failed");
                                }
                            }
                            // Ids this session did not issue are refused
                            None => queue_or_close(
                                tx,
                                token,
                                ServerFrame::error(
                                    ErrorCode::UnknownDelivery,
                                    format!("no pending delivery with id '{id}'"),
                                ),
                            ),
                        }
                    }
                    ClientFrame::Nack { id, retry_in } => {
                        // Validate the delay before consuming the pending entry
                        let delay = match retry_in.as_deref().map(parse_retry_in).transpose() {
                            Ok(delay) => delay,
                            Err(message) => {
                                queue_or_close(
                                    tx,
                                    token,
                                    ServerFrame::error(ErrorCode::ProtocolError, message),
                                );
                                break;
                            }
                        };
                        let entry = pending.lock().await.remove(&id);
                        match entry {
                            Some(delivery) => {
                                handle_nack(delivery, delay, options, deps, "nacked by consumer")
                                    .await;
                            }
                            None => queue_or_close(
                                tx,
                                token,
                                ServerFrame::error(
                                    ErrorCode::UnknownDelivery,
                                    format!("no pending delivery with id '{id}'"),
                                ),
                            ),
                        }
                    }
                    ClientFrame::Subscribe { .. } => {
                        queue_or_close(
                            tx,
                            token,
                            ServerFrame::error(ErrorCode::ProtocolError, "already subscribed"),
                        );
                        break;
                    }
                }
            }
            Some(Ok(Message::Pong(_))) => {
                *last_pong.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
            }
            Some(Ok(Message::Ping(_))) => {}
            Some(Ok(Message::Binary(_))) => {
                queue_or_close(
                    tx,
                    token,
                    ServerFrame::error(ErrorCode::ProtocolError, "binary frames are not supported"),
                );
                break;
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
        }
    }
}

/// Retry-or-escalate for an explicit or implicit nack
async fn handle_nack(
    delivery: PendingDelivery,
    requested_delay: Option<Duration>,
    options: &SubscribeOptions,
    deps: &Arc<SessionDeps>,
    reason: &str,
) {
    if delivery.attempt >= options.max_attempts() {
        // Budget exhausted: escalate and advance the consumer
        let attempts = delivery.attempt;
        let event_id = delivery.event.id.clone();
        if let Err(e) = deps
            .dlq
            .write(delivery.event, attempts, reason, options.group.clone())
            .await
        {
            tracing::error!(event_id = %event_id, error = %e, "DLQ escalation failed");
            return;
        }
        if let Err(e) = delivery.acker.ack().await {
            tracing::warn!(event_id = %event_id, error = %e, "Ack after DLQ escalation failed");
        }
        return;
    }

    // `retry_in` is clamped to the configured bounds, then capped at the
    // consumer's ack wait so a long delay cannot reset the attempt counter
    let delay = requested_delay.map(|d| effective_retry_delay(d, &deps.config, options));
    if let Err(e) = delivery.acker.nack(delay).await {
        tracing::warn!(event_id = %delivery.event.id, error = %e, "Nack failed");
    }
}

/// Ack-timeout scans and heartbeat pings
async fn janitor_loop(
    options: SubscribeOptions,
    pending: PendingMap,
    tx: mpsc::Sender<Message>,
    last_pong: Arc<std::sync::Mutex<Instant>>,
    deps: Arc<SessionDeps>,
    token: CancellationToken,
) {
    let mut scan = tokio::time::interval(deps.config.janitor_interval());
    let mut heartbeat = tokio::time::interval(deps.config.heartbeat());
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = scan.tick() => {
                let now = Instant::now();
                let expired: Vec<PendingDelivery> = {
                    let mut map = pending.lock().await;
                    let ids: Vec<String> = map
                        .iter()
                        .filter(|(_, d)| d.deadline <= now)
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter().filter_map(|id| map.remove(&id)).collect()
                };
                for delivery in expired {
                    tracing::debug!(
                        event_id = %delivery.event.id,
                        attempt = delivery.attempt,
                        "Ack timeout, treating as implicit nack"
                    );
                    handle_nack(delivery, None, &options, &deps, "ack timeout").await;
                }
            }
            _ = heartbeat.tick() => {
                let idle = last_pong
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .elapsed();
                if idle > deps.config.heartbeat() * 2 {
                    tracing::info!("Heartbeat missed, marking socket dead");
                    token.cancel();
                    break;
                }
                if tx.try_send(Message::Ping(Vec::new())).is_err() {
                    tracing::warn!("Outbound queue full on heartbeat, closing socket");
                    token.cancel();
                    break;
                }
            }
        }
    }
}

/// Queue a control frame without blocking; a full queue closes the socket
fn queue_or_close(tx: &mpsc::Sender<Message>, token: &CancellationToken, frame: ServerFrame) {
    let text = match serde_json::to_string(&frame) {
        Ok(text) => text,
        Err(_) => return,
    };
    if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(Message::Text(text)) {
        tracing::warn!("Outbound queue overflow, closing socket");
        token.cancel();
    }
}

async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    }
}

/// Compute the delay actually applied for a client-requested `retry_in`
///
/// Exposed for the protocol tests; the session path goes through
/// `handle_nack`.
pub fn effective_retry_delay(
    requested: Duration,
    config: &SessionConfig,
    options: &SubscribeOptions,
) -> Duration {
    config.clamp_backoff(requested).min(options.ack_wait())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_patterns_rejects_empty_and_invalid() {
        assert!(compile_patterns(&[]).is_err());
        assert!(compile_patterns(&["orders.>.x".to_string()]).is_err());
        assert!(compile_patterns(&["orders.*".to_string()]).is_ok());
    }

    #[test]
    fn test_effective_retry_delay_clamps_and_caps() {
        let config = SessionConfig::default();
        let options = SubscribeOptions {
            ack_timeout: 120,
            ..Default::default()
        };
        // Below the minimum backoff
        assert_eq!(
            effective_retry_delay(Duration::from_millis(1), &config, &options),
            Duration::from_secs(1)
        );
        // Within bounds
        assert_eq!(
            effective_retry_delay(Duration::from_secs(30), &config, &options),
            Duration::from_secs(30)
        );
        // Longer than the ack wait: capped so the attempt counter is preserved
        assert_eq!(
            effective_retry_delay(Duration::from_secs(3000), &config, &options),
            Duration::from_secs(120)
        );
    }
}
