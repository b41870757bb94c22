//! End-to-end scenarios against the in-process stream backend
//!
//! These drive the core services the way the server wires them, without
//! the HTTP layer in between. The WebSocket suite covers the socket path.

use notif_hub::config::{SchedulerConfig, WebhookConfig};
use notif_hub::consumer::ConsumerManager;
use notif_hub::dlq::DlqService;
use notif_hub::publish::Publisher;
use notif_hub::schedule::{ScheduleAt, SchedulerService};
use notif_hub::store::{DeliveryStore, MemoryStore, ScheduleStatus, Webhook, WebhookStore};
use notif_hub::stream::MemoryGateway;
use notif_hub::subject::{best_match, Pattern};
use notif_hub::tenant::Tenant;
use notif_hub::types::{Event, StartFrom, SubscribeOptions};
use notif_hub::webhook::{signature, Deliverer, WebhookWorker};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

struct Fixture {
    gateway: Arc<MemoryGateway>,
    store: Arc<MemoryStore>,
    publisher: Arc<Publisher>,
    consumers: Arc<ConsumerManager>,
    dlq: Arc<DlqService>,
}

fn fixture() -> Fixture {
    let gateway: Arc<MemoryGateway> = Arc::new(MemoryGateway::new());
    let store = Arc::new(MemoryStore::new());
    let publisher = Arc::new(Publisher::new(gateway.clone(), store.clone(), 1024 * 1024));
    let consumers = Arc::new(ConsumerManager::new(gateway.clone(), 64));
    let dlq = Arc::new(DlqService::new(gateway.clone(), publisher.clone()));
    Fixture {
        gateway,
        store,
        publisher,
        consumers,
        dlq,
    }
}

fn tenant() -> Tenant {
    Tenant::new("acme", "prod")
}

fn broadcast_from_beginning() -> SubscribeOptions {
    SubscribeOptions {
        from: StartFrom::Beginning,
        ..Default::default()
    }
}

fn patterns(raw: &[&str]) -> Vec<Pattern> {
    raw.iter().map(|s| Pattern::parse(s).unwrap()).collect()
}

async fn next_event(
    consumer: &mut Box<dyn notif_hub::stream::StreamConsumer>,
) -> (Event, u64, notif_hub::stream::PendingMessage) {
    let msg = tokio::time::timeout(Duration::from_secs(5), consumer.next())
        .await
        .expect("timed out waiting for event")
        .unwrap()
        .expect("consumer ended");
    let event: Event = serde_json::from_slice(&msg.payload).unwrap();
    let attempt = msg.delivered;
    (event, attempt, msg)
}

#[tokio::test]
async fn basic_fanout_to_two_broadcast_subscribers() {
    let f = fixture();
    let pats = patterns(&["orders.*"]);

    let mut a = f
        .consumers
        .bind(&tenant(), &pats, &broadcast_from_beginning())
        .await
        .unwrap();
    let mut b = f
        .consumers
        .bind(&tenant(), &pats, &broadcast_from_beginning())
        .await
        .unwrap();

    let receipt = f
        .publisher
        .publish(&tenant(), "orders.new", serde_json::json!({"id": 1}))
        .await
        .unwrap();

    for binding in [&mut a, &mut b] {
        let (event, attempt, msg) = next_event(&mut binding.consumer).await;
        assert_eq!(event.id, receipt.id);
        assert_eq!(event.topic, "orders.new");
        assert_eq!(attempt, 1);
        msg.ack().await.unwrap();
    }

    f.consumers.release(a.ticket).await;
    f.consumers.release(b.ticket).await;
}

#[tokio::test]
async fn group_load_balance_partitions_events() {
    let f = fixture();
    let pats = patterns(&["orders.*"]);
    let opts = SubscribeOptions {
        group: "worker".to_string(),
        from: StartFrom::Beginning,
        ..Default::default()
    };

    let mut a = f.consumers.bind(&tenant(), &pats, &opts).await.unwrap();
    let mut b = f.consumers.bind(&tenant(), &pats, &opts).await.unwrap();

    let mut emitted = HashSet::new();
    for i in 0..10 {
        let receipt = f
            .publisher
            .publish(&tenant(), "orders.new", serde_json::json!({"i": i}))
            .await
            .unwrap();
        emitted.insert(receipt.id);
    }

    // Alternate pulls across the two members
    let mut seen_a = HashSet::new();
    let mut seen_b = HashSet::new();
    for _ in 0..5 {
        let (event, _, msg) = next_event(&mut a.consumer).await;
        seen_a.insert(event.id);
        msg.ack().await.unwrap();
        let (event, _, msg) = next_event(&mut b.consumer).await;
        seen_b.insert(event.id);
        msg.ack().await.unwrap();
    }

    // Union equals the emitted set, intersection is empty
    let union: HashSet<_> = seen_a.union(&seen_b).cloned().collect();
    assert_eq!(union, emitted);
    assert!(seen_a.is_disjoint(&seen_b));

    f.consumers.release(a.ticket).await;
    f.consumers.release(b.ticket).await;
}

#[tokio::test]
async fn emit_subscribe_round_trip_preserves_bytes() {
    let f = fixture();
    let data = serde_json::json!({"nested": {"key": [1, 2.5, "three", null, true]}});
    f.publisher
        .publish(&tenant(), "orders.new", data.clone())
        .await
        .unwrap();

    let mut binding = f
        .consumers
        .bind(&tenant(), &patterns(&["orders.new"]), &broadcast_from_beginning())
        .await
        .unwrap();
    let (event, _, msg) = next_event(&mut binding.consumer).await;
    assert_eq!(event.topic, "orders.new");
    assert_eq!(
        serde_json::to_vec(&event.data).unwrap(),
        serde_json::to_vec(&data).unwrap()
    );
    msg.ack().await.unwrap();
    f.consumers.release(binding.ticket).await;
}

#[tokio::test]
async fn ordering_within_topic_with_in_order_acks() {
    let f = fixture();
    let opts = SubscribeOptions {
        group: "ordered".to_string(),
        from: StartFrom::Beginning,
        ..Default::default()
    };
    let mut binding = f
        .consumers
        .bind(&tenant(), &patterns(&["orders.new"]), &opts)
        .await
        .unwrap();

    for i in 0..8 {
        f.publisher
            .publish(&tenant(), "orders.new", serde_json::json!({"i": i}))
            .await
            .unwrap();
    }

    let mut last_seq = 0;
    for _ in 0..8 {
        let (_, _, msg) = next_event(&mut binding.consumer).await;
        assert!(msg.sequence > last_seq, "sequences must strictly increase");
        last_seq = msg.sequence;
        msg.ack().await.unwrap();
    }
    f.consumers.release(binding.ticket).await;
}

#[tokio::test]
async fn dlq_replay_yields_original_envelope() {
    let f = fixture();
    let receipt = f
        .publisher
        .publish(&tenant(), "orders.new", serde_json::json!({"id": 42}))
        .await
        .unwrap();

    // Drain the original delivery so only the replay remains pending
    let mut binding = f
        .consumers
        .bind(&tenant(), &patterns(&["orders.>"]), &broadcast_from_beginning())
        .await
        .unwrap();
    let (event, _, msg) = next_event(&mut binding.consumer).await;
    msg.ack().await.unwrap();

    let seq = f.dlq.write(event, 4, "exhausted", "worker").await.unwrap();
    f.dlq.replay(&tenant(), seq).await.unwrap();

    let (replayed, _, msg) = next_event(&mut binding.consumer).await;
    assert_eq!(replayed.id, receipt.id);
    assert_eq!(replayed.topic, "orders.new");
    assert_eq!(replayed.data, serde_json::json!({"id": 42}));
    msg.ack().await.unwrap();
    f.consumers.release(binding.ticket).await;
}

#[tokio::test]
async fn wildcard_specificity_resolution() {
    let star = Pattern::parse("orders.*").unwrap();
    let tail = Pattern::parse("orders.>").unwrap();
    let pats = vec![star, tail];

    // Three tokens: the star pattern has the wrong arity, so `>` wins
    assert_eq!(best_match(&pats, "orders.us.new").unwrap().as_str(), "orders.>");
    // Two tokens: the star pattern outranks the tail
    assert_eq!(best_match(&pats, "orders.new").unwrap().as_str(), "orders.*");
}

#[tokio::test]
async fn scheduled_event_executes_near_its_due_time() {
    let f = fixture();
    let scheduler = Arc::new(SchedulerService::new(
        f.store.clone(),
        f.publisher.clone(),
        SchedulerConfig::default(),
    ));

    let mut binding = f
        .consumers
        .bind(&tenant(), &patterns(&["jobs.nightly"]), &broadcast_from_beginning())
        .await
        .unwrap();

    let schedule = scheduler
        .create(
            &tenant(),
            "jobs.nightly",
            serde_json::json!({"run": 1}),
            ScheduleAt::In(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let ticker = tokio::spawn(scheduler.clone().run(shutdown.clone()));

    // The 1 s poll picks the row up on its second tick
    let (event, _, msg) = next_event(&mut binding.consumer).await;
    assert_eq!(event.topic, "jobs.nightly");
    msg.ack().await.unwrap();

    shutdown.cancel();
    ticker.await.unwrap();

    let row = scheduler.get(&tenant(), &schedule.id).await.unwrap();
    assert_eq!(row.status, ScheduleStatus::Completed);
    let executed = row.executed_at.expect("executed_at set");
    let drift = (executed - row.scheduled_for).num_milliseconds().abs();
    assert!(drift < 1_500, "executed {drift}ms from schedule");

    // Exactly one event reached the subscriber
    assert!(tokio::time::timeout(Duration::from_millis(300), binding.consumer.next())
        .await
        .is_err());
    f.consumers.release(binding.ticket).await;
}

#[tokio::test]
async fn webhook_worker_signs_and_audits_deliveries() {
    let f = fixture();

    // Receiver capturing the signed request
    let captured: Arc<tokio::sync::Mutex<Option<(String, String, String, Vec<u8>)>>> =
        Arc::new(tokio::sync::Mutex::new(None));
    let captured_handler = captured.clone();
    let app = axum::Router::new().route(
        "/hook",
        axum::routing::post(
            move |headers: axum::http::HeaderMap, body: axum::body::Bytes| {
                let captured = captured_handler.clone();
                async move {
                    let header = |name: &str| {
                        headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string()
                    };
                    *captured.lock().await = Some((
                        header("X-Notif-Signature"),
                        header("X-Notif-Event-Id"),
                        header("X-Notif-Topic"),
                        body.to_vec(),
                    ));
                    axum::http::StatusCode::OK
                }
            },
        ),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let secret = "whsec_known_secret";
    f.store
        .create_webhook(&Webhook {
            id: "wh-billing".to_string(),
            url: format!("http://{addr}/hook"),
            topics: vec!["billing.*".to_string()],
            secret: secret.to_string(),
            enabled: true,
            org: "acme".to_string(),
            project: "prod".to_string(),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let config = WebhookConfig {
        base_backoff_ms: 10,
        max_backoff_ms: 50,
        ..Default::default()
    };
    let deliverer = Arc::new(Deliverer::new(f.store.clone(), &config));
    let worker = Arc::new(WebhookWorker::new(
        f.gateway.clone(),
        f.store.clone(),
        f.dlq.clone(),
        deliverer,
        config,
    ));
    let shutdown = CancellationToken::new();
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    // Give the worker's durable a moment to exist before emitting
    tokio::time::sleep(Duration::from_millis(100)).await;
    let receipt = f
        .publisher
        .publish(&tenant(), "billing.paid", serde_json::json!({"amt": 1}))
        .await
        .unwrap();

    // Wait for the delivery to land
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if captured.lock().await.is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "delivery never arrived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let (sig, event_id, topic, body) = captured.lock().await.take().unwrap();
    assert_eq!(event_id, receipt.id);
    assert_eq!(topic, "billing.paid");
    assert_eq!(sig, signature::sign(secret, &body));
    assert!(signature::verify(secret, &body, &sig));

    // The body is the raw event envelope
    let event: Event = serde_json::from_slice(&body).unwrap();
    assert_eq!(event.data, serde_json::json!({"amt": 1}));

    // One successful audit row
    let records = f
        .store
        .list_deliveries(&tenant(), "wh-billing", 10)
        .await
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].response_status, Some(200));

    shutdown.cancel();
    let _ = worker_task.await;
}

#[tokio::test]
async fn webhook_exhaustion_escalates_to_dlq() {
    let f = fixture();
    f.store
        .create_webhook(&Webhook {
            id: "wh-dead".to_string(),
            // Nothing listens here
            url: "http://127.0.0.1:9/hook".to_string(),
            topics: vec!["orders.*".to_string()],
            secret: "whsec_x".to_string(),
            enabled: true,
            org: "acme".to_string(),
            project: "prod".to_string(),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let config = WebhookConfig {
        max_attempts: 2,
        base_backoff_ms: 10,
        max_backoff_ms: 20,
        attempt_timeout_secs: 1,
        ..Default::default()
    };
    let deliverer = Arc::new(Deliverer::new(f.store.clone(), &config));
    let worker = Arc::new(WebhookWorker::new(
        f.gateway.clone(),
        f.store.clone(),
        f.dlq.clone(),
        deliverer,
        config,
    ));
    let shutdown = CancellationToken::new();
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    f.publisher
        .publish(&tenant(), "orders.new", serde_json::json!({}))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let entries = loop {
        let entries = f.dlq.list(&tenant(), None, 10).await.unwrap();
        if !entries.is_empty() {
            break entries;
        }
        assert!(tokio::time::Instant::now() < deadline, "DLQ entry never appeared");
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    assert_eq!(entries[0].envelope.attempts, 2);
    assert_eq!(entries[0].envelope.consumer_group, "webhook:wh-dead");
    assert!(!entries[0].envelope.last_error.is_empty());

    shutdown.cancel();
    let _ = worker_task.await;
}

#[tokio::test]
async fn tenant_isolation_across_streams() {
    let f = fixture();
    let rival = Tenant::new("rival", "prod");

    f.publisher
        .publish(&tenant(), "orders.new", serde_json::json!({"who": "acme"}))
        .await
        .unwrap();
    f.publisher
        .publish(&rival, "orders.new", serde_json::json!({"who": "rival"}))
        .await
        .unwrap();

    // A rival subscriber on the same topic never sees acme's event
    let mut binding = f
        .consumers
        .bind(&rival, &patterns(&["orders.*"]), &broadcast_from_beginning())
        .await
        .unwrap();
    let (event, _, msg) = next_event(&mut binding.consumer).await;
    assert_eq!(event.org, "rival");
    msg.ack().await.unwrap();
    assert!(tokio::time::timeout(Duration::from_millis(200), binding.consumer.next())
        .await
        .is_err());
    f.consumers.release(binding.ticket).await;
}
