mod common;

use chrono::Utc;
use common::{orchestrator, queue_depths, recv, FailingHandler, RecordingHandler};
use std::sync::Arc;
use std::time::Duration;
use storefront_event_dispatcher::dispatch::{
    DispatchSettings, EventContext, EventHandler, HandlerRegistry, HandlerResult, OrchestratorState,
    RetryPolicy,
};
use storefront_event_dispatcher::messaging::{
    default_entry, BrokerChannel, ConnectionManager, DomainEvent, EventKind, InMemoryBroker, InvoiceGeneration,
    LowStockAlert, NewCustomerRegistration, NewOrderCreation, NewProductCreation, OrderLine,
    OrderSnapshot, OutboundMessage, Publisher, Topology, CONTENT_TYPE_JSON,
};

fn low_stock() -> LowStockAlert {
    LowStockAlert {
        product_id: "P-1".to_string(),
        product_name: "Desk lamp".to_string(),
        sku: Some("LAMP-1".to_string()),
        current_stock: 1,
        threshold: 5,
    }
}

fn line() -> OrderLine {
    OrderLine {
        product_id: "P-1".to_string(),
        description: "Desk lamp".to_string(),
        quantity: 1,
        unit_price: 25.0,
    }
}

fn order() -> NewOrderCreation {
    NewOrderCreation {
        order_id: "O-1".to_string(),
        order_number: "1001".to_string(),
        customer_id: "C-1".to_string(),
        customer_email: None,
        lines: vec![line()],
        total: 25.0,
        currency: "USD".to_string(),
    }
}

fn invoice(order_id: &str) -> InvoiceGeneration {
    InvoiceGeneration {
        order_id: order_id.to_string(),
        order_number: "1001".to_string(),
        customer_email: Some("ada@example.com".to_string()),
        customer_id: None,
        order: OrderSnapshot {
            lines: vec![line()],
            subtotal: 25.0,
            tax: 2.5,
            total: 27.5,
            currency: "USD".to_string(),
            placed_at: Utc::now(),
        },
    }
}

fn sample_events() -> Vec<DomainEvent> {
    vec![
        low_stock().into(),
        NewCustomerRegistration {
            customer_id: "C-1".to_string(),
            name: "Ada".to_string(),
            email: "ada@example.com".to_string(),
            phone: None,
        }
        .into(),
        NewProductCreation {
            product_id: "P-2".to_string(),
            name: "Chair".to_string(),
            sku: None,
            price: 80.0,
            currency: "USD".to_string(),
            initial_stock: 4,
        }
        .into(),
        order().into(),
        invoice("O-1").into(),
    ]
}

fn fast_retry(max_attempts: u32, dead_letter: bool) -> DispatchSettings {
    DispatchSettings {
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            dead_letter,
        },
        ..DispatchSettings::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_invoice_lands_only_in_invoice_queue() {
    let broker = InMemoryBroker::new();
    let (handler, mut rx) = RecordingHandler::<InvoiceGeneration>::new();
    let orchestrator = orchestrator(
        &broker,
        HandlerRegistry::new().on_invoice_generation(handler),
        DispatchSettings::default(),
    );

    let publisher = Publisher::new(orchestrator.connection().clone());
    let envelope = publisher.publish_event(invoice("O-1001")).await.unwrap();

    for (queue, depth) in queue_depths(&broker) {
        let expected = usize::from(queue == "invoices.generation");
        assert_eq!(depth, expected, "unexpected depth for {}", queue);
    }

    orchestrator.start_all().await.unwrap();
    let (ctx, event) = recv(&mut rx).await;
    assert_eq!(event.order_id, "O-1001");
    assert_eq!(ctx.event_id, envelope.id);

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_every_kind_routes_to_its_own_queue() {
    let broker = InMemoryBroker::new();
    let connection = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), Topology::default()));
    let publisher = Publisher::new(connection);

    for event in sample_events() {
        let kind = event.kind();
        let envelope = publisher.publish_event(event).await.unwrap();

        let queue = default_entry(kind).queue_name;
        let queued = broker.peek(&queue);
        assert_eq!(queued.len(), 1, "{} should hold one message", queue);
        assert_eq!(queued[0].message_id, envelope.id.to_string());
    }

    let total: usize = queue_depths(&broker).values().sum();
    assert_eq!(total, EventKind::all().len());
}

#[tokio::test]
async fn test_failing_handler_sees_redelivery() {
    let broker = InMemoryBroker::new();
    let (handler, mut rx) = FailingHandler::<LowStockAlert>::new();
    let settings = DispatchSettings {
        retry: RetryPolicy::unbounded(),
        ..DispatchSettings::default()
    };
    let orchestrator = orchestrator(&broker, HandlerRegistry::new().on_low_stock_alert(handler), settings);
    orchestrator.start_all().await.unwrap();

    let publisher = Publisher::new(orchestrator.connection().clone());
    let envelope = publisher.publish_event(low_stock()).await.unwrap();

    let (first, _) = recv(&mut rx).await;
    let (second, _) = recv(&mut rx).await;
    assert_eq!(first.event_id, envelope.id);
    assert_eq!(second.event_id, envelope.id);
    assert!(second.redelivered);

    orchestrator.stop().await;
    assert_eq!(broker.queue_depth("inventory.low_stock_alert"), Some(1));
}

#[tokio::test]
async fn test_bounded_retries_end_in_dead_letter_queue() {
    let broker = InMemoryBroker::new();
    let (handler, mut rx) = FailingHandler::<LowStockAlert>::new();
    let orchestrator = orchestrator(
        &broker,
        HandlerRegistry::new().on_low_stock_alert(handler),
        fast_retry(3, true),
    );
    orchestrator.start_all().await.unwrap();

    let publisher = Publisher::new(orchestrator.connection().clone());
    let envelope = publisher.publish_event(low_stock()).await.unwrap();

    let mut attempts = Vec::new();
    for _ in 0..3 {
        let (ctx, _) = recv(&mut rx).await;
        assert_eq!(ctx.event_id, envelope.id);
        attempts.push(ctx.attempt);
    }
    assert_eq!(attempts, vec![1, 2, 3]);

    wait_until(|| broker.queue_depth("inventory.low_stock_alert.dead_letter") == Some(1)).await;
    let dead = broker.peek("inventory.low_stock_alert.dead_letter");
    assert_eq!(dead[0].message_id, envelope.id.to_string());
    assert_eq!(broker.queue_depth("inventory.low_stock_alert"), Some(0));

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_every_delivery_settled_exactly_once() {
    let broker = InMemoryBroker::new();
    let (orders, mut order_rx) = RecordingHandler::<NewOrderCreation>::new();
    let (alerts, mut alert_rx) = FailingHandler::<LowStockAlert>::new();
    let (customers, _customer_rx) = RecordingHandler::<NewCustomerRegistration>::new();
    let registry = HandlerRegistry::new()
        .on_new_order_creation(orders)
        .on_low_stock_alert(alerts)
        .on_new_customer_registration(customers);
    let orchestrator = orchestrator(&broker, registry, fast_retry(2, false));
    orchestrator.start_all().await.unwrap();

    let publisher = Publisher::new(orchestrator.connection().clone());
    publisher.publish_event(order()).await.unwrap();
    publisher.publish_event(low_stock()).await.unwrap();

    let channel = orchestrator.connection().channel().unwrap();
    let garbage = OutboundMessage {
        body: b"not an envelope".to_vec(),
        message_id: "garbage".to_string(),
        timestamp: Utc::now(),
        event_type: "NewCustomerRegistration".to_string(),
        content_type: CONTENT_TYPE_JSON.to_string(),
        persistent: true,
        attempt: 1,
    };
    channel
        .publish("storefront.events", "customer.registered", garbage)
        .await
        .unwrap();

    recv(&mut order_rx).await;
    recv(&mut alert_rx).await;
    recv(&mut alert_rx).await;

    // order, two low-stock attempts, garbage
    wait_until(|| {
        let stats = broker.stats();
        stats.delivered == 4 && broker.unacked_count() == 0
    })
    .await;

    let stats = broker.stats();
    assert_eq!(stats.delivered, stats.acked + stats.requeued + stats.rejected);
    assert_eq!(stats.rejected, 2);
    assert!(queue_depths(&broker).values().all(|depth| *depth == 0));

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_nothing_delivered_after_stop() {
    let broker = InMemoryBroker::new();
    let (handler, mut rx) = RecordingHandler::<LowStockAlert>::new();
    let orchestrator = orchestrator(
        &broker,
        HandlerRegistry::new().on_low_stock_alert(handler),
        DispatchSettings::default(),
    );
    orchestrator.start_all().await.unwrap();
    orchestrator.stop().await;

    assert!(!orchestrator.connection().is_ready());
    assert_eq!(orchestrator.state(), OrchestratorState::Idle);

    let other = Arc::new(ConnectionManager::new(Arc::new(broker.clone()), Topology::default()));
    Publisher::new(other).publish_event(low_stock()).await.unwrap();

    let received = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(received.is_err(), "handler ran after stop");
    assert_eq!(broker.queue_depth("inventory.low_stock_alert"), Some(1));
}

#[tokio::test]
async fn test_restart_reaches_running_with_same_registrations() {
    let broker = InMemoryBroker::new();
    let (alerts, mut rx) = RecordingHandler::<LowStockAlert>::new();
    let (orders, _order_rx) = RecordingHandler::<NewOrderCreation>::new();
    let orchestrator = orchestrator(
        &broker,
        HandlerRegistry::new().on_low_stock_alert(alerts).on_new_order_creation(orders),
        DispatchSettings::default(),
    );

    let first = orchestrator.start_all().await.unwrap();
    orchestrator.stop().await;
    let second = orchestrator.start_all().await.unwrap();

    assert_eq!(second.state, OrchestratorState::Running);
    assert_eq!(first.registered_kinds, second.registered_kinds);
    assert_eq!(first.active_kinds, second.active_kinds);
    assert_eq!(broker.consumer_count("inventory.low_stock_alert"), 1);

    // The restarted subscription still delivers
    let publisher = Publisher::new(orchestrator.connection().clone());
    publisher.publish_event(low_stock()).await.unwrap();
    let (_, event) = recv(&mut rx).await;
    assert_eq!(event.product_id, "P-1");

    orchestrator.stop().await;
}

#[tokio::test]
async fn test_unacked_delivery_requeued_on_stop() {
    struct Hang;

    #[async_trait::async_trait]
    impl EventHandler<LowStockAlert> for Hang {
        async fn handle(&self, _ctx: &EventContext, _event: &LowStockAlert) -> HandlerResult {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    let broker = InMemoryBroker::new();
    let settings = DispatchSettings {
        handler_timeout: None,
        ..DispatchSettings::default()
    };
    let orchestrator = orchestrator(&broker, HandlerRegistry::new().on_low_stock_alert(Hang), settings);
    orchestrator.start_all().await.unwrap();

    let publisher = Publisher::new(orchestrator.connection().clone());
    publisher.publish_event(low_stock()).await.unwrap();
    wait_until(|| broker.unacked_count() == 1).await;

    orchestrator.stop().await;

    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth("inventory.low_stock_alert"), Some(1));
}
