//! Per-delivery processing for one subscription

use crate::dispatch::handler::{EventContext, HandlerError, HandlerRegistry, HandlerResult};
use crate::dispatch::retry::FailureAction;
use crate::dispatch::DispatchSettings;
use crate::messaging::metrics::{HANDLER_DURATION_SECONDS, MESSAGES_PROCESSED_TOTAL};
use crate::messaging::{BrokerChannel, Delivery, EventEnvelope, EventKind, TopologyEntry};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Terminal outcome of a single delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Handler succeeded, message acked
    Acked,
    /// Nacked with requeue
    Requeued,
    /// Republished with the next attempt number, original acked
    Retried,
    /// Published to the dead-letter queue, original acked
    DeadLettered,
    /// Nacked without requeue
    Rejected,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acked => "acked",
            Disposition::Requeued => "requeued",
            Disposition::Retried => "retried",
            Disposition::DeadLettered => "dead_lettered",
            Disposition::Rejected => "rejected",
        }
    }
}

/// Everything a subscription task needs to settle deliveries
#[derive(Clone)]
pub(crate) struct SubscriptionContext {
    pub kind: EventKind,
    pub exchange: String,
    pub entry: TopologyEntry,
    pub channel: Arc<dyn BrokerChannel>,
    pub registry: Arc<HandlerRegistry>,
    pub settings: DispatchSettings,
}

/// Decode, dispatch and settle one delivery. Exactly one ack or nack is
/// issued for it.
pub(crate) async fn process_delivery(ctx: &SubscriptionContext, delivery: Delivery) -> Disposition {
    let envelope = match EventEnvelope::from_slice(&delivery.body) {
        Ok(envelope) => envelope,
        Err(e) => {
            error!(
                event_kind = %ctx.kind,
                queue = %ctx.entry.queue_name,
                delivery_tag = delivery.delivery_tag,
                message_id = ?delivery.message_id,
                error = %e,
                "Malformed message, rejecting without requeue"
            );
            let disposition = settle_nack(delivery, false).await;
            record(ctx.kind, disposition);
            return disposition;
        }
    };

    if envelope.kind() != ctx.kind {
        warn!(
            queue = %ctx.entry.queue_name,
            expected = %ctx.kind,
            received = %envelope.kind(),
            event_id = %envelope.id,
            "Event kind does not match its queue, dispatching by event kind"
        );
    }

    let event_ctx = EventContext {
        event_id: envelope.id,
        occurred_at: envelope.occurred_at,
        attempt: delivery.attempt,
        redelivered: delivery.redelivered,
    };

    debug!(
        event_kind = %envelope.kind(),
        event_id = %envelope.id,
        attempt = delivery.attempt,
        redelivered = delivery.redelivered,
        "Dispatching event"
    );

    let started = Instant::now();
    let result = invoke(ctx, &event_ctx, &envelope).await;
    HANDLER_DURATION_SECONDS
        .with_label_values(&[envelope.kind().as_ref()])
        .observe(started.elapsed().as_secs_f64());

    let disposition = match result {
        Ok(()) => {
            info!(
                event_kind = %envelope.kind(),
                event_id = %envelope.id,
                entity_id = %envelope.event.entity_id(),
                attempt = delivery.attempt,
                "Event handled"
            );
            settle_ack(delivery).await
        }
        Err(e) if !e.is_retryable() => {
            error!(
                event_kind = %envelope.kind(),
                event_id = %envelope.id,
                error = %e,
                "Event cannot be handled, rejecting without requeue"
            );
            settle_nack(delivery, false).await
        }
        Err(e) => {
            warn!(
                event_kind = %envelope.kind(),
                event_id = %envelope.id,
                attempt = delivery.attempt,
                error = %e,
                "Handler failed"
            );
            handle_failure(ctx, &envelope, delivery).await
        }
    };

    record(envelope.kind(), disposition);
    disposition
}

async fn invoke(ctx: &SubscriptionContext, event_ctx: &EventContext, envelope: &EventEnvelope) -> HandlerResult {
    let call = ctx.registry.dispatch(event_ctx, &envelope.event);
    match ctx.settings.handler_timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::TimedOut(limit)),
        },
        None => call.await,
    }
}

async fn handle_failure(ctx: &SubscriptionContext, envelope: &EventEnvelope, delivery: Delivery) -> Disposition {
    match ctx.settings.retry.on_failure(delivery.attempt) {
        FailureAction::Requeue => settle_nack(delivery, true).await,
        FailureAction::Retry { next_attempt, delay } => {
            debug!(
                event_id = %envelope.id,
                next_attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry"
            );
            tokio::time::sleep(delay).await;

            let mut message = delivery.to_outbound(&envelope.id.to_string());
            message.attempt = next_attempt;
            match ctx.channel.publish(&ctx.exchange, &ctx.entry.routing_key, message).await {
                Ok(true) => match settle_ack(delivery).await {
                    Disposition::Acked => Disposition::Retried,
                    other => other,
                },
                Ok(false) => {
                    warn!(event_id = %envelope.id, "Broker declined retry republish, requeueing");
                    settle_nack(delivery, true).await
                }
                Err(e) => {
                    warn!(event_id = %envelope.id, error = %e, "Retry republish failed, requeueing");
                    settle_nack(delivery, true).await
                }
            }
        }
        FailureAction::DeadLetter => {
            let routing_key = ctx.entry.dead_letter_routing_key();
            let message = delivery.to_outbound(&envelope.id.to_string());
            match ctx.channel.publish(&ctx.exchange, &routing_key, message).await {
                Ok(true) => {
                    error!(
                        event_kind = %envelope.kind(),
                        event_id = %envelope.id,
                        attempts = delivery.attempt,
                        dead_letter_queue = %ctx.entry.dead_letter_queue(),
                        "Retries exhausted, event dead-lettered"
                    );
                    match settle_ack(delivery).await {
                        Disposition::Acked => Disposition::DeadLettered,
                        other => other,
                    }
                }
                Ok(false) => {
                    warn!(event_id = %envelope.id, "Broker declined dead-letter publish, requeueing");
                    settle_nack(delivery, true).await
                }
                Err(e) => {
                    warn!(event_id = %envelope.id, error = %e, "Dead-letter publish failed, requeueing");
                    settle_nack(delivery, true).await
                }
            }
        }
        FailureAction::Discard => {
            error!(
                event_kind = %envelope.kind(),
                event_id = %envelope.id,
                attempts = delivery.attempt,
                "Retries exhausted, discarding event"
            );
            settle_nack(delivery, false).await
        }
    }
}

async fn settle_ack(delivery: Delivery) -> Disposition {
    let tag = delivery.delivery_tag;
    if let Err(e) = delivery.ack().await {
        // The broker redelivers once the channel closes
        error!(delivery_tag = tag, error = %e, "Failed to ack delivery");
    }
    Disposition::Acked
}

async fn settle_nack(delivery: Delivery, requeue: bool) -> Disposition {
    let tag = delivery.delivery_tag;
    if let Err(e) = delivery.nack(requeue).await {
        error!(delivery_tag = tag, requeue, error = %e, "Failed to nack delivery");
    }
    if requeue {
        Disposition::Requeued
    } else {
        Disposition::Rejected
    }
}

fn record(kind: EventKind, disposition: Disposition) {
    MESSAGES_PROCESSED_TOTAL
        .with_label_values(&[kind.as_ref(), disposition.as_str()])
        .inc();
}
