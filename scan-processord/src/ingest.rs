//! Subscription consumer: decode, normalize, persist, then acknowledge.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use shared::types::ScanRecord;

use crate::bus::{BusMessage, MessageSource};
use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::normalize;
use crate::store::UpsertOutcome;
use crate::store_manager::StoreHandle;

/// Run one message body through the pipeline.
///
/// A stale observation is `Ok(UpsertOutcome::Stale)`: it was processed
/// successfully and must be acknowledged like a written one.
pub async fn process_message(body: &[u8], store: &StoreHandle) -> Result<UpsertOutcome, IngestError> {
    let record: ScanRecord = serde_json::from_slice(body)?;
    let canonical = normalize::canonicalize(record)?;
    let key = canonical.key.clone();
    let timestamp = canonical.timestamp;

    let outcome = store.upsert(canonical).await?;
    if outcome.written() {
        debug!(%key, timestamp, "Stored scan");
    } else {
        debug!(%key, timestamp, "Skipped scan older than stored one");
    }
    Ok(outcome)
}

/// Process one delivery and acknowledge it only if the pipeline succeeded.
/// Returns whether the message was acknowledged.
pub async fn handle_delivery<S: MessageSource + ?Sized>(
    source: &S,
    store: &StoreHandle,
    message: BusMessage,
) -> bool {
    match process_message(&message.data, store).await {
        Ok(_) => match source.ack(&message.ack_id).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to acknowledge message, it will be redelivered"
                );
                false
            }
        },
        Err(e @ IngestError::Persistence(_)) => {
            error!(
                kind = e.kind(),
                message_id = %message.message_id,
                delivery_attempt = ?message.delivery_attempt,
                error = %e,
                "Failed to process message, leaving unacknowledged"
            );
            false
        }
        Err(e) => {
            warn!(
                kind = e.kind(),
                message_id = %message.message_id,
                publish_time = ?message.publish_time,
                delivery_attempt = ?message.delivery_attempt,
                error = %e,
                "Rejected message, leaving unacknowledged"
            );
            false
        }
    }
}

/// Pull messages until cancelled, processing up to `max_in_flight` at once.
///
/// Permits are reserved before each pull and the pull asks for no more
/// messages than were reserved, so a pulled message is dispatched at once
/// instead of aging towards its ack deadline in a queue.
///
/// On cancellation no further messages are pulled or dispatched; messages
/// already being processed finish their persist-then-ack sequence before
/// this returns.
pub async fn run<S: MessageSource + 'static>(
    source: Arc<S>,
    store: StoreHandle,
    config: IngestConfig,
    cancel: CancellationToken,
) {
    let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    let batch_limit = config.max_messages.max(1) as usize;
    let mut in_flight = JoinSet::new();

    info!(
        max_messages = config.max_messages,
        max_in_flight = config.max_in_flight,
        "Ingestion loop started"
    );

    'pull: loop {
        while let Some(joined) = in_flight.try_join_next() {
            log_join_error(joined);
        }

        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'pull,
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break 'pull,
            },
        };
        let mut reserved = vec![first];
        while reserved.len() < batch_limit {
            match permits.clone().try_acquire_owned() {
                Ok(permit) => reserved.push(permit),
                Err(_) => break,
            }
        }

        let pulled = tokio::select! {
            biased;
            _ = cancel.cancelled() => break 'pull,
            pulled = source.pull(reserved.len() as u32) => pulled,
        };

        let messages = match pulled {
            Ok(messages) => messages,
            Err(e) => {
                error!(error = %e, "Failed to pull messages");
                drop(reserved);
                if sleep_or_cancel(config.error_backoff(), &cancel).await {
                    break 'pull;
                }
                continue;
            }
        };

        if messages.is_empty() {
            drop(reserved);
            if sleep_or_cancel(config.idle_backoff(), &cancel).await {
                break 'pull;
            }
            continue;
        }

        if messages.len() > reserved.len() {
            warn!(
                pulled = messages.len(),
                requested = reserved.len(),
                "Bus returned more messages than requested, surplus will be redelivered"
            );
        }

        // Unused permits are released when `reserved` drops
        for (message, permit) in messages.into_iter().zip(reserved) {
            if let Some(attempt) = message.delivery_attempt.filter(|attempt| *attempt > 1) {
                debug!(message_id = %message.message_id, delivery_attempt = attempt, "Redelivered message");
            }

            let source = Arc::clone(&source);
            let store = store.clone();
            in_flight.spawn(async move {
                handle_delivery(source.as_ref(), &store, message).await;
                drop(permit);
            });
        }
    }

    info!(in_flight = in_flight.len(), "Ingestion loop stopping, draining in-flight messages");
    while let Some(joined) = in_flight.join_next().await {
        log_join_error(joined);
    }
    info!("Ingestion loop stopped");
}

/// Returns true if cancelled before the sleep finished.
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Message task failed");
    }
}
