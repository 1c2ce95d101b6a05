//! Message recorder: subscribes to `*`, writes each message to the log
//! store.
//!
//! A store write failure is logged and counted, never fatal — a full
//! disk must not kill the coordinator.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sgm_bus::{Bus, Subscription};
use sgm_protocol::Timestamp;
use sgm_store::Store;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exposed to the status responder as `_recorder_failed_writes` — a
/// logged error plus a counter, without pulling in a dedicated metrics
/// crate no service in this workspace otherwise uses.
#[derive(Default)]
pub struct RecorderMetrics {
    pub failed_writes: AtomicU64,
}

/// `sub` must already be subscribed (to `Topics::All`) before this task is
/// spawned, so the subscription exists in the bus before any ingress task
/// can publish to it.
pub async fn run(
    bus: Arc<Bus>,
    mut sub: Subscription,
    store: Arc<Mutex<Store>>,
    metrics: Arc<RecorderMetrics>,
    cancel: CancellationToken,
) {
    info!("message recorder: started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                bus.unsubscribe(sub.id).await;
                info!("message recorder: cancelled");
                return;
            }
            envelope = sub.rx.recv() => {
                let Some(envelope) = envelope else {
                    info!("message recorder: bus closed");
                    return;
                };
                let ts = if envelope.message.timestamp.is_zero() {
                    Timestamp::now()
                } else {
                    envelope.message.timestamp
                };
                let text = if envelope.message.text.is_empty() {
                    envelope.topic.to_string()
                } else {
                    envelope.message.text.clone()
                };
                let store = store.clone();
                let sender = envelope.message.sender.clone();
                let result = tokio::task::spawn_blocking(move || {
                    store.blocking_lock().record_message(ts, &sender, &text)
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        metrics.failed_writes.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "message recorder: store write failed");
                    }
                    Err(e) => {
                        metrics.failed_writes.fetch_add(1, Ordering::Relaxed);
                        error!(error = %e, "message recorder: blocking task panicked");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgm_bus::Topics;
    use sgm_protocol::Message;
    use std::time::Duration;

    #[tokio::test]
    async fn fills_in_zero_timestamp_and_empty_text_then_records() {
        let bus = Bus::new();
        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));
        let metrics = Arc::new(RecorderMetrics::default());
        let cancel = CancellationToken::new();
        let serno = sgm_protocol::Serno::parse("SG-0000000000AA").unwrap();

        let sub = bus.subscribe(Topics::All).await;
        let run_bus = bus.clone();
        let run_store = store.clone();
        let run_metrics = metrics.clone();
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run(run_bus, sub, run_store, run_metrics, run_cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // topic '2' (sync-launched) with empty text: recorder fills text
        // from the topic, so last_sync_time should find this row.
        bus.publish('2', Message::new(Timestamp::ZERO, serno.as_str(), ""))
            .await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let ts = store.lock().await.last_sync_time(&serno).unwrap();
        assert!(ts.is_some(), "recorder should have written the row with text filled from topic");
        assert_eq!(metrics.failed_writes.load(Ordering::Relaxed), 0);

        cancel.cancel();
        let _ = handle.await;
    }
}
