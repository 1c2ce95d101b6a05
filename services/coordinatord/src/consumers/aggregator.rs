//! State aggregator: subscribes to `*`, updates the live-state record for
//! the sender of every Serno-sourced message.

use std::sync::Arc;

use sgm_bus::{Bus, Subscription};
use sgm_protocol::{topic, Serno};
use sgm_registry::{ActiveSgInit, Registry};
use sgm_store::Store;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// `sub` must already be subscribed (to `Topics::All`) before this task is
/// spawned, so the subscription exists in the bus before any ingress task
/// can publish to it.
pub async fn run(
    bus: Arc<Bus>,
    mut sub: Subscription,
    registry: Arc<Registry>,
    store: Arc<Mutex<Store>>,
    cancel: CancellationToken,
) {
    info!("state aggregator: started");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                bus.unsubscribe(sub.id).await;
                info!("state aggregator: cancelled");
                return;
            }
            envelope = sub.rx.recv() => {
                let Some(envelope) = envelope else {
                    info!("state aggregator: bus closed");
                    return;
                };
                let Ok(serno) = Serno::parse(&envelope.message.sender) else {
                    continue;
                };
                let store = store.clone();
                let serno_for_init = serno.clone();
                let ts = envelope.message.timestamp;
                let record = registry
                    .load_or_create(&serno, move || async move {
                        load_init(store, serno_for_init, ts).await
                    })
                    .await;

                match envelope.topic {
                    topic::CONNECT => record.apply_connect(envelope.message.timestamp).await,
                    topic::DISCONNECT => record.apply_disconnect().await,
                    topic::SYNC_LAUNCHED => {
                        record.set_ts_last_sync(envelope.message.timestamp).await
                    }
                    topic::SYNC_PENDING => {
                        record.set_ts_next_sync(envelope.message.timestamp).await
                    }
                    _ => {}
                }
            }
        }
    }
}

/// Bootstraps a brand-new record's initial values from the store: last
/// sync time and tunnel port, with `ts_conn` set to the timestamp of the
/// message that triggered record creation, not wall-clock time. Runs
/// under the registry's per-serno serialization, so it executes at most
/// once per serno no matter which consumer's `load_or_create` call wins
/// the race to create the record — the sync manager
/// (`consumers::sync_manager`) shares this initializer for exactly that
/// reason.
pub(crate) async fn load_init(
    store: Arc<Mutex<Store>>,
    serno: Serno,
    ts_conn: sgm_protocol::Timestamp,
) -> ActiveSgInit {
    tokio::task::spawn_blocking(move || {
        let store = store.blocking_lock();
        let ts_last_sync = store
            .last_sync_time(&serno)
            .unwrap_or(None)
            .unwrap_or(sgm_protocol::Timestamp::ZERO);
        let tunnel_port = store.tunnel_port(&serno).unwrap_or(None).unwrap_or(0);
        ActiveSgInit {
            ts_conn,
            ts_last_sync,
            tunnel_port,
            connected: true,
        }
    })
    .await
    .unwrap_or(ActiveSgInit {
        ts_conn,
        ts_last_sync: sgm_protocol::Timestamp::ZERO,
        tunnel_port: 0,
        connected: true,
    })
}
