//! Sync manager and workers.
//!
//! Subscribes to `connect`/`disconnect`. Maintains a private
//! `Serno -> CancellationToken` map (accessed only from this task, so no
//! lock is needed). A worker is spawned on the first `connect` for a
//! serno lacking one, and cancelled on the matching `disconnect` or on
//! coordinator shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use sgm_bus::{Bus, Subscription};
use sgm_protocol::{topic, Message, Serno, Timestamp};
use sgm_registry::Registry;
use sgm_store::Store;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SshConfig;
use crate::consumers::aggregator::load_init;
use crate::ssh;

/// `sub` must already be subscribed (to `connect`/`disconnect`) before
/// this task is spawned, so the subscription exists in the bus before any
/// ingress task can publish to it.
pub async fn run(
    bus: Arc<Bus>,
    mut sub: Subscription,
    registry: Arc<Registry>,
    store: Arc<Mutex<Store>>,
    ssh_config: Arc<SshConfig>,
    sync_window: (f64, f64),
    cancel: CancellationToken,
) {
    let mut workers: HashMap<Serno, CancellationToken> = HashMap::new();
    info!("sync manager: started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                bus.unsubscribe(sub.id).await;
                for (serno, token) in workers.drain() {
                    debug!(%serno, "sync manager: cancelling worker on shutdown");
                    token.cancel();
                }
                info!("sync manager: cancelled");
                return;
            }
            envelope = sub.rx.recv() => {
                let Some(envelope) = envelope else {
                    info!("sync manager: bus closed");
                    return;
                };
                let Ok(serno) = Serno::parse(&envelope.message.sender) else {
                    continue;
                };
                match envelope.topic {
                    topic::CONNECT => {
                        if workers.contains_key(&serno) {
                            // Duplicate connect (watcher bootstrap race) is a no-op.
                            continue;
                        }
                        // The aggregator subscribes to the same `connect` and
                        // may or may not have created the record yet — both
                        // tasks call `load_or_create` with the same
                        // store-backed initializer, so whichever wins the
                        // race produces an identical record (sgm-registry's
                        // exactly-once-init guarantee, sgm-registry/src/lib.rs).
                        let store = store.clone();
                        let serno_for_init = serno.clone();
                        let ts = envelope.message.timestamp;
                        let record = registry
                            .load_or_create(&serno, move || async move {
                                load_init(store, serno_for_init, ts).await
                            })
                            .await;
                        let worker_cancel = cancel.child_token();
                        workers.insert(serno.clone(), worker_cancel.clone());
                        let bus = bus.clone();
                        let ssh_config = ssh_config.clone();
                        tokio::spawn(async move {
                            run_worker(bus, record, ssh_config, sync_window, worker_cancel).await;
                        });
                    }
                    topic::DISCONNECT => {
                        if let Some(token) = workers.remove(&serno) {
                            token.cancel();
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

/// One receiver's sync loop: wait a random delay, then (if still
/// connected) open/refresh the reverse tunnel and trigger an upstream
/// sync by touching a marker file, both via SSH.
async fn run_worker(
    bus: Arc<Bus>,
    record: Arc<sgm_registry::ActiveSg>,
    ssh_config: Arc<SshConfig>,
    sync_window: (f64, f64),
    cancel: CancellationToken,
) {
    let serno = record.serno.clone();
    let tunnel_port = record.tunnel_port;
    debug!(%serno, tunnel_port, "sync worker: started");

    loop {
        let delay = random_delay(sync_window.0, sync_window.1);
        let fire_at = Timestamp::now().plus(delay);
        bus.publish(
            topic::SYNC_PENDING,
            Message::new(fire_at, serno.as_str(), ""),
        )
        .await;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(%serno, "sync worker: cancelled while waiting");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        if !record.connected().await {
            debug!(%serno, "sync worker: disconnected at timer fire, exiting");
            return;
        }

        match ssh::trigger_sync(&ssh_config, &serno, tunnel_port).await {
            Ok(()) => {
                bus.publish(
                    topic::SYNC_LAUNCHED,
                    Message::new(Timestamp::now(), serno.as_str(), ""),
                )
                .await;
            }
            Err(e) => {
                warn!(%serno, error = %e, "sync worker: sync attempt failed, will retry next cycle");
            }
        }
    }
}

fn random_delay(lo_minutes: f64, hi_minutes: f64) -> Duration {
    let (lo, hi) = if lo_minutes <= hi_minutes {
        (lo_minutes, hi_minutes)
    } else {
        (hi_minutes, lo_minutes)
    };
    let minutes = if hi > lo {
        rand::thread_rng().gen_range(lo..hi)
    } else {
        lo
    };
    Duration::from_secs_f64((minutes * 60.0).max(0.0))
}
