//! Coordinator library: wires the bus, store, registry, ingress sources
//! and consumers together behind one `run` entry point.

pub mod config;
pub mod consumers;
pub mod ingress;
pub mod ssh;

use std::sync::Arc;

use regex::Regex;
use sgm_bus::{Bus, Topics};
use sgm_protocol::topic;
use sgm_registry::Registry;
use sgm_store::Store;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::consumers::recorder::RecorderMetrics;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("opening store at {path}: {source}")]
    Store {
        path: std::path::PathBuf,
        #[source]
        source: sgm_store::StoreError,
    },
    #[error("invalid semaphore regex {pattern:?}: {source}")]
    BadRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Builds every shared resource, spawns all ingress and consumer tasks,
/// and returns once `cancel` fires and each task has wound down.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<(), StartError> {
    let store = Arc::new(Mutex::new(Store::open(&config.store_path).map_err(
        |source| StartError::Store {
            path: config.store_path.clone(),
            source,
        },
    )?));
    let registry = Registry::new();
    let bus = Bus::new();
    let recorder_metrics = Arc::new(RecorderMetrics::default());
    let ssh_config = Arc::new(config.ssh.clone());
    let semaphore_pattern =
        Regex::new(&config.semaphore_regex).map_err(|source| StartError::BadRegex {
            pattern: config.semaphore_regex.clone(),
            source,
        })?;

    // Every bus-subscribing consumer subscribes here, synchronously,
    // before any ingress task is spawned. `tokio::spawn` does not block
    // on the spawned task reaching any particular point, so a consumer
    // that subscribed from inside its own task body could still be
    // unsubscribed when the connection watcher's bootstrap enumeration
    // (ingress::fs_watcher, which runs almost immediately after it
    // starts) publishes the initial `connect` for every pre-existing
    // semaphore file — the bus only delivers to subscriptions that
    // already exist (sgm-bus's `publish` walks `entries` as found).
    let recorder_sub = bus.subscribe(Topics::All).await;
    let aggregator_sub = bus.subscribe(Topics::All).await;
    let sync_manager_sub = bus
        .subscribe(Topics::Set([topic::CONNECT, topic::DISCONNECT].into()))
        .await;

    let mut handles = Vec::new();

    handles.push(tokio::spawn(ingress::fs_watcher::run(
        bus.clone(),
        config.semaphore_dir.clone(),
        semaphore_pattern,
        cancel.child_token(),
    )));
    handles.push(tokio::spawn(ingress::trusted_stream::run(
        bus.clone(),
        config.trusted_stream_bind.clone(),
        cancel.child_token(),
    )));
    handles.push(tokio::spawn(ingress::datagram::run_trusted(
        bus.clone(),
        config.udp_trusted_bind.clone(),
        cancel.child_token(),
    )));
    handles.push(tokio::spawn(ingress::datagram::run_untrusted(
        bus.clone(),
        config.udp_untrusted_bind.clone(),
        cancel.child_token(),
    )));

    handles.push(tokio::spawn(consumers::recorder::run(
        bus.clone(),
        recorder_sub,
        store.clone(),
        recorder_metrics.clone(),
        cancel.child_token(),
    )));
    handles.push(tokio::spawn(consumers::aggregator::run(
        bus.clone(),
        aggregator_sub,
        registry.clone(),
        store.clone(),
        cancel.child_token(),
    )));
    handles.push(tokio::spawn(consumers::sync_manager::run(
        bus.clone(),
        sync_manager_sub,
        registry.clone(),
        store.clone(),
        ssh_config,
        (config.sync_window_lo_minutes, config.sync_window_hi_minutes),
        cancel.child_token(),
    )));
    handles.push(tokio::spawn(consumers::status_responder::run(
        registry.clone(),
        recorder_metrics.clone(),
        config.status_bind.clone(),
        cancel.child_token(),
    )));

    info!("coordinator: all tasks started");
    cancel.cancelled().await;
    info!("coordinator: shutdown signal received, waiting for tasks to wind down");

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "coordinator: task panicked during shutdown");
        }
    }
    info!("coordinator: shutdown complete");
    Ok(())
}
