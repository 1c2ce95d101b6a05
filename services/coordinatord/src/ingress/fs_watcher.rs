//! Connection watcher: emits `connect`/`disconnect` from the appearance and
//! removal of semaphore files in a directory (default `/dev/shm`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use notify::{Event, EventKind, RecursiveMode, Watcher};
use regex::Regex;
use sgm_bus::Bus;
use sgm_protocol::{topic, Message, Timestamp};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs until `cancel` fires. Errors from the underlying watcher are
/// logged; the task keeps running.
pub async fn run(
    bus: Arc<Bus>,
    dir: PathBuf,
    pattern: Regex,
    cancel: CancellationToken,
) {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
    let mut watcher = match notify::recommended_watcher(move |res| {
        let _ = raw_tx.send(res);
    }) {
        Ok(w) => w,
        Err(e) => {
            error!(error = %e, "connection watcher: failed to create fs watcher");
            return;
        }
    };
    if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
        error!(error = %e, dir = %dir.display(), "connection watcher: failed to watch directory");
        return;
    }

    // Bootstrap: enumerate entries that existed before (or raced with) the
    // watch being established. A file created in that race window may be
    // reported here AND via the watch event below — subscribers tolerate
    // the duplicate `connect`.
    bootstrap_enumerate(&bus, &dir, &pattern).await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("connection watcher: cancelled");
                return;
            }
            event = raw_rx.recv() => {
                match event {
                    None => return,
                    Some(Err(e)) => warn!(error = %e, "connection watcher: fs event error"),
                    Some(Ok(event)) => handle_event(&bus, &pattern, event).await,
                }
            }
        }
    }
}

async fn bootstrap_enumerate(bus: &Arc<Bus>, dir: &Path, pattern: &Regex) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, dir = %dir.display(), "connection watcher: bootstrap enumeration failed");
            return;
        }
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(serno) = captured_serno(pattern, name) else {
            continue;
        };
        let ts = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(Timestamp::from_system_time)
            .unwrap_or_else(|_| Timestamp::from_system_time(SystemTime::now()));
        publish_connect(bus, serno, ts).await;
    }
}

async fn handle_event(bus: &Arc<Bus>, pattern: &Regex, event: Event) {
    let is_create = matches!(event.kind, EventKind::Create(_));
    let is_remove = matches!(event.kind, EventKind::Remove(_));
    if !is_create && !is_remove {
        return;
    }
    for path in &event.paths {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(serno) = captured_serno(pattern, name) else {
            continue;
        };
        if is_create {
            publish_connect(bus, serno, Timestamp::now()).await;
        } else {
            publish_disconnect(bus, serno, Timestamp::now()).await;
        }
    }
}

fn captured_serno(pattern: &Regex, file_name: &str) -> Option<String> {
    pattern
        .captures(file_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_owned())
}

async fn publish_connect(bus: &Arc<Bus>, serno: String, ts: Timestamp) {
    bus.publish(topic::CONNECT, Message::new(ts, serno, "")).await;
}

async fn publish_disconnect(bus: &Arc<Bus>, serno: String, ts: Timestamp) {
    bus.publish(topic::DISCONNECT, Message::new(ts, serno, "")).await;
}
