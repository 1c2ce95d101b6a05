//! Status responder: a line-oriented TCP server answering operator
//! snapshot queries in text or JSON.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use sgm_registry::Registry;
use sgm_protocol::{LineOutcome, LineReader};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consumers::recorder::RecorderMetrics;

const USAGE: &str = "usage: who | port | ports | serno | sernos | status | json | quit\n";

pub async fn run(
    registry: Arc<Registry>,
    recorder_metrics: Arc<RecorderMetrics>,
    bind_addr: String,
    cancel: CancellationToken,
) {
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "status responder: failed to bind");
            return;
        }
    };
    info!(addr = %bind_addr, "status responder: listening");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("status responder: cancelled");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "status responder: accepted connection");
                        let registry = registry.clone();
                        let recorder_metrics = recorder_metrics.clone();
                        let conn_cancel = cancel.clone();
                        tokio::spawn(async move {
                            serve_connection(registry, recorder_metrics, stream, conn_cancel).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "status responder: accept failed"),
                }
            }
        }
    }
}

async fn serve_connection(
    registry: Arc<Registry>,
    recorder_metrics: Arc<RecorderMetrics>,
    stream: TcpStream,
    cancel: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = LineReader::new(read_half);
    let mut line = String::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = reader.read_line(&mut line) => {
                match outcome {
                    Ok(LineOutcome::Eof) => return,
                    Err(e) => {
                        warn!(error = %e, "status responder: read error");
                        return;
                    }
                    Ok(LineOutcome::Line) => {
                        let command = line.trim();
                        if command == "quit" {
                            return;
                        }
                        let response = render_response(&registry, &recorder_metrics, command).await;
                        if write_half.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn render_response(
    registry: &Arc<Registry>,
    recorder_metrics: &Arc<RecorderMetrics>,
    command: &str,
) -> String {
    match command {
        "serno" | "sernos" => {
            let mut out = String::new();
            for record in registry.snapshot().await {
                if record.connected().await {
                    out.push_str(record.serno.as_str());
                    out.push('\n');
                }
            }
            out
        }
        "port" | "ports" => {
            let mut out = String::new();
            for record in registry.snapshot().await {
                if record.connected().await {
                    out.push_str(&record.tunnel_port.to_string());
                    out.push('\n');
                }
            }
            out
        }
        "who" => {
            let mut out = String::new();
            for record in registry.snapshot().await {
                if record.connected().await {
                    out.push_str(&format!("{},{}\n", record.serno, record.tunnel_port));
                }
            }
            out
        }
        "status" | "json" => {
            let mut object = serde_json::Map::new();
            for record in registry.snapshot().await {
                let snapshot = record.snapshot().await;
                object.insert(
                    record.serno.to_string(),
                    serde_json::to_value(snapshot).unwrap_or(serde_json::Value::Null),
                );
            }
            object.insert(
                "_recorder_failed_writes".to_owned(),
                serde_json::Value::from(recorder_metrics.failed_writes.load(Ordering::Relaxed)),
            );
            let mut out = serde_json::Value::Object(object).to_string();
            out.push('\n');
            out
        }
        _ => USAGE.to_owned(),
    }
}
