//! Trusted stream ingress: a TCP server whose first line per connection
//! identifies the sender; every subsequent line is published on the bus,
//! topic = the line's first byte.
//!
//! No verification of the claimed identity happens here — placement
//! behind a loopback or authenticated transport is the operator's
//! responsibility.

use std::sync::Arc;

use sgm_bus::Bus;
use sgm_protocol::{topic, LineOutcome, LineReader, Message, Timestamp};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub async fn run(bus: Arc<Bus>, bind_addr: String, cancel: CancellationToken) {
    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "trusted stream ingress: failed to bind");
            return;
        }
    };
    info!(addr = %bind_addr, "trusted stream ingress: listening");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("trusted stream ingress: cancelled");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "trusted stream ingress: accepted connection");
                        let bus = bus.clone();
                        let conn_cancel = cancel.clone();
                        tokio::spawn(async move {
                            serve_connection(bus, stream, conn_cancel).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "trusted stream ingress: accept failed"),
                }
            }
        }
    }
}

async fn serve_connection(bus: Arc<Bus>, stream: TcpStream, cancel: CancellationToken) {
    let mut reader = LineReader::new(stream);
    let mut line = String::new();

    let identity = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        outcome = reader.read_line(&mut line) => match outcome {
            Ok(LineOutcome::Line) => line.clone(),
            Ok(LineOutcome::Eof) => return,
            Err(e) => {
                warn!(error = %e, "trusted stream ingress: error reading identity line");
                return;
            }
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = reader.read_line(&mut line) => {
                match outcome {
                    Ok(LineOutcome::Eof) => {
                        debug!(sender = %identity, "trusted stream ingress: stream ended");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, sender = %identity, "trusted stream ingress: read error");
                        return;
                    }
                    Ok(LineOutcome::Line) => {
                        if line.is_empty() {
                            continue;
                        }
                        let message_topic = topic::topic_of(&line);
                        bus.publish(
                            message_topic,
                            Message::new(Timestamp::now(), identity.clone(), line.clone()),
                        )
                        .await;
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
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn identity_line_then_message_line_publishes_with_first_byte_topic() {
        let bus = Bus::new();
        let cancel = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let run_bus = bus.clone();
        let run_cancel = cancel.clone();
        let addr_string = addr.to_string();
        let handle = tokio::spawn(async move {
            run(run_bus, addr_string, run_cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut sub = bus.subscribe(Topics::All).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"SG-0000000000AA\nHello\n").await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
            .await
            .expect("message should arrive")
            .unwrap();
        assert_eq!(envelope.topic, 'H');
        assert_eq!(envelope.message.sender, "SG-0000000000AA");
        assert_eq!(envelope.message.text, "Hello");

        cancel.cancel();
        drop(client);
        let _ = handle.await;
    }
}
