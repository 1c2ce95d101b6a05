//! Datagram ingress: two UDP listeners, trusted and untrusted.
//!
//! Trusted datagrams are published without validation. Untrusted
//! datagrams must verify a signature before publication; the scheme is
//! unspecified upstream — see [`verify_untrusted`].

use std::sync::Arc;

use sgm_bus::Bus;
use sgm_protocol::{topic, Message, Timestamp};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("untrusted-datagram signature verification is unimplemented")]
    Unimplemented,
}

/// Verifies an untrusted datagram's signature before it is trusted enough
/// to publish.
///
/// The scheme and key material for this verification are unspecified
/// upstream. Rather than silently accepting unverified datagrams, this
/// fails closed: every untrusted datagram is rejected and logged until a
/// real scheme is specified.
pub fn verify_untrusted(_payload: &[u8]) -> Result<(), VerifyError> {
    Err(VerifyError::Unimplemented)
}

pub async fn run_trusted(bus: Arc<Bus>, bind_addr: String, cancel: CancellationToken) {
    run(bus, bind_addr, cancel, false).await;
}

pub async fn run_untrusted(bus: Arc<Bus>, bind_addr: String, cancel: CancellationToken) {
    run(bus, bind_addr, cancel, true).await;
}

async fn run(bus: Arc<Bus>, bind_addr: String, cancel: CancellationToken, untrusted: bool) {
    let socket = match UdpSocket::bind(&bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, untrusted, "datagram ingress: failed to bind");
            return;
        }
    };
    info!(addr = %bind_addr, untrusted, "datagram ingress: listening");

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(untrusted, "datagram ingress: cancelled");
                return;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer)) => handle_datagram(&bus, &buf[..n], peer, untrusted).await,
                    Err(e) => warn!(error = %e, untrusted, "datagram ingress: read error"),
                }
            }
        }
    }
}

async fn handle_datagram(
    bus: &Arc<Bus>,
    payload: &[u8],
    peer: std::net::SocketAddr,
    untrusted: bool,
) {
    if untrusted {
        if let Err(e) = verify_untrusted(payload) {
            warn!(error = %e, %peer, "datagram ingress: rejecting unverified untrusted datagram");
            return;
        }
    }
    let Ok(text) = std::str::from_utf8(payload) else {
        warn!(%peer, untrusted, "datagram ingress: non-UTF8 payload discarded");
        return;
    };
    if text.is_empty() {
        return;
    }
    let message_topic = topic::topic_of(text);
    bus.publish(
        message_topic,
        Message::new(Timestamp::now(), peer.to_string(), text.to_owned()),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sgm_bus::Topics;
    use std::time::Duration;

    #[tokio::test]
    async fn trusted_datagram_publishes_without_verification() {
        let bus = Bus::new();
        let cancel = CancellationToken::new();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        drop(socket);

        let run_bus = bus.clone();
        let run_cancel = cancel.clone();
        let addr_string = addr.to_string();
        let handle = tokio::spawn(async move {
            run_trusted(run_bus, addr_string, run_cancel).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut sub = bus.subscribe(Topics::All).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"Gfix,lat,lon", addr).await.unwrap();

        let envelope = tokio::time::timeout(Duration::from_secs(5), sub.rx.recv())
            .await
            .expect("message should arrive")
            .unwrap();
        assert_eq!(envelope.topic, 'G');

        cancel.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn untrusted_datagram_is_rejected_until_verification_is_implemented() {
        assert!(verify_untrusted(b"anything").is_err());
    }
}
