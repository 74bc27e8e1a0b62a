//! Readiness probes for sandbox containers.
//!
//! The proxy is ready when its listen port accepts a TCP connection; the
//! credential sidecar when its HTTP health endpoint answers 200. Probes
//! run from the host, which reaches bridge addresses directly (host
//! egress is not subject to the FORWARD-path filter chain).

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Delay between probe attempts.
const PROBE_INTERVAL: Duration = Duration::from_millis(250);
/// Per-attempt connect budget.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Wait until `addr` accepts TCP connections. Returns `false` when
/// `overall` elapses first.
pub async fn wait_for_tcp(addr: SocketAddr, overall: Duration) -> bool {
    tokio::time::timeout(overall, async {
        loop {
            match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => return,
                Ok(Err(e)) => debug!(%addr, error = %e, "probe connect refused"),
                Err(_) => debug!(%addr, "probe connect timed out"),
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    })
    .await
    .is_ok()
}

/// Wait until `url` answers HTTP 200. Returns `false` when `overall`
/// elapses first.
pub async fn wait_for_http_ok(url: &str, overall: Duration) -> bool {
    let Ok(client) = reqwest::Client::builder().timeout(CONNECT_TIMEOUT).build() else {
        return false;
    };
    tokio::time::timeout(overall, async {
        loop {
            match client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => debug!(%url, status = %resp.status(), "health endpoint not ready"),
                Err(e) => debug!(%url, error = %e, "health endpoint unreachable"),
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }
    })
    .await
    .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_succeeds_against_a_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        assert!(wait_for_tcp(addr, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn tcp_probe_times_out_on_a_dead_port() {
        // Bind then drop to obtain a port that refuses connections.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        assert!(!wait_for_tcp(addr, Duration::from_millis(600)).await);
    }
}
