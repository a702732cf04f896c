//! Plain-HTTP endpoint that hands out the cluster CA certificate while
//! joiners bootstrap, and the client that fetches it.
//!
//! The server only ever holds a [`CaCertificate`], so it has no way to
//! serve key material.

use clusterkit_core::retry::backoff_delay;
use clusterkit_core::{CaExchangeConfig, PeerAddr};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, sleep_until, timeout, Instant};

use crate::error::TrustError;
use crate::issuer::CaCertificate;

pub const CA_PATH: &str = "/ca.crt";

const MAX_REQUEST: usize = 4096;
const MAX_RESPONSE: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ExchangeLimits {
    /// Server shuts down this long after it starts serving.
    pub window: Duration,
    /// Server shuts down after this many successful CA responses.
    pub max_fetches: u32,
    /// Per-connection read/write budget.
    pub io_timeout: Duration,
}

impl From<&CaExchangeConfig> for ExchangeLimits {
    fn from(cfg: &CaExchangeConfig) -> Self {
        ExchangeLimits {
            window: Duration::from_secs(cfg.window_secs),
            max_fetches: cfg.max_fetches,
            io_timeout: Duration::from_millis(cfg.fetch_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    WindowElapsed,
    FetchLimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServeSummary {
    pub fetches: u32,
    pub reason: ShutdownReason,
}

enum Served {
    Certificate,
    NotFound,
}

pub struct CaExchangeServer {
    listener: TcpListener,
    ca: CaCertificate,
    limits: ExchangeLimits,
}

impl CaExchangeServer {
    pub async fn bind(addr: SocketAddr, ca: CaCertificate, limits: ExchangeLimits) -> Result<Self, TrustError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TrustError::Exchange(format!("cannot listen on {addr}: {e}")))?;
        Ok(CaExchangeServer { listener, ca, limits })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TrustError> {
        self.listener.local_addr().map_err(|e| TrustError::Exchange(e.to_string()))
    }

    /// Serve until the window elapses or the fetch limit is reached,
    /// whichever comes first. The listener is closed on return.
    pub async fn serve(self) -> Result<ServeSummary, TrustError> {
        let deadline = Instant::now() + self.limits.window;
        let mut fetches = 0u32;
        tracing::info!(
            addr = %self.local_addr()?,
            window_secs = self.limits.window.as_secs(),
            max_fetches = self.limits.max_fetches,
            fingerprint = %self.ca.fingerprint(),
            "serving cluster CA"
        );
        if self.limits.max_fetches == 0 {
            return Ok(ServeSummary { fetches, reason: ShutdownReason::FetchLimitReached });
        }
        loop {
            let accepted = tokio::select! {
                _ = sleep_until(deadline) => {
                    tracing::info!(fetches, "CA exchange window elapsed");
                    return Ok(ServeSummary { fetches, reason: ShutdownReason::WindowElapsed });
                }
                r = self.listener.accept() => r,
            };
            let (stream, peer) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let budget = self.limits.io_timeout.min(deadline.saturating_duration_since(Instant::now()));
            match timeout(budget, respond(stream, self.ca.pem())).await {
                Ok(Ok(Served::Certificate)) => {
                    fetches += 1;
                    tracing::info!(%peer, fetches, "served CA certificate");
                    if fetches >= self.limits.max_fetches {
                        tracing::info!(fetches, "CA exchange fetch limit reached");
                        return Ok(ServeSummary { fetches, reason: ShutdownReason::FetchLimitReached });
                    }
                }
                Ok(Ok(Served::NotFound)) => tracing::debug!(%peer, "rejected request"),
                Ok(Err(e)) => tracing::warn!(%peer, error = %e, "exchange connection failed"),
                Err(_) => tracing::warn!(%peer, "exchange connection timed out"),
            }
        }
    }
}

async fn respond(mut stream: TcpStream, body: &[u8]) -> std::io::Result<Served> {
    let mut buf = vec![0u8; MAX_REQUEST];
    let mut n = 0;
    while n < buf.len() {
        let r = stream.read(&mut buf[n..]).await?;
        if r == 0 { break; }
        n += r;
        let head = &buf[..n];
        if head.windows(4).any(|w| w == b"\r\n\r\n") || head.windows(2).any(|w| w == b"\n\n") { break; }
    }
    let text = String::from_utf8_lossy(&buf[..n]);
    let mut request_line = text.lines().next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("");
    let path = request_line.next().unwrap_or("");

    let served = if method == "GET" && (path == CA_PATH || path == "/") {
        let head = format!(
            "HTTP/1.0 200 OK\r\nContent-Type: application/x-pem-file\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).await?;
        stream.write_all(body).await?;
        Served::Certificate
    } else {
        stream
            .write_all(b"HTTP/1.0 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
            .await?;
        Served::NotFound
    };
    stream.shutdown().await?;
    Ok(served)
}

#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    /// Exchange port dialed on every peer.
    pub port: u16,
    /// Budget for one complete request to one peer.
    pub timeout: Duration,
    /// Rounds over the whole peer list.
    pub attempts: u32,
    /// Base delay between rounds, grown by `backoff_delay`.
    pub retry_delay: Duration,
}

impl From<&CaExchangeConfig> for FetchPolicy {
    fn from(cfg: &CaExchangeConfig) -> Self {
        FetchPolicy {
            port: cfg.port,
            timeout: Duration::from_millis(cfg.fetch_timeout_ms),
            attempts: cfg.fetch_attempts,
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }
}

/// One `GET /ca.crt` against `host:port`; returns the response body.
pub async fn fetch_from(host: &str, port: u16, budget: Duration) -> Result<Vec<u8>, TrustError> {
    let exchange = async {
        let mut stream = TcpStream::connect((host, port)).await?;
        let req = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nUser-Agent: clusterctl/{}\r\nConnection: close\r\n\r\n",
            CA_PATH,
            host,
            clusterkit_core::version()
        );
        stream.write_all(req.as_bytes()).await?;
        let mut resp = Vec::new();
        (&mut stream).take(MAX_RESPONSE).read_to_end(&mut resp).await?;
        Ok::<_, std::io::Error>(resp)
    };
    let resp = timeout(budget, exchange)
        .await
        .map_err(|_| TrustError::Exchange(format!("{host}:{port} timed out")))?
        .map_err(|e| TrustError::Exchange(format!("{host}:{port}: {e}")))?;
    parse_response(&resp).map_err(|e| TrustError::Exchange(format!("{host}:{port}: {e}")))
}

fn parse_response(resp: &[u8]) -> Result<Vec<u8>, String> {
    let split = resp.windows(4).position(|w| w == b"\r\n\r\n").ok_or("truncated response")?;
    let head = String::from_utf8_lossy(&resp[..split]);
    let body = &resp[split + 4..];
    let mut lines = head.lines();
    let status = lines.next().unwrap_or("");
    let code = status.split_whitespace().nth(1).unwrap_or("");
    if !status.starts_with("HTTP/1.") || code != "200" {
        return Err(format!("unexpected status {status:?}"));
    }
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                let len: usize = value.trim().parse().map_err(|_| "bad content-length".to_string())?;
                if len != body.len() {
                    return Err(format!("short body: {} of {} bytes", body.len(), len));
                }
            }
        }
    }
    Ok(body.to_vec())
}

/// Try every peer in order, up to `policy.attempts` rounds, and return the
/// first response that is a valid CA certificate.
pub async fn fetch_ca(peers: &[PeerAddr], policy: &FetchPolicy) -> Result<CaCertificate, TrustError> {
    let attempts = policy.attempts.max(1);
    let peer_list = peers.iter().map(|p| p.host.as_str()).collect::<Vec<_>>().join(", ");
    if peers.is_empty() {
        return Err(TrustError::CaTimeout { peers: peer_list, attempts: 0 });
    }
    for attempt in 1..=attempts {
        for peer in peers {
            match fetch_from(&peer.host, policy.port, policy.timeout).await {
                Ok(bytes) => match CaCertificate::from_pem(&bytes) {
                    Ok(ca) => {
                        tracing::info!(peer = %peer.host, attempt, fingerprint = %ca.fingerprint(), "fetched cluster CA");
                        return Ok(ca);
                    }
                    Err(e) => tracing::warn!(peer = %peer.host, error = %e, "peer served an invalid CA"),
                },
                Err(e) => tracing::debug!(peer = %peer.host, attempt, error = %e, "CA fetch failed"),
            }
        }
        if attempt < attempts {
            let delay = backoff_delay(policy.retry_delay, attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "no peer served the CA yet, retrying");
            sleep(delay).await;
        }
    }
    Err(TrustError::CaTimeout { peers: peer_list, attempts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::CertIssuer;

    fn test_ca() -> CaCertificate {
        CertIssuer::new(30, 10).synthesize_ca("Cockroach CA").unwrap().certificate().clone()
    }

    fn limits(window: Duration, max_fetches: u32) -> ExchangeLimits {
        ExchangeLimits { window, max_fetches, io_timeout: Duration::from_secs(2) }
    }

    fn policy(port: u16, attempts: u32) -> FetchPolicy {
        FetchPolicy { port, timeout: Duration::from_millis(500), attempts, retry_delay: Duration::from_millis(10) }
    }

    async fn start(ca: CaCertificate, limits: ExchangeLimits) -> (u16, tokio::task::JoinHandle<Result<ServeSummary, TrustError>>) {
        let server = CaExchangeServer::bind("127.0.0.1:0".parse().unwrap(), ca, limits).await.unwrap();
        let port = server.local_addr().unwrap().port();
        (port, tokio::spawn(server.serve()))
    }

    async fn unused_port() -> u16 {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    }

    async fn raw_get(port: u16, path: &str) -> String {
        let mut s = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        s.write_all(format!("GET {path} HTTP/1.0\r\n\r\n").as_bytes()).await.unwrap();
        let mut out = String::new();
        s.read_to_string(&mut out).await.unwrap();
        out
    }

    #[test]
    fn parses_responses() {
        assert_eq!(parse_response(b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nhi").unwrap(), b"hi");
        assert!(parse_response(b"HTTP/1.0 200 OK\r\nContent-Length: 5\r\n\r\nhi").is_err());
        assert!(parse_response(b"HTTP/1.0 404 Not Found\r\n\r\n").is_err());
        assert!(parse_response(b"garbage").is_err());
    }

    #[tokio::test]
    async fn joiner_receives_exact_ca_bytes() {
        let ca = test_ca();
        let (port, handle) = start(ca.clone(), limits(Duration::from_secs(10), 1)).await;
        let peers = vec![PeerAddr::from("127.0.0.1")];
        let fetched = fetch_ca(&peers, &policy(port, 3)).await.unwrap();
        assert_eq!(fetched.pem(), ca.pem());
        assert_eq!(fetched.fingerprint(), ca.fingerprint());

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary, ServeSummary { fetches: 1, reason: ShutdownReason::FetchLimitReached });
    }

    #[tokio::test]
    async fn unreachable_peers_time_out() {
        let port = unused_port().await;
        let peers = vec![PeerAddr::from("127.0.0.1")];
        let err = fetch_ca(&peers, &policy(port, 2)).await.unwrap_err();
        assert!(matches!(err, TrustError::CaTimeout { attempts: 2, .. }));
        assert!(matches!(fetch_ca(&[], &policy(port, 2)).await, Err(TrustError::CaTimeout { attempts: 0, .. })));
    }

    #[tokio::test]
    async fn falls_through_to_a_reachable_peer() {
        let ca = test_ca();
        let (port, _handle) = start(ca.clone(), limits(Duration::from_secs(10), 5)).await;
        let peers = vec![PeerAddr::from("bad host name"), PeerAddr::from("127.0.0.1")];
        assert_eq!(fetch_ca(&peers, &policy(port, 1)).await.unwrap().pem(), ca.pem());
    }

    #[tokio::test]
    async fn other_paths_are_not_found_and_not_counted() {
        let ca = test_ca();
        let (port, handle) = start(ca.clone(), limits(Duration::from_secs(10), 1)).await;
        let resp = raw_get(port, "/ca.key").await;
        assert!(resp.starts_with("HTTP/1.0 404"));
        assert!(!resp.contains("BEGIN"));

        let resp = raw_get(port, "/ca.crt").await;
        assert!(resp.starts_with("HTTP/1.0 200"));
        assert!(resp.ends_with(std::str::from_utf8(ca.pem()).unwrap()));
        assert_eq!(handle.await.unwrap().unwrap().fetches, 1);
    }

    #[tokio::test]
    async fn server_stops_when_window_elapses() {
        let (port, handle) = start(test_ca(), limits(Duration::from_millis(200), 10)).await;
        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary, ServeSummary { fetches: 0, reason: ShutdownReason::WindowElapsed });
        assert!(fetch_from("127.0.0.1", port, Duration::from_millis(300)).await.is_err());
    }
}
