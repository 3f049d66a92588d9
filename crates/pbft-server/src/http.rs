//! Plain-HTTP view of the replica's counters.
//!
//! `GET /metrics` answers in Prometheus text format and `GET /health` with a
//! small JSON object. Each connection gets one response and is closed.

use std::io::{self, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpListener;
use mio::{Interest, Registry, Token};
use pbft_core::METRICS;
use tracing::{debug, warn};

/// Poll token for the listener; the UDP socket uses token 0.
pub const METRICS_TOKEN: Token = Token(1_000_000);

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// TCP listener registered next to the replica socket.
pub struct MetricsEndpoint {
    listener: TcpListener,
}

impl MetricsEndpoint {
    pub fn bind(addr: SocketAddr, registry: &Registry) -> io::Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        registry.register(&mut listener, METRICS_TOKEN, Interest::READABLE)?;
        tracing::info!(%addr, "metrics endpoint listening");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Answers every connection waiting in the accept queue. A connection
    /// whose request has not arrived yet is dropped.
    pub fn serve_pending(&self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "metrics accept failed");
                    return;
                }
            };

            let mut buf = [0u8; 1024];
            let n = match stream.read(&mut buf) {
                Ok(n) if n > 0 => n,
                Ok(_) => continue,
                Err(e) => {
                    debug!(%peer, error = %e, "metrics request unreadable");
                    continue;
                }
            };
            let response = respond(&String::from_utf8_lossy(&buf[..n]));
            if let Err(e) = stream.write_all(response.as_bytes()) {
                debug!(%peer, error = %e, "metrics response not written");
            }
        }
    }
}

/// Builds the full response to one raw request.
fn respond(request: &str) -> String {
    let mut request_line = request.lines().next().unwrap_or_default().split_whitespace();
    let (status, content_type, body) = match (request_line.next(), request_line.next()) {
        (Some("GET"), Some("/metrics")) => {
            ("200 OK", PROMETHEUS_TEXT, METRICS.export_prometheus())
        }
        (Some("GET"), Some("/health")) => {
            let snapshot = METRICS.snapshot();
            let body = format!(
                r#"{{"status":"ok","view":{},"requests_executed":{}}}"#,
                snapshot.view_number, snapshot.requests_executed_total
            );
            ("200 OK", "application/json", body)
        }
        (Some("GET"), Some(_)) => ("404 Not Found", "text/plain", String::from("not found")),
        _ => ("400 Bad Request", "text/plain", String::from("only GET is served")),
    };
    format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("GET /metrics HTTP/1.1\r\nHost: x\r\n\r\n", "200 OK"; "metrics")]
    #[test_case("GET /health HTTP/1.1\r\n\r\n", "200 OK"; "health")]
    #[test_case("GET /nope HTTP/1.1\r\n\r\n", "404 Not Found"; "unknown path")]
    #[test_case("POST /metrics HTTP/1.1\r\n\r\n", "400 Bad Request"; "wrong method")]
    #[test_case("", "400 Bad Request"; "empty")]
    fn routes_by_request_line(request: &str, status: &str) {
        assert!(respond(request).starts_with(&format!("HTTP/1.1 {status}\r\n")));
    }

    #[test]
    fn metrics_body_is_prometheus_text() {
        let response = respond("GET /metrics HTTP/1.1\r\n\r\n");
        assert!(response.contains(PROMETHEUS_TEXT));
        assert!(response.contains("pbft_view_changes_total"));
    }

    #[test]
    fn content_length_matches_body() {
        let response = respond("GET /health HTTP/1.1\r\n\r\n");
        let (head, body) = response.split_once("\r\n\r\n").expect("header terminator");
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        assert!(body.starts_with(r#"{"status":"ok""#));
    }
}
