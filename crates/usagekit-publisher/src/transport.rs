//! HTTP transport for collector uploads.
//!
//! The publisher talks to the collector through the [`Transport`]
//! trait so hosts can plug in custom connection handling (proxies,
//! instrumentation) and tests can stub the wire entirely.

use std::time::Duration;

use reqwest::Url;
use thiserror::Error;

/// Connection-level failures. Anything after a connection was
/// established is reported through [`TransportResponse`] instead.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established or broke mid-request.
    #[error("unable to connect to {url}: {message}")]
    Connection {
        /// The URL the transport tried to reach.
        url: String,
        /// Description of the underlying failure.
        message: String,
    },
}

/// Outcome of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Status reason phrase, used for logging server rejections.
    pub message: String,
    /// Number of request-body bytes actually written to the wire, or
    /// `None` when no request was made (synthetic responses).
    pub bytes_sent: Option<u64>,
}

/// Sends upload bodies to the collector.
pub trait Transport: Send + Sync {
    /// POSTs `body` to `url` and reports the response status.
    ///
    /// # Errors
    ///
    /// Fails only for connection-level problems; server rejections are
    /// an `Ok` response with a non-2xx status.
    fn send(&self, url: &Url, body: &[u8]) -> Result<TransportResponse, TransportError>;
}

/// Connect timeout for collector uploads.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Overall request timeout for collector uploads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// The default transport: a blocking HTTP client with conservative
/// timeouts.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Fails when the underlying HTTP client cannot be constructed.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Connection {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, url: &Url, body: &[u8]) -> Result<TransportResponse, TransportError> {
        if !matches!(url.scheme(), "http" | "https") {
            // Not an HTTP endpoint; report "method not allowed"
            // without attempting a request.
            tracing::error!(scheme = url.scheme(), "unexpected connection scheme");
            return Ok(TransportResponse {
                status: 405,
                message: "Method Not Allowed".to_string(),
                bytes_sent: None,
            });
        }
        let response = self
            .client
            .post(url.clone())
            .body(body.to_vec())
            .send()
            .map_err(|err| TransportError::Connection {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let status = response.status();
        Ok(TransportResponse {
            status: status.as_u16(),
            message: status
                .canonical_reason()
                .unwrap_or("unknown status")
                .to_string(),
            bytes_sent: Some(body.len() as u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_http_scheme_yields_synthetic_405() {
        let transport = HttpTransport::new().unwrap();
        let url = Url::parse("file:///tmp/not-a-server").unwrap();
        let response = transport.send(&url, b"payload").unwrap();
        assert_eq!(response.status, 405);
        assert_eq!(response.bytes_sent, None);
    }

    #[test]
    fn refused_connection_is_a_transport_error() {
        let transport = HttpTransport::new().unwrap();
        // Bind and immediately drop a listener so the port is closed.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = Url::parse(&format!("http://127.0.0.1:{port}/log")).unwrap();
        let error = transport.send(&url, b"payload").unwrap_err();
        assert!(matches!(error, TransportError::Connection { .. }));
    }
}
