//! Reverse proxy to the protected upstream
//!
//! Allowed requests are forwarded with `X-Forwarded-For` / `X-Real-IP`
//! rewriting over a pooled client.

use std::net::SocketAddr;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{HeaderMap, Request, Response, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;

use crate::config::ProxyConfig;
use crate::error::{BouncerError, Result};

/// Upstream client with connection pooling
pub struct ProxyClient {
    config: ProxyConfig,
    client: Client<HttpConnector, Full<Bytes>>,
    upstream_uri: Uri,
}

impl ProxyClient {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let upstream_uri: Uri = config
            .upstream_url
            .parse()
            .map_err(|e| BouncerError::Config(format!("Invalid upstream URL: {e}")))?;

        let client = Client::builder(TokioExecutor::new()).build_http();

        Ok(Self {
            config,
            client,
            upstream_uri,
        })
    }

    /// Forward a request whose body has already been collected.
    pub async fn forward(
        &self,
        mut req: Request<Full<Bytes>>,
        client_addr: SocketAddr,
    ) -> Result<Response<Full<Bytes>>> {
        let upstream_path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let upstream_uri = format!(
            "{}://{}{}",
            self.upstream_uri.scheme_str().unwrap_or("http"),
            self.upstream_uri
                .authority()
                .map(|a| a.as_str())
                .unwrap_or("localhost"),
            upstream_path
        );

        *req.uri_mut() = upstream_uri
            .parse()
            .map_err(|e| BouncerError::Upstream(format!("Failed to parse upstream URI: {e}")))?;

        self.rewrite_headers(req.headers_mut(), client_addr);

        let response = tokio::time::timeout(self.config.timeout, self.client.request(req))
            .await
            .map_err(|_| BouncerError::Upstream("Upstream request timeout".to_string()))?
            .map_err(|e| BouncerError::Upstream(format!("Upstream request failed: {e}")))?;

        let (parts, body) = response.into_parts();
        let body_bytes = body
            .collect()
            .await
            .map_err(|e| BouncerError::Upstream(format!("Failed to read upstream response: {e}")))?
            .to_bytes();

        Ok(Response::from_parts(parts, Full::new(body_bytes)))
    }

    /// Rewrite request headers for proxy
    fn rewrite_headers(&self, headers: &mut HeaderMap, client_addr: SocketAddr) {
        let client_ip = client_addr.ip().to_string();
        if let Some(existing) = headers.get("x-forwarded-for").cloned() {
            if let Ok(value) = existing.to_str() {
                if let Ok(combined) = format!("{value}, {client_ip}").parse() {
                    headers.insert("x-forwarded-for", combined);
                }
            }
        } else if let Ok(value) = client_ip.parse() {
            headers.insert("x-forwarded-for", value);
        }

        if let Ok(value) = client_addr.ip().to_string().parse() {
            headers.insert("x-real-ip", value);
        }

        if !self.config.preserve_host {
            if let Some(authority) = self.upstream_uri.authority() {
                if let Ok(value) = authority.as_str().parse() {
                    headers.insert("host", value);
                }
            }
        }

        headers.remove("connection");
        headers.remove("keep-alive");
        headers.remove("proxy-authenticate");
        headers.remove("proxy-authorization");
        headers.remove("te");
        headers.remove("trailers");
        headers.remove("transfer-encoding");
        headers.remove("upgrade");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(url: &str) -> ProxyConfig {
        ProxyConfig {
            upstream_url: url.to_string(),
            timeout: Duration::from_secs(10),
            preserve_host: false,
        }
    }

    #[test]
    fn test_proxy_client_creation() {
        let client = ProxyClient::new(config("http://localhost:3000"));
        assert!(client.is_ok());
    }

    #[test]
    fn test_proxy_client_invalid_url() {
        let client = ProxyClient::new(config("not a url"));
        assert!(client.is_err());
    }

    #[test]
    fn test_rewrite_headers_appends_forwarded_for() {
        let client = ProxyClient::new(config("http://localhost:3000")).unwrap();
        let addr: SocketAddr = "203.0.113.5:4321".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.1.1.1".parse().unwrap());
        client.rewrite_headers(&mut headers, addr);

        assert_eq!(
            headers.get("x-forwarded-for").unwrap(),
            "1.1.1.1, 203.0.113.5"
        );
        assert_eq!(headers.get("x-real-ip").unwrap(), "203.0.113.5");
        assert_eq!(headers.get("host").unwrap(), "localhost:3000");
    }
}
