//! LAPI client: live decision queries and streamed diffs
//!
//! Two interchangeable transports share one contract: a pooled hyper
//! client and a reqwest client (the `use_curl` option selects the
//! latter). Both authenticate with either an API key header or a mutual
//! TLS client certificate, enforce the request budget, and treat an
//! empty response body as an empty decision list.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;

use crate::decision::Decision;
use crate::error::{BouncerError, Result};

const DECISIONS_ENDPOINT: &str = "/v1/decisions";
const STREAM_ENDPOINT: &str = "/v1/decisions/stream";
const API_KEY_HEADER: &str = "X-Api-Key";

/// A streamed diff: decisions to add and decisions to retire.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DecisionStream {
    #[serde(default, deserialize_with = "nullable_vec")]
    pub new: Vec<Decision>,
    #[serde(default, deserialize_with = "nullable_vec")]
    pub deleted: Vec<Decision>,
}

fn nullable_vec<'de, D>(deserializer: D) -> std::result::Result<Vec<Decision>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Decision>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Filter for a live decision query.
#[derive(Debug, Clone)]
pub enum DecisionFilter {
    Ip(String),
    ScopeValue { scope: String, value: String },
}

impl DecisionFilter {
    fn query(&self) -> String {
        match self {
            DecisionFilter::Ip(ip) => {
                format!("ip={}", utf8_percent_encode(ip, NON_ALPHANUMERIC))
            }
            DecisionFilter::ScopeValue { scope, value } => format!(
                "scope={}&value={}",
                utf8_percent_encode(scope, NON_ALPHANUMERIC),
                utf8_percent_encode(value, NON_ALPHANUMERIC)
            ),
        }
    }
}

/// Client certificate material for mutual TLS.
#[derive(Debug, Clone)]
pub struct TlsAuth {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_cert_path: Option<PathBuf>,
    pub verify_peer: bool,
}

/// How requests to LAPI authenticate.
#[derive(Debug, Clone)]
pub enum LapiAuth {
    ApiKey(String),
    MutualTls(TlsAuth),
}

/// Connection settings shared by both transports.
#[derive(Debug, Clone)]
pub struct LapiConfig {
    pub api_url: String,
    pub auth: LapiAuth,
    pub timeout: Duration,
    pub user_agent: String,
}

#[async_trait::async_trait]
pub trait LapiClient: Send + Sync {
    /// Live query for decisions matching a filter.
    async fn filtered_decisions(&self, filter: &DecisionFilter) -> Result<Vec<Decision>>;

    /// Pull the stream diff; `startup` requests the full snapshot.
    async fn streamed_decisions(&self, startup: bool) -> Result<DecisionStream>;
}

fn parse_live_body(body: &str) -> Result<Vec<Decision>> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed)
        .map_err(|e| BouncerError::Transport(format!("invalid decision payload: {e}")))
}

fn parse_stream_body(body: &str) -> Result<DecisionStream> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(DecisionStream::default());
    }
    serde_json::from_str(trimmed)
        .map_err(|e| BouncerError::Transport(format!("invalid stream payload: {e}")))
}

fn check_status(status: u16, body: String) -> Result<String> {
    if (200..300).contains(&status) {
        Ok(body)
    } else {
        Err(BouncerError::Api { status, body })
    }
}

// rustls client configuration shared by the hyper transport.
mod tls {
    use super::*;
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::RootCertStore;

    pub fn client_config(auth: &TlsAuth) -> Result<rustls::ClientConfig> {
        let certs = load_certs(&auth.cert_path)?;
        let key = load_key(&auth.key_path)?;

        // Pin the provider explicitly so enabling another rustls backend
        // elsewhere in the dependency graph cannot make this ambiguous.
        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| BouncerError::Config(format!("TLS protocol setup: {e}")))?;

        let builder = if auth.verify_peer {
            let mut roots = RootCertStore::empty();
            if let Some(ca_path) = &auth.ca_cert_path {
                for cert in load_certs(ca_path)? {
                    roots.add(cert).map_err(|e| {
                        BouncerError::Config(format!("invalid CA certificate: {e}"))
                    })?;
                }
            }
            builder.with_root_certificates(roots)
        } else {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
        };

        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| BouncerError::Config(format!("invalid client certificate: {e}")))
    }

    fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
        let pem = std::fs::read(path)
            .map_err(|e| BouncerError::Config(format!("read {}: {e}", path.display())))?;
        rustls_pemfile::certs(&mut pem.as_slice())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| BouncerError::Config(format!("parse {}: {e}", path.display())))
    }

    fn load_key(path: &std::path::Path) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
        let pem = std::fs::read(path)
            .map_err(|e| BouncerError::Config(format!("read {}: {e}", path.display())))?;
        rustls_pemfile::private_key(&mut pem.as_slice())
            .map_err(|e| BouncerError::Config(format!("parse {}: {e}", path.display())))?
            .ok_or_else(|| {
                BouncerError::Config(format!("no private key in {}", path.display()))
            })
    }

    /// Accept-any verifier used when `tls_verify_peer` is off.
    #[derive(Debug)]
    struct NoVerify(rustls::crypto::CryptoProvider);

    impl NoVerify {
        fn new() -> Self {
            Self(rustls::crypto::ring::default_provider())
        }
    }

    impl rustls::client::danger::ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error>
        {
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error>
        {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

type HyperHttpsClient =
    Client<hyper_rustls::HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Pooled hyper transport.
pub struct HyperLapiClient {
    config: LapiConfig,
    client: HyperHttpsClient,
}

impl HyperLapiClient {
    pub fn new(config: LapiConfig) -> Result<Self> {
        let connector = match &config.auth {
            LapiAuth::ApiKey(_) => hyper_rustls::HttpsConnectorBuilder::new()
                .with_native_roots()
                .map_err(|e| BouncerError::Config(format!("native TLS roots: {e}")))?
                .https_or_http()
                .enable_http1()
                .build(),
            LapiAuth::MutualTls(tls_auth) => hyper_rustls::HttpsConnectorBuilder::new()
                .with_tls_config(tls::client_config(tls_auth)?)
                .https_or_http()
                .enable_http1()
                .build(),
        };

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self { config, client })
    }

    async fn get(&self, path_and_query: &str) -> Result<String> {
        let uri = format!(
            "{}{path_and_query}",
            self.config.api_url.trim_end_matches('/')
        );

        let mut builder = Request::get(uri.as_str())
            .header(hyper::header::USER_AGENT, &self.config.user_agent)
            .header(hyper::header::ACCEPT, "application/json");
        if let LapiAuth::ApiKey(key) = &self.config.auth {
            builder = builder.header(API_KEY_HEADER, key);
        }
        let request = builder
            .body(Full::default())
            .map_err(|e| BouncerError::Transport(format!("build request: {e}")))?;

        let response = tokio::time::timeout(self.config.timeout, self.client.request(request))
            .await
            .map_err(|_| BouncerError::Timeout(self.config.timeout))?
            .map_err(|e| BouncerError::Transport(format!("request {uri}: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BouncerError::Transport(format!("read body: {e}")))?
            .to_bytes();
        let body = String::from_utf8_lossy(&body).into_owned();

        check_status(status, body)
    }
}

#[async_trait::async_trait]
impl LapiClient for HyperLapiClient {
    async fn filtered_decisions(&self, filter: &DecisionFilter) -> Result<Vec<Decision>> {
        let body = self
            .get(&format!("{DECISIONS_ENDPOINT}?{}", filter.query()))
            .await?;
        parse_live_body(&body)
    }

    async fn streamed_decisions(&self, startup: bool) -> Result<DecisionStream> {
        let body = self
            .get(&format!("{STREAM_ENDPOINT}?startup={startup}"))
            .await?;
        parse_stream_body(&body)
    }
}

/// Reqwest transport, selected by `use_curl`.
pub struct ReqwestLapiClient {
    config: LapiConfig,
    client: reqwest::Client,
}

impl ReqwestLapiClient {
    pub fn new(config: LapiConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone());

        if let LapiAuth::MutualTls(tls_auth) = &config.auth {
            let mut pem = std::fs::read(&tls_auth.cert_path).map_err(|e| {
                BouncerError::Config(format!("read {}: {e}", tls_auth.cert_path.display()))
            })?;
            let key = std::fs::read(&tls_auth.key_path).map_err(|e| {
                BouncerError::Config(format!("read {}: {e}", tls_auth.key_path.display()))
            })?;
            pem.extend_from_slice(&key);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| BouncerError::Config(format!("client identity: {e}")))?;
            builder = builder.identity(identity);

            if let Some(ca_path) = &tls_auth.ca_cert_path {
                let ca = std::fs::read(ca_path)
                    .map_err(|e| BouncerError::Config(format!("read {}: {e}", ca_path.display())))?;
                let ca = reqwest::Certificate::from_pem(&ca)
                    .map_err(|e| BouncerError::Config(format!("CA certificate: {e}")))?;
                builder = builder.add_root_certificate(ca);
            }
            if !tls_auth.verify_peer {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        let client = builder
            .build()
            .map_err(|e| BouncerError::Config(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    async fn get(&self, path_and_query: &str) -> Result<String> {
        let url = format!(
            "{}{path_and_query}",
            self.config.api_url.trim_end_matches('/')
        );

        let mut request = self
            .client
            .get(&url)
            .header(hyper::header::ACCEPT, "application/json");
        if let LapiAuth::ApiKey(key) = &self.config.auth {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                BouncerError::Timeout(self.config.timeout)
            } else {
                BouncerError::Transport(format!("request {url}: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                BouncerError::Timeout(self.config.timeout)
            } else {
                BouncerError::Transport(format!("read body: {e}"))
            }
        })?;

        check_status(status, body)
    }
}

#[async_trait::async_trait]
impl LapiClient for ReqwestLapiClient {
    async fn filtered_decisions(&self, filter: &DecisionFilter) -> Result<Vec<Decision>> {
        let body = self
            .get(&format!("{DECISIONS_ENDPOINT}?{}", filter.query()))
            .await?;
        parse_live_body(&body)
    }

    async fn streamed_decisions(&self, startup: bool) -> Result<DecisionStream> {
        let body = self
            .get(&format!("{STREAM_ENDPOINT}?startup={startup}"))
            .await?;
        parse_stream_body(&body)
    }
}

/// Build the transport selected by configuration.
pub fn build_client(config: LapiConfig, use_curl: bool) -> Result<Arc<dyn LapiClient>> {
    Ok(if use_curl {
        Arc::new(ReqwestLapiClient::new(config)?)
    } else {
        Arc::new(HyperLapiClient::new(config)?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_query_ip() {
        let filter = DecisionFilter::Ip("1.2.3.4".to_string());
        assert_eq!(filter.query(), "ip=1%2E2%2E3%2E4");
    }

    #[test]
    fn test_filter_query_scope_value() {
        let filter = DecisionFilter::ScopeValue {
            scope: "Country".to_string(),
            value: "JP".to_string(),
        };
        assert_eq!(filter.query(), "scope=Country&value=JP");
    }

    #[test]
    fn test_parse_live_body_empty_and_null() {
        assert!(parse_live_body("").unwrap().is_empty());
        assert!(parse_live_body("null").unwrap().is_empty());
        assert!(parse_live_body("  \n").unwrap().is_empty());
    }

    #[test]
    fn test_parse_live_body_decisions() {
        let body = r#"[{"id":1,"type":"ban","scope":"Ip","value":"1.2.3.4","duration":"4h0m0s"}]"#;
        let decisions = parse_live_body(body).unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].id, 1);
        assert_eq!(decisions[0].kind, "ban");
    }

    #[test]
    fn test_parse_stream_body_partial_fields() {
        let stream = parse_stream_body(r#"{"new": null}"#).unwrap();
        assert!(stream.new.is_empty());
        assert!(stream.deleted.is_empty());

        let stream = parse_stream_body(
            r#"{"new":[{"id":2,"type":"captcha","scope":"Country","value":"JP","duration":"24h0m0s"}]}"#,
        )
        .unwrap();
        assert_eq!(stream.new.len(), 1);
    }

    #[test]
    fn test_non_2xx_is_api_error() {
        let err = check_status(403, "forbidden".to_string()).unwrap_err();
        match err {
            BouncerError::Api { status, body } => {
                assert_eq!(status, 403);
                assert_eq!(body, "forbidden");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
