//! TCP server with connection handling
//!
//! Responsibilities:
//! - Accept TCP connections
//! - HTTP/1.1 parsing via hyper
//! - Spawn per-connection tasks
//! - Bouncer pipeline execution, then upstream forwarding
//! - Rendering of the built-in forbidden and challenge pages

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::percent_decode_str;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::bouncer::{BounceOutcome, BounceRequest, Bouncer};
use crate::error::{BouncerError, Result};
use crate::proxy::ProxyClient;

/// Main server struct wiring the bouncer in front of the upstream proxy
pub struct Server {
    listener: TcpListener,
    addr: SocketAddr,
    bouncer: Arc<Bouncer>,
    proxy_client: Arc<ProxyClient>,
}

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        bouncer: Arc<Bouncer>,
        proxy_client: ProxyClient,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BouncerError::Bind { addr, source: e })?;

        let actual_addr = listener
            .local_addr()
            .map_err(|e| BouncerError::Config(format!("Failed to get local address: {e}")))?;

        info!(%actual_addr, "Server bound successfully");

        Ok(Self {
            listener,
            addr: actual_addr,
            bouncer,
            proxy_client: Arc::new(proxy_client),
        })
    }

    pub async fn run(self) -> Result<()> {
        info!(addr = %self.addr, "Starting server");

        loop {
            let (stream, remote_addr) = match self.listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!(%e, "Failed to accept connection");
                    continue;
                }
            };

            let io = TokioIo::new(stream);
            let bouncer = self.bouncer.clone();
            let proxy_client = self.proxy_client.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    handle_request(req, remote_addr, bouncer.clone(), proxy_client.clone())
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(%remote_addr, %e, "Connection error");
                }
            });
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Handle a single HTTP request
///
/// Flow:
/// 1. Collect the body (the challenge form and the upstream forwarder
///    both need it)
/// 2. Run the bouncer pipeline
/// 3. Proceed: forward to the upstream; otherwise render the verdict page
async fn handle_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    bouncer: Arc<Bouncer>,
    proxy_client: Arc<ProxyClient>,
) -> std::result::Result<Response<Full<Bytes>>, hyper::Error> {
    let (parts, body) = req.into_parts();
    let body_bytes = body.collect().await?.to_bytes();

    let is_form_post = parts.method == Method::POST
        && parts
            .headers
            .get(hyper::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("application/x-www-form-urlencoded"))
            .unwrap_or(false);
    let form = if is_form_post {
        parse_form(&body_bytes)
    } else {
        HashMap::new()
    };

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    let bounce_request = BounceRequest {
        peer: remote_addr.ip(),
        method: parts.method.to_string(),
        path: parts.uri.path().to_string(),
        x_forwarded_for: header("x-forwarded-for"),
        referer: header("referer"),
        form,
    };

    let outcome = match bouncer.handle(&bounce_request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            return Ok(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Bouncer error: {e}"),
            ));
        }
    };

    let response = match outcome {
        BounceOutcome::Proceed => {
            let upstream_req = Request::from_parts(parts, Full::new(body_bytes));
            match proxy_client.forward(upstream_req, remote_addr).await {
                Ok(response) => response,
                Err(e) => {
                    error!(%remote_addr, error = %e, "Proxy forward failed");
                    plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
                }
            }
        }
        BounceOutcome::Forbidden => html_response(StatusCode::FORBIDDEN, FORBIDDEN_BODY),
        BounceOutcome::Challenge {
            inline_image,
            error,
        } => html_response(
            StatusCode::UNAUTHORIZED,
            &challenge_page(&inline_image, error),
        ),
        BounceOutcome::Redirect(location) => Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, location)
            .body(Full::new(Bytes::new()))
            .unwrap_or_default(),
    };

    Ok(response)
}

/// Decode an `application/x-www-form-urlencoded` body.
fn parse_form(body: &[u8]) -> HashMap<String, String> {
    let Ok(text) = std::str::from_utf8(body) else {
        return HashMap::new();
    };
    let decode = |s: &str| {
        percent_decode_str(&s.replace('+', " "))
            .decode_utf8()
            .map(|c| c.into_owned())
            .unwrap_or_default()
    };
    text.split('&')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            Some((decode(name), decode(value)))
        })
        .collect()
}

const FORBIDDEN_BODY: &str = "<html><body><h1>403 Forbidden</h1>\
<p>This page is protected against cyber attacks and your IP has been banned.</p>\
</body></html>";

fn challenge_page(inline_image: &str, error: bool) -> String {
    let notice = if error {
        "<p style='color:red;'>Please try again.</p>"
    } else {
        ""
    };
    format!(
        "<html><body><h1>Please complete the security check</h1>{notice}\
         <img src=\"{inline_image}\" alt=\"captcha\"/>\
         <form method=\"post\">\
         <input type=\"text\" name=\"phrase\" autocomplete=\"off\" autofocus/>\
         <button type=\"submit\">Continue</button>\
         </form>\
         <form method=\"post\">\
         <input type=\"hidden\" name=\"refresh\" value=\"1\"/>\
         <button type=\"submit\">Refresh image</button>\
         </form></body></html>"
    )
}

fn plain_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_default()
}

fn html_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap_or_default()
}
