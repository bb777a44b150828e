//! Per-request bouncing pipeline
//!
//! Orchestrates one request: skip-list, effective client IP, verdict
//! resolution, dispatch. Every failure below this boundary is logged and,
//! unless the operator opted into surfacing errors, translated into
//! letting the request through — a broken bouncer must not take the
//! site down.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::{error, info};

use crate::captcha::{CaptchaAction, CaptchaPipeline, CaptchaSubmission};
use crate::error::Result;
use crate::forwarded::ForwardedIpResolver;
use crate::remediation::Remediation;
use crate::resolver::{parse_ip, Resolver};

#[derive(Debug, Clone, Default)]
pub struct BouncerConfig {
    /// Request paths that are never bounced.
    pub excluded_uris: Vec<String>,
    /// Test override for the effective client IP.
    pub forced_test_ip: Option<String>,
    /// Test override for the forwarded header value. The `"disabled"`
    /// sentinel is translated at configuration time, never stored here.
    pub forced_test_forwarded_ip: Option<String>,
    /// Surface pipeline errors instead of letting requests through.
    pub display_errors: bool,
}

/// The request fields the pipeline inspects, detached from the host
/// framework's request type.
#[derive(Debug, Clone)]
pub struct BounceRequest {
    pub peer: IpAddr,
    pub method: String,
    pub path: String,
    pub x_forwarded_for: Option<String>,
    pub referer: Option<String>,
    pub form: HashMap<String, String>,
}

/// What the host should do with the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BounceOutcome {
    /// Hand the request to the application.
    Proceed,
    /// Render the forbidden page (HTTP 403).
    Forbidden,
    /// Render the challenge page (HTTP 401).
    Challenge { inline_image: String, error: bool },
    /// Challenge solved; redirect the visitor (HTTP 302).
    Redirect(String),
}

pub struct Bouncer {
    resolver: Resolver,
    captcha: CaptchaPipeline,
    forwarded: ForwardedIpResolver,
    config: BouncerConfig,
}

impl Bouncer {
    pub fn new(
        resolver: Resolver,
        captcha: CaptchaPipeline,
        forwarded: ForwardedIpResolver,
        config: BouncerConfig,
    ) -> Self {
        Self {
            resolver,
            captcha,
            forwarded,
            config,
        }
    }

    /// Bounce one request, absorbing pipeline errors per configuration.
    pub async fn handle(&self, request: &BounceRequest) -> Result<BounceOutcome> {
        match self.bounce(request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!(
                    event = "UNKNOWN_EXCEPTION_WHILE_BOUNCING",
                    error = %e,
                    peer = %request.peer,
                    path = request.path,
                    "bouncing failed"
                );
                if self.config.display_errors {
                    Err(e)
                } else {
                    Ok(BounceOutcome::Proceed)
                }
            }
        }
    }

    async fn bounce(&self, request: &BounceRequest) -> Result<BounceOutcome> {
        if self.config.excluded_uris.iter().any(|u| u == &request.path) {
            return Ok(BounceOutcome::Proceed);
        }

        let ip = self.effective_ip(request)?;
        let verdict = self.resolver.remediation_for_ip(&ip.to_string()).await?;

        if verdict != Remediation::Bypass {
            info!(ip = %ip, verdict = %verdict, path = request.path, "bouncing request");
        }

        match verdict {
            Remediation::Bypass => Ok(BounceOutcome::Proceed),
            Remediation::Ban => Ok(BounceOutcome::Forbidden),
            Remediation::Captcha => {
                let submission = CaptchaSubmission {
                    is_post: request.method.eq_ignore_ascii_case("POST"),
                    refresh: request
                        .form
                        .get("refresh")
                        .map(|v| v == "1")
                        .unwrap_or(false),
                    phrase: request.form.get("phrase").cloned(),
                    referer: request.referer.clone(),
                };
                Ok(match self.captcha.step(ip, &submission).await? {
                    CaptchaAction::Allow => BounceOutcome::Proceed,
                    CaptchaAction::Redirect(url) => BounceOutcome::Redirect(url),
                    CaptchaAction::Challenge {
                        inline_image,
                        error,
                    } => BounceOutcome::Challenge {
                        inline_image,
                        error,
                    },
                })
            }
        }
    }

    fn effective_ip(&self, request: &BounceRequest) -> Result<IpAddr> {
        if let Some(forced) = &self.config.forced_test_ip {
            return parse_ip(forced);
        }
        let header = self
            .config
            .forced_test_forwarded_ip
            .as_deref()
            .or(request.x_forwarded_for.as_deref());
        Ok(self.forwarded.effective_ip(request.peer, header))
    }
}
