//! Per-IP CAPTCHA challenge lifecycle
//!
//! Challenge state lives in the cache under the visitor's IP and spans
//! multiple round-trips: arm, re-render, refresh, verify, redirect. A
//! resolved entry persists for the CAPTCHA cache window so a verified
//! user is not re-challenged.

use std::net::IpAddr;
use std::sync::Arc;

use base64::engine::general_purpose;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::{unix_now, CacheStore};
use crate::error::{BouncerError, Result};

/// Tag carried by CAPTCHA cache entries.
pub const CAPTCHA_TAG: &str = "captcha";

const PHRASE_LENGTH: usize = 5;
const PHRASE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Persisted challenge state for one IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaState {
    pub phrase_to_guess: String,
    pub inline_image: String,
    pub has_to_be_resolved: bool,
    pub resolution_failed: bool,
    pub resolution_redirect: String,
}

/// What the challenge endpoint received this round-trip.
#[derive(Debug, Clone)]
pub struct CaptchaSubmission {
    pub is_post: bool,
    pub refresh: bool,
    pub phrase: Option<String>,
    pub referer: Option<String>,
}

/// Next HTTP action decided by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptchaAction {
    /// Render the challenge page (HTTP 401).
    Challenge { inline_image: String, error: bool },
    /// The phrase matched; send the visitor back where they came from.
    Redirect(String),
    /// Already resolved within the cache window; let the request through.
    Allow,
}

pub struct CaptchaPipeline {
    store: Arc<CacheStore>,
    cache_duration: u64,
}

impl CaptchaPipeline {
    pub fn new(store: Arc<CacheStore>, cache_duration: u64) -> Self {
        Self {
            store,
            cache_duration,
        }
    }

    /// Advance the state machine for `ip` and return the HTTP action.
    pub async fn step(&self, ip: IpAddr, submission: &CaptchaSubmission) -> Result<CaptchaAction> {
        let key = Self::state_key(ip);

        let state = match self.load(&key).await? {
            Some(state) => state,
            None => {
                let state = Self::arm(submission.referer.as_deref());
                info!(ip = %ip, "issuing captcha challenge");
                let action = CaptchaAction::Challenge {
                    inline_image: state.inline_image.clone(),
                    error: false,
                };
                self.save(&key, &state).await?;
                return Ok(action);
            }
        };

        if !state.has_to_be_resolved {
            return Ok(CaptchaAction::Allow);
        }

        if submission.is_post && submission.refresh {
            let mut state = state;
            let (phrase, image) = generate_challenge();
            state.phrase_to_guess = phrase;
            state.inline_image = image.clone();
            state.resolution_failed = false;
            self.save(&key, &state).await?;
            return Ok(CaptchaAction::Challenge {
                inline_image: image,
                error: false,
            });
        }

        if submission.is_post {
            if let Some(guess) = &submission.phrase {
                let mut state = state;
                if phrase_match(&state.phrase_to_guess, guess) {
                    info!(ip = %ip, "captcha resolved");
                    state.has_to_be_resolved = false;
                    state.resolution_failed = false;
                    state.phrase_to_guess = String::new();
                    state.inline_image = String::new();
                    let redirect = state.resolution_redirect.clone();
                    self.save(&key, &state).await?;
                    return Ok(CaptchaAction::Redirect(redirect));
                }
                info!(ip = %ip, "captcha attempt failed");
                state.resolution_failed = true;
                let image = state.inline_image.clone();
                self.save(&key, &state).await?;
                return Ok(CaptchaAction::Challenge {
                    inline_image: image,
                    error: true,
                });
            }
        }

        // Plain GET while armed: re-render the current challenge.
        Ok(CaptchaAction::Challenge {
            inline_image: state.inline_image.clone(),
            error: state.resolution_failed,
        })
    }

    fn state_key(ip: IpAddr) -> String {
        format!("captcha_ip_{ip}")
    }

    fn arm(referer: Option<&str>) -> CaptchaState {
        let (phrase, image) = generate_challenge();
        CaptchaState {
            phrase_to_guess: phrase,
            inline_image: image,
            has_to_be_resolved: true,
            resolution_failed: false,
            resolution_redirect: referer
                .filter(|r| !r.is_empty())
                .unwrap_or("/")
                .to_string(),
        }
    }

    async fn load(&self, key: &str) -> Result<Option<CaptchaState>> {
        match self.store.get(key).await? {
            Some(env) => serde_json::from_value(env.payload)
                .map(Some)
                .map_err(|e| BouncerError::CacheVersion(format!("{key}: {e}"))),
            None => Ok(None),
        }
    }

    async fn save(&self, key: &str, state: &CaptchaState) -> Result<()> {
        let payload = serde_json::to_value(state)
            .map_err(|e| BouncerError::Storage(format!("captcha state: {e}")))?;
        self.store
            .put(
                key,
                payload,
                Some(unix_now() + self.cache_duration),
                &[CAPTCHA_TAG],
            )
            .await;
        self.store.commit().await?;
        Ok(())
    }
}

/// Case-insensitive phrase comparison tolerating the classic `0`/`o` and
/// `1`/`l` confusions.
pub fn phrase_match(expected: &str, guess: &str) -> bool {
    fn canonical(s: &str) -> String {
        s.trim()
            .to_ascii_lowercase()
            .chars()
            .map(|c| match c {
                '0' => 'o',
                '1' => 'l',
                other => other,
            })
            .collect()
    }
    !expected.is_empty() && canonical(expected) == canonical(guess)
}

/// Generate a phrase and its inline image as a base64 data URL.
fn generate_challenge() -> (String, String) {
    let mut rng = rand::thread_rng();
    let phrase: String = (0..PHRASE_LENGTH)
        .map(|_| PHRASE_ALPHABET[rng.gen_range(0..PHRASE_ALPHABET.len())] as char)
        .collect();

    let image = render_svg(&phrase, &mut rng);
    let data_url = format!(
        "data:image/svg+xml;base64,{}",
        general_purpose::STANDARD.encode(image)
    );
    (phrase, data_url)
}

// Each glyph gets its own jittered rotation so the rendered text does not
// OCR as cleanly as plain markup would.
fn render_svg<R: Rng>(phrase: &str, rng: &mut R) -> String {
    let mut glyphs = String::new();
    for (i, c) in phrase.chars().enumerate() {
        let x = 18 + i * 28;
        let angle: i32 = rng.gen_range(-25..=25);
        let y: i32 = rng.gen_range(32..=40);
        glyphs.push_str(&format!(
            "<text x=\"{x}\" y=\"{y}\" transform=\"rotate({angle} {x} {y})\" \
             font-size=\"28\" font-family=\"monospace\">{c}</text>"
        ));
    }
    format!(
        "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"170\" height=\"60\">\
         <rect width=\"100%\" height=\"100%\" fill=\"#f0f0f0\"/>{glyphs}</svg>"
    )
}
