//! Threatgate - HTTP bouncer middleware
//!
//! Evaluates every request's source IP against a threat-intelligence
//! decision feed (LAPI) and allows, challenges, or denies:
//! - Tag-aware decision cache (filesystem, Memcached, Redis)
//! - LIVE (query-through) and STREAM (cache-is-truth) operating modes
//! - Scope-aware verdict resolution (IP, CIDR range, country)
//! - Per-IP CAPTCHA challenge state machine

pub mod bouncer;
pub mod cache;
pub mod captcha;
pub mod config;
pub mod decision;
pub mod error;
pub mod forwarded;
pub mod geo;
pub mod lapi;
pub mod proxy;
pub mod remediation;
pub mod resolver;
pub mod server;
pub mod stream;
