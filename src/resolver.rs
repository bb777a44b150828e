//! Remediation resolution for a single IP
//!
//! Walks the enabled scopes (exact IP, CIDR ranges, country), merges the
//! cached decisions covering the address, and returns the highest-priority
//! verdict after the operator cap. In LIVE mode a miss consults LAPI and
//! materialises the answer; in STREAM mode the cache is the sole truth.

use std::net::IpAddr;
use std::sync::Arc;

use tracing::warn;

use crate::cache::{unix_now, CONFIG_KEY};
use crate::decision::{
    add_parts, scoped_key, DecisionIndex, Scope, StoredDecision, BYPASS_SENTINEL_ID,
};
use crate::error::{BouncerError, Result};
use crate::geo::CachedGeo;
use crate::lapi::{DecisionFilter, LapiClient};
use crate::remediation::Remediation;

/// Operator-configured ceiling on returned verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BouncingLevel {
    /// Never bounce; every verdict collapses to `bypass`.
    Disabled,
    /// Bounce softly; verdicts cap at `captcha`.
    Flex,
    /// Full enforcement up to `ban`.
    Normal,
}

impl BouncingLevel {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "disabled" => Ok(BouncingLevel::Disabled),
            "flex" => Ok(BouncingLevel::Flex),
            "normal" => Ok(BouncingLevel::Normal),
            other => Err(BouncerError::Config(format!(
                "invalid bouncing level {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub stream_mode: bool,
    pub fallback: Remediation,
    pub bouncing_level: BouncingLevel,
    pub max_remediation: Remediation,
    pub clean_ip_cache_duration: u64,
    pub bad_ip_cache_duration: u64,
    pub geolocation_enabled: bool,
}

pub struct Resolver {
    index: Arc<DecisionIndex>,
    lapi: Option<Arc<dyn LapiClient>>,
    geo: Option<Arc<CachedGeo>>,
    config: ResolverConfig,
}

/// Parse an IP, tolerating and stripping a zone id suffix.
pub fn parse_ip(raw: &str) -> Result<IpAddr> {
    let bare = match raw.find('%') {
        Some(idx) => &raw[..idx],
        None => raw,
    };
    bare.trim()
        .parse::<IpAddr>()
        .map_err(|_| BouncerError::Input(format!("invalid IP {raw:?}")))
}

impl Resolver {
    pub fn new(
        index: Arc<DecisionIndex>,
        lapi: Option<Arc<dyn LapiClient>>,
        geo: Option<Arc<CachedGeo>>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            index,
            lapi,
            geo,
            config,
        }
    }

    /// Resolve the verdict for one address.
    pub async fn remediation_for_ip(&self, raw_ip: &str) -> Result<Remediation> {
        let ip = parse_ip(raw_ip)?;

        if self.config.stream_mode {
            self.ensure_warmed_up().await?;
        }

        let mut hits: Vec<StoredDecision> = Vec::new();

        // Exact IP scope. The LIVE miss path runs first so any ranged or
        // country decisions LAPI returns are already materialised before
        // the broader scopes are read.
        let ip_key = scoped_key(Scope::Ip, &ip.to_string());
        let mut ip_members = self.index.load_active(&ip_key).await?;
        if ip_members.is_empty() && !self.config.stream_mode {
            self.live_fill(&DecisionFilter::Ip(ip.to_string()), &ip_key)
                .await?;
            ip_members = self.index.load_active(&ip_key).await?;
        }
        hits.extend(ip_members);

        // Range scope: every catalogued CIDR containing the address.
        for net in self.index.ranges().await? {
            if net.contains(&ip) {
                let key = scoped_key(Scope::Range, &net.to_string());
                hits.extend(self.index.load_active(&key).await?);
            }
        }

        // Country scope.
        if self.config.geolocation_enabled {
            if let Some(geo) = &self.geo {
                if let Some(country) = geo.country(ip).await? {
                    let key = scoped_key(Scope::Country, &country);
                    let mut country_members = self.index.load_active(&key).await?;
                    if country_members.is_empty() && !self.config.stream_mode {
                        self.live_fill(
                            &DecisionFilter::ScopeValue {
                                scope: "Country".to_string(),
                                value: country.clone(),
                            },
                            &key,
                        )
                        .await?;
                        country_members = self.index.load_active(&key).await?;
                    }
                    hits.extend(country_members);
                }
            }
        }

        // Flush sentinel/geo writes; a failing backend must not block the
        // verdict that is already in hand.
        if let Err(e) = self.index.store().commit().await {
            warn!(error = %e, "cache commit failed, continuing with resolved verdict");
        }

        let verdict = hits
            .iter()
            .max_by_key(|m| (m.kind.priority(), m.expires_at, m.id))
            .map(|m| m.kind)
            .unwrap_or(Remediation::Bypass);

        Ok(self.cap(verdict))
    }

    /// Query LAPI for a missed scope and materialise the response. An
    /// empty response stores a clean marker so the next request within
    /// `clean_ip_cache_duration` stays local.
    async fn live_fill(&self, filter: &DecisionFilter, miss_key: &str) -> Result<()> {
        let lapi = match &self.lapi {
            Some(lapi) => lapi,
            None => return Ok(()),
        };

        let decisions = match lapi.filtered_decisions(filter).await {
            Ok(decisions) => decisions,
            Err(BouncerError::Timeout(budget)) => {
                warn!(event = "LAPI_TIMEOUT", budget_ms = budget.as_millis() as u64, "treating LAPI timeout as empty response");
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        for decision in &decisions {
            match add_parts(
                decision,
                self.config.fallback,
                Some(self.config.bad_ip_cache_duration),
            ) {
                Ok(Some((key, kind, expires_at, id))) => {
                    self.index.upsert(&key, kind, expires_at, id).await?;
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, id = decision.id, "skipping malformed decision"),
            }
        }

        // When nothing landed under the queried key itself (empty answer,
        // or only ranged/country decisions), mark it clean so the next
        // request within `clean_ip_cache_duration` stays local. Broader
        // scopes still outrank the marker.
        if self.index.load_active(miss_key).await?.is_empty() {
            self.index
                .upsert(
                    miss_key,
                    Remediation::Bypass,
                    unix_now() + self.config.clean_ip_cache_duration,
                    BYPASS_SENTINEL_ID,
                )
                .await?;
        }
        Ok(())
    }

    async fn ensure_warmed_up(&self) -> Result<()> {
        let warmed = match self.index.store().get(CONFIG_KEY).await? {
            Some(env) => env
                .payload
                .get("warmed_up")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            None => false,
        };
        if warmed {
            Ok(())
        } else {
            Err(BouncerError::WarmUp(
                "stream cache has not been warmed up".to_string(),
            ))
        }
    }

    fn cap(&self, verdict: Remediation) -> Remediation {
        let verdict = verdict.capped_at(self.config.max_remediation);
        match self.config.bouncing_level {
            BouncingLevel::Disabled => Remediation::Bypass,
            BouncingLevel::Flex => verdict.capped_at(Remediation::Captcha),
            BouncingLevel::Normal => verdict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::memory::InMemoryBackend;
    use crate::cache::CacheStore;
    use crate::decision::Decision;
    use crate::geo::StaticGeoProvider;
    use crate::lapi::DecisionStream;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeLapi {
        decisions: Vec<Decision>,
        calls: AtomicUsize,
    }

    impl FakeLapi {
        fn empty() -> Self {
            Self {
                decisions: Vec::new(),
                calls: AtomicUsize::new(0),
            }
        }

        fn with(decisions: Vec<Decision>) -> Self {
            Self {
                decisions,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl LapiClient for FakeLapi {
        async fn filtered_decisions(&self, _filter: &DecisionFilter) -> Result<Vec<Decision>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.decisions.clone())
        }

        async fn streamed_decisions(&self, _startup: bool) -> Result<DecisionStream> {
            Ok(DecisionStream::default())
        }
    }

    struct TimeoutLapi;

    #[async_trait::async_trait]
    impl LapiClient for TimeoutLapi {
        async fn filtered_decisions(&self, _filter: &DecisionFilter) -> Result<Vec<Decision>> {
            Err(BouncerError::Timeout(std::time::Duration::from_secs(1)))
        }

        async fn streamed_decisions(&self, _startup: bool) -> Result<DecisionStream> {
            Err(BouncerError::Timeout(std::time::Duration::from_secs(1)))
        }
    }

    fn live_config() -> ResolverConfig {
        ResolverConfig {
            stream_mode: false,
            fallback: Remediation::Captcha,
            bouncing_level: BouncingLevel::Normal,
            max_remediation: Remediation::Ban,
            clean_ip_cache_duration: 60,
            bad_ip_cache_duration: 120,
            geolocation_enabled: false,
        }
    }

    fn ban_decision(id: i64, value: &str) -> Decision {
        Decision {
            id,
            kind: "ban".to_string(),
            scope: "Ip".to_string(),
            value: value.to_string(),
            duration: "4h0m0s".to_string(),
            origin: None,
            start_ip: None,
            end_ip: None,
        }
    }

    fn setup(
        lapi: Option<Arc<dyn LapiClient>>,
        config: ResolverConfig,
    ) -> (Arc<DecisionIndex>, Resolver) {
        let store = Arc::new(CacheStore::new(Arc::new(InMemoryBackend::new())));
        let index = Arc::new(DecisionIndex::new(store));
        let resolver = Resolver::new(index.clone(), lapi, None, config);
        (index, resolver)
    }

    #[tokio::test]
    async fn test_invalid_ip_is_input_error() {
        let (_, resolver) = setup(None, live_config());
        let err = resolver.remediation_for_ip("not-an-ip").await.unwrap_err();
        assert!(matches!(err, BouncerError::Input(_)));
    }

    #[tokio::test]
    async fn test_zone_id_is_stripped() {
        let (_, resolver) = setup(Some(Arc::new(FakeLapi::empty())), live_config());
        let verdict = resolver
            .remediation_for_ip("fe80::1%eth0")
            .await
            .unwrap();
        assert_eq!(verdict, Remediation::Bypass);
    }

    #[tokio::test]
    async fn test_live_empty_response_stores_clean_marker() {
        let (index, resolver) = setup(Some(Arc::new(FakeLapi::empty())), live_config());
        let verdict = resolver.remediation_for_ip("1.2.3.4").await.unwrap();
        assert_eq!(verdict, Remediation::Bypass);

        let members = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].kind, Remediation::Bypass);
        assert_eq!(members[0].id, BYPASS_SENTINEL_ID);
    }

    #[tokio::test]
    async fn test_live_ban_is_cached_and_served_from_cache() {
        let lapi = Arc::new(FakeLapi::with(vec![ban_decision(1, "1.2.3.4")]));
        let store = Arc::new(CacheStore::new(Arc::new(InMemoryBackend::new())));
        let index = Arc::new(DecisionIndex::new(store));
        let resolver = Resolver::new(index.clone(), Some(lapi.clone()), None, live_config());

        assert_eq!(
            resolver.remediation_for_ip("1.2.3.4").await.unwrap(),
            Remediation::Ban
        );
        assert_eq!(
            resolver.remediation_for_ip("1.2.3.4").await.unwrap(),
            Remediation::Ban
        );
        // Second request was answered from the cache.
        assert_eq!(lapi.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_miss_never_calls_lapi() {
        let lapi = Arc::new(FakeLapi::empty());
        let store = Arc::new(CacheStore::new(Arc::new(InMemoryBackend::new())));
        store
            .put(
                CONFIG_KEY,
                serde_json::json!({"warmed_up": true}),
                None,
                &[],
            )
            .await;
        store.commit().await.unwrap();
        let index = Arc::new(DecisionIndex::new(store));
        let mut config = live_config();
        config.stream_mode = true;
        let resolver = Resolver::new(index, Some(lapi.clone()), None, config);

        assert_eq!(
            resolver.remediation_for_ip("1.2.3.4").await.unwrap(),
            Remediation::Bypass
        );
        assert_eq!(lapi.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stream_not_warmed_refuses_to_serve() {
        let (_, resolver) = setup(None, {
            let mut c = live_config();
            c.stream_mode = true;
            c
        });
        let err = resolver.remediation_for_ip("1.2.3.4").await.unwrap_err();
        assert!(matches!(err, BouncerError::WarmUp(_)));
    }

    #[tokio::test]
    async fn test_flex_caps_ban_to_captcha_on_read_only() {
        let lapi = Arc::new(FakeLapi::with(vec![ban_decision(1, "1.2.3.4")]));
        let store = Arc::new(CacheStore::new(Arc::new(InMemoryBackend::new())));
        let index = Arc::new(DecisionIndex::new(store));
        let mut config = live_config();
        config.bouncing_level = BouncingLevel::Flex;
        let resolver = Resolver::new(index.clone(), Some(lapi), None, config);

        assert_eq!(
            resolver.remediation_for_ip("1.2.3.4").await.unwrap(),
            Remediation::Captcha
        );
        // The raw ban tuple is stored; the cap applies only on read.
        let members = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(members[0].kind, Remediation::Ban);
    }

    #[tokio::test]
    async fn test_disabled_forces_bypass_for_every_input() {
        let lapi = Arc::new(FakeLapi::with(vec![ban_decision(1, "1.2.3.4")]));
        let mut config = live_config();
        config.bouncing_level = BouncingLevel::Disabled;
        let (_, resolver) = setup(Some(lapi), config);

        assert_eq!(
            resolver.remediation_for_ip("1.2.3.4").await.unwrap(),
            Remediation::Bypass
        );
    }

    #[tokio::test]
    async fn test_range_decision_covers_contained_ip() {
        let (index, resolver) = setup(Some(Arc::new(FakeLapi::empty())), live_config());
        index
            .upsert(
                "range_10.0.0.0/8",
                Remediation::Ban,
                unix_now() + 3600,
                9,
            )
            .await
            .unwrap();
        index.store().commit().await.unwrap();

        assert_eq!(
            resolver.remediation_for_ip("10.1.2.3").await.unwrap(),
            Remediation::Ban
        );
        assert_eq!(
            resolver.remediation_for_ip("11.1.2.3").await.unwrap(),
            Remediation::Bypass
        );
    }

    #[tokio::test]
    async fn test_country_scope_via_geo_provider() {
        let store = Arc::new(CacheStore::new(Arc::new(InMemoryBackend::new())));
        let index = Arc::new(DecisionIndex::new(store.clone()));
        index
            .upsert("country_JP", Remediation::Captcha, unix_now() + 3600, 2)
            .await
            .unwrap();
        store.commit().await.unwrap();

        let geo = Arc::new(CachedGeo::new(
            Arc::new(
                StaticGeoProvider::new().with_entry("203.0.113.0/24".parse().unwrap(), "JP"),
            ),
            store,
            3600,
            true,
        ));
        let mut config = live_config();
        config.geolocation_enabled = true;
        let resolver = Resolver::new(index, Some(Arc::new(FakeLapi::empty())), Some(geo), config);

        assert_eq!(
            resolver.remediation_for_ip("203.0.113.5").await.unwrap(),
            Remediation::Captcha
        );
    }

    #[tokio::test]
    async fn test_lapi_timeout_degrades_to_bypass() {
        let (index, resolver) = setup(Some(Arc::new(TimeoutLapi)), live_config());
        assert_eq!(
            resolver.remediation_for_ip("1.2.3.4").await.unwrap(),
            Remediation::Bypass
        );
        // Timeout behaves exactly like an empty response.
        let members = index.load_active("ip_1.2.3.4").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].kind, Remediation::Bypass);
    }

    #[tokio::test]
    async fn test_highest_priority_wins_across_scopes() {
        let (index, resolver) = setup(Some(Arc::new(FakeLapi::empty())), live_config());
        index
            .upsert("ip_10.1.2.3", Remediation::Captcha, unix_now() + 3600, 1)
            .await
            .unwrap();
        index
            .upsert("range_10.0.0.0/8", Remediation::Ban, unix_now() + 3600, 2)
            .await
            .unwrap();
        index.store().commit().await.unwrap();

        assert_eq!(
            resolver.remediation_for_ip("10.1.2.3").await.unwrap(),
            Remediation::Ban
        );
    }
}
