//! Geolocation collaborator
//!
//! Country resolution is an opaque collaborator (typically a memory-mapped
//! MaxMind database). The wrapper memoises results in the cache so repeat
//! visitors do not pay the lookup.

use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::{unix_now, CacheStore};
use crate::error::Result;

/// Tag carried by geolocation cache entries.
pub const GEOLOCATION_TAG: &str = "geolocation";

/// Resolves an IP to an ISO-3166 alpha-2 country code.
pub trait GeoProvider: Send + Sync {
    fn country(&self, ip: IpAddr) -> Option<String>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeoRecord {
    country: Option<String>,
}

/// Memoising wrapper around a [`GeoProvider`].
pub struct CachedGeo {
    provider: Arc<dyn GeoProvider>,
    store: Arc<CacheStore>,
    cache_duration: u64,
    save_result: bool,
}

impl CachedGeo {
    pub fn new(
        provider: Arc<dyn GeoProvider>,
        store: Arc<CacheStore>,
        cache_duration: u64,
        save_result: bool,
    ) -> Self {
        Self {
            provider,
            store,
            cache_duration,
            save_result,
        }
    }

    pub async fn country(&self, ip: IpAddr) -> Result<Option<String>> {
        let key = format!("geo_ip_{ip}");

        if self.save_result {
            if let Some(env) = self.store.get(&key).await? {
                let record: GeoRecord = serde_json::from_value(env.payload)
                    .map_err(|e| crate::error::BouncerError::CacheVersion(format!("{key}: {e}")))?;
                return Ok(record.country);
            }
        }

        let country = self.provider.country(ip);

        if self.save_result {
            let record = GeoRecord {
                country: country.clone(),
            };
            self.store
                .put(
                    &key,
                    serde_json::to_value(record).unwrap_or_default(),
                    Some(unix_now() + self.cache_duration),
                    &[GEOLOCATION_TAG],
                )
                .await;
        }

        Ok(country)
    }
}

/// Fixed-table provider for tests and air-gapped deployments.
#[derive(Default)]
pub struct StaticGeoProvider {
    entries: Vec<(ipnet::IpNet, String)>,
}

impl StaticGeoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, net: ipnet::IpNet, country: &str) -> Self {
        self.entries.push((net, country.to_ascii_uppercase()));
        self
    }
}

impl GeoProvider for StaticGeoProvider {
    fn country(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .iter()
            .find(|(net, _)| net.contains(&ip))
            .map(|(_, cc)| cc.clone())
    }
}
